use std::collections::HashMap;

use crate::error::ExecError;

use super::{context::ExecutionContext, message::DatasetId, plan::ProcedureSpec, transport::Transport};

/// A leaf of the plan. Runs on its own thread and pushes everything it produces
/// into the context's outputs, ending with a `Finish`.
pub trait Source: Send {
    fn run(&mut self);
}

pub type SourceFactory = Box<dyn Fn(&dyn ProcedureSpec, DatasetId, &ExecutionContext) -> Result<Box<dyn Source>, ExecError> + Send + Sync>;
pub type TransformationFactory = Box<dyn Fn(&dyn ProcedureSpec, DatasetId, &ExecutionContext) -> Result<Box<dyn Transport>, ExecError> + Send + Sync>;

/// Factories for sources and transformations, keyed by procedure kind.
#[derive(Default)]
pub struct Registry {
    sources: HashMap<String, SourceFactory>,
    transformations: HashMap<String, TransformationFactory>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register_source<F>(&mut self, kind: &str, factory: F) -> Result<(), ExecError>
    where F: Fn(&dyn ProcedureSpec, DatasetId, &ExecutionContext) -> Result<Box<dyn Source>, ExecError> + Send + Sync + 'static {
        if self.sources.contains_key(kind) {
            return Err(ExecError::invalid(format!("duplicate registration for source kind {}", kind)));
        }
        self.sources.insert(kind.to_string(), Box::new(factory));
        Ok(())
    }

    pub fn register_transformation<F>(&mut self, kind: &str, factory: F) -> Result<(), ExecError>
    where F: Fn(&dyn ProcedureSpec, DatasetId, &ExecutionContext) -> Result<Box<dyn Transport>, ExecError> + Send + Sync + 'static {
        if self.transformations.contains_key(kind) {
            return Err(ExecError::invalid(format!("duplicate registration for transformation kind {}", kind)));
        }
        self.transformations.insert(kind.to_string(), Box::new(factory));
        Ok(())
    }

    pub fn source(&self, kind: &str) -> Option<&SourceFactory> {
        self.sources.get(kind)
    }

    pub fn transformation(&self, kind: &str) -> Option<&TransformationFactory> {
        self.transformations.get(kind)
    }
}

/// Gets the concrete spec a factory was registered for.
pub fn downcast_spec<'a, T: 'static>(spec: &'a dyn ProcedureSpec) -> Result<&'a T, ExecError> {
    spec.as_any().downcast_ref::<T>()
        .ok_or_else(|| ExecError::internal(format!("invalid spec type for kind {}", spec.kind())))
}
