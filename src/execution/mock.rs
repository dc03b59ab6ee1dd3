// Hand written test doubles shared by the execution tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{error::ExecError, memory::Allocator, types::{DataType, Value}};

use super::{group_key::{ColMeta, GroupKey}, message::Message, table::{Chunk, Column, Table}, transport::{Downstream, Transport}};

pub fn string_key(value: &str) -> GroupKey {
    GroupKey::from_pairs(vec![("t0", Value::String(value.to_string()))])
}

pub fn int_chunk(alloc: &Arc<Allocator>, key: &GroupKey, values: Vec<i64>) -> Chunk {
    Chunk::new(key.clone(), vec![ColMeta::new("_value", DataType::Int)],
        vec![Column::Int(values.into_iter().map(Some).collect())], alloc).unwrap()
}

/// Keeps every message it is sent.
#[derive(Default)]
pub struct RecordingDownstream {
    messages: Mutex<Vec<Message>>,
}

impl RecordingDownstream {
    pub fn new() -> Arc<RecordingDownstream> {
        Arc::new(RecordingDownstream::default())
    }

    pub fn message_types(&self) -> Vec<String> {
        self.messages.lock().iter().map(|m| m.message_type().to_string()).collect()
    }

    pub fn finish_error(&self) -> Option<ExecError> {
        self.messages.lock().iter().find_map(|m| match m {
            Message::Finish { err, .. } => err.clone(),
            _ => None,
        })
    }

    /// Whole tables received so far.
    pub fn tables(&self) -> Vec<Table> {
        self.messages.lock().iter().filter_map(|m| match m {
            Message::Process { table, .. } => Some(table.clone()),
            _ => None,
        }).collect()
    }

    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }
}

impl Downstream for RecordingDownstream {
    fn send(&self, m: Message) -> Result<(), ExecError> {
        self.messages.lock().push(m);
        Ok(())
    }
}

/// Hands messages straight to a transport on the sending thread.
pub struct TransportDownstream {
    t: Mutex<Box<dyn Transport>>,
}

impl TransportDownstream {
    pub fn new(t: impl Transport + 'static) -> TransportDownstream {
        TransportDownstream { t: Mutex::new(Box::new(t)) }
    }
}

impl Downstream for TransportDownstream {
    fn send(&self, m: Message) -> Result<(), ExecError> {
        self.t.lock().process_message(m)
    }
}
