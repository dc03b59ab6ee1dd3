use std::{collections::VecDeque, sync::Arc};

use parking_lot::{Condvar, Mutex};

use crate::error::ExecError;

use super::{message::Message, table::{BuilderCache, Table}, transport::Downstream};

#[derive(Default)]
struct ResultState {
    tables: VecDeque<Table>,
    chunks: BuilderCache,
    done: bool,
    err: Option<ExecError>,
    err_reported: bool,
}

struct Inner {
    name: String,
    state: Mutex<ResultState>,
    cv: Condvar,
}

/// The stream of tables for one named result of an execution.
///
/// Chunked input is buffered per key and becomes a table when the key is flushed
/// or the input finishes. Readers block in [`QueryResult::next_table`] until a
/// table is ready or the stream ended.
#[derive(Clone)]
pub struct QueryResult {
    inner: Arc<Inner>,
}

impl QueryResult {
    pub fn new(name: impl Into<String>) -> QueryResult {
        QueryResult {
            inner: Arc::new(Inner { name: name.into(), state: Mutex::new(ResultState::default()), cv: Condvar::new() }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The next table. `None` once the stream ended successfully, `Some(Err)` once
    /// if it failed.
    pub fn next_table(&self) -> Option<Result<Table, ExecError>> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(err) = state.err.clone() {
                if state.err_reported {
                    return None;
                }
                state.err_reported = true;
                state.tables.clear();
                return Some(Err(err));
            }
            if let Some(table) = state.tables.pop_front() {
                return Some(Ok(table));
            }
            if state.done {
                return None;
            }
            self.inner.cv.wait(&mut state);
        }
    }

    /// Reads the stream to its end.
    pub fn collect(&self) -> Result<Vec<Table>, ExecError> {
        let mut tables = Vec::new();
        while let Some(table) = self.next_table() {
            tables.push(table?);
        }
        Ok(tables)
    }

    /// The error the stream ended with.
    pub fn err(&self) -> Option<ExecError> {
        self.inner.state.lock().err.clone()
    }

    /// Ends the stream with an error, unless it already ended cleanly.
    pub fn abort(&self, err: ExecError) {
        let mut state = self.inner.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        state.err = Some(err);
        state.chunks = BuilderCache::new();
        self.inner.cv.notify_all();
    }

    fn finish(&self, state: &mut ResultState, err: Option<ExecError>) {
        let err = match err {
            Some(err) => Some(err),
            None => match state.chunks.take_all() {
                Ok(tables) => {
                    state.tables.extend(tables);
                    None
                },
                Err(err) => Some(err),
            },
        };
        if err.is_some() {
            state.chunks = BuilderCache::new();
        }
        state.err = err;
        state.done = true;
        self.inner.cv.notify_all();
    }
}

impl Downstream for QueryResult {
    fn send(&self, m: Message) -> Result<(), ExecError> {
        let mut state = self.inner.state.lock();
        if state.done {
            m.ack();
            return Ok(());
        }
        match m {
            Message::Process { table, .. } => state.tables.push_back(table),
            Message::ProcessChunk { chunk, .. } => state.chunks.append(chunk)?,
            Message::FlushKey { key, .. } => {
                if let Some(table) = state.chunks.take_table(&key)? {
                    state.tables.push_back(table);
                }
            },
            Message::Finish { err, .. } => {
                self.finish(&mut state, err);
                return Ok(());
            },
            Message::RetractTable { .. } | Message::UpdateWatermark { .. } | Message::UpdateProcessingTime { .. } => {
                return Ok(());
            },
        }
        self.inner.cv.notify_all();
        Ok(())
    }
}
