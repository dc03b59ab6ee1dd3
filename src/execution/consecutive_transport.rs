use std::{sync::{atomic::{AtomicIsize, AtomicU8, Ordering}, Arc, Weak}, time::{Duration, Instant}};

use parking_lot::Mutex;
use tracing::{debug, trace_span};

use crate::error::ExecError;

use super::{dispatcher::Dispatcher, message::Message, plan::StackEntry, ring::RingBuffer, signal::Latch, transport::{Downstream, Transport}};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;

/// Timing of one transport (or source) for the execution statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportProfile {
    pub node_type: String,
    pub label: String,
    pub count: u64,
    pub total_duration: Duration,
}

impl TransportProfile {
    pub fn new(node_type: impl Into<String>, label: impl Into<String>) -> TransportProfile {
        TransportProfile { node_type: node_type.into(), label: label.into(), ..Default::default() }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total_duration += elapsed;
    }
}

/// The operator at the end of an edge. Shared by every edge that feeds it, so
/// deliveries into one operator never overlap.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub fn shared_transport(t: impl Transport + 'static) -> SharedTransport {
    Arc::new(Mutex::new(Box::new(t)))
}

/// Delivers the messages of one edge to its operator, one at a time and in order.
///
/// Messages are queued in a mailbox and drained by a function scheduled on the
/// dispatcher. At most one drain runs per edge. The edge finishes on the first
/// error or after delivering `Finish`. In both cases the operator sees exactly one
/// `Finish`.
pub struct ConsecutiveTransport {
    me: Weak<ConsecutiveTransport>,
    dispatcher: Arc<dyn Dispatcher>,
    t: SharedTransport,
    messages: Mutex<RingBuffer<Message>>,
    inflight: AtomicIsize,
    state: AtomicU8,
    finished: Latch,
    err: Mutex<Option<ExecError>>,
    stack: Vec<StackEntry>,
    node_type: String,
    label: String,
    timing: Mutex<(u64, Duration)>,
}

impl ConsecutiveTransport {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, t: SharedTransport, node_type: impl Into<String>,
            label: impl Into<String>, stack: Vec<StackEntry>, capacity: usize) -> Arc<ConsecutiveTransport> {
        Arc::new_cyclic(|me| ConsecutiveTransport {
            me: me.clone(),
            dispatcher,
            t,
            messages: Mutex::new(RingBuffer::with_capacity(capacity)),
            inflight: AtomicIsize::new(0),
            state: AtomicU8::new(IDLE),
            finished: Latch::new(),
            err: Mutex::new(None),
            stack,
            node_type: node_type.into(),
            label: label.into(),
            timing: Mutex::new((0, Duration::ZERO)),
        })
    }

    /// Fires once the edge is done, successfully or not.
    pub fn finished(&self) -> &Latch {
        &self.finished
    }

    pub fn err(&self) -> Option<ExecError> {
        self.err.lock().clone()
    }

    pub fn profile(&self) -> TransportProfile {
        let (count, total_duration) = *self.timing.lock();
        TransportProfile { node_type: self.node_type.clone(), label: self.label.clone(), count, total_duration }
    }

    /// Drops whatever is still queued on an edge that will never be drained. Only
    /// call this once the dispatcher stopped.
    pub fn abandon(&self) {
        let abandoned = {
            let mut messages = self.messages.lock();
            self.state.store(FINISHED, Ordering::SeqCst);
            self.inflight.store(0, Ordering::SeqCst);
            std::mem::replace(&mut *messages, RingBuffer::with_capacity(0))
        };
        if !abandoned.is_empty() {
            debug!(label = %self.label, op = %self.node_type, messages = abandoned.len(), "abandoned edge");
        }
    }

    fn schedule(&self) {
        if !self.try_transition(IDLE, RUNNING) {
            return;
        }
        match self.me.upgrade() {
            Some(me) => self.dispatcher.schedule(Box::new(move |throughput| me.process_messages(throughput))),
            // nobody holds the edge anymore, there is nothing left to deliver to
            None => self.state.store(IDLE, Ordering::SeqCst),
        }
    }

    fn try_transition(&self, from: u8, to: u8) -> bool {
        self.state.compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    fn process_messages(&self, throughput: usize) {
        loop {
            let mut processed = 0;
            while let Some(m) = self.pop() {
                self.inflight.fetch_sub(1, Ordering::SeqCst);
                let src = m.src().clone();
                let is_finish = m.is_finish();
                let result = self.process_message(m);
                if result.is_err() || is_finish {
                    if let Err(err) = result {
                        self.set_err(err);
                    }
                    if self.try_transition(RUNNING, FINISHED) {
                        if !is_finish {
                            let _ = self.t.lock().process_message(Message::Finish { src, err: self.err() });
                        }
                        debug!(label = %self.label, op = %self.node_type, error = ?self.err(), "transport finished");
                        // whatever is still queued will never be delivered
                        self.messages.lock().clear();
                        self.finished.fire();
                        return;
                    }
                }
                processed += 1;
                if processed >= throughput {
                    self.state.store(IDLE, Ordering::SeqCst);
                    self.schedule();
                    return;
                }
            }

            self.state.store(IDLE, Ordering::SeqCst);
            // A message may have been pushed after the mailbox looked empty but before
            // the edge went idle. Nobody scheduled a drain for it, so take it ourselves.
            if self.inflight.load(Ordering::SeqCst) > 0 && self.try_transition(IDLE, RUNNING) {
                continue;
            }
            return;
        }
    }

    fn pop(&self) -> Option<Message> {
        self.messages.lock().pop()
    }

    fn process_message(&self, m: Message) -> Result<(), ExecError> {
        let span = trace_span!("process_message", op = %self.node_type, label = %self.label, message = %m.message_type());
        let _enter = span.enter();
        let start = Instant::now();
        let result = self.t.lock().process_message(m);
        let mut timing = self.timing.lock();
        timing.0 += 1;
        timing.1 += start.elapsed();
        result
    }

    fn set_err(&self, err: ExecError) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(err.with_location(self.source_info()));
        }
    }

    // The deepest call in the file the node was declared in.
    fn source_info(&self) -> Option<String> {
        let file = &self.stack.last()?.location.file;
        let entry = self.stack.iter()
            .find(|e| &e.location.file == file)
            .or_else(|| self.stack.first())?;
        Some(format!("@{}: {}", entry.location, entry.function_name))
    }
}

impl Downstream for ConsecutiveTransport {
    fn send(&self, m: Message) -> Result<(), ExecError> {
        {
            // The finishing drain clears the mailbox under this lock after it went to
            // FINISHED, so nothing pushed here can be left behind.
            let mut messages = self.messages.lock();
            if self.state.load(Ordering::SeqCst) == FINISHED {
                drop(messages);
                m.ack();
                return match self.err() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            messages.push(m);
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        self.schedule();
        Ok(())
    }
}
