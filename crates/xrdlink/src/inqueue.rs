//! Session-wide incoming message queue.
//!
//! All streams of a logical session deliver their inbound messages
//! here. Callers waiting for a response register a handler with an
//! expiry; the first handler whose filter matches an arriving message
//! consumes it. Messages nobody has claimed yet sit in a backlog.
//! Only the primary stream drives timeout and fail-all dispatch, so a
//! multi-stream session never double-fails its handlers.

use crate::error::{Fault, LinkError};
use crate::message::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Receiver of one inbound message, or of the session's failure.
pub trait ResponseHandler: Send + Sync {
    /// Whether this handler wants `msg`.
    fn matches(&self, msg: &Message) -> bool;

    /// Delivers the matched message. Called at most once.
    fn on_response(&self, msg: Message);

    /// Delivers a terminal failure instead of a message. Called at
    /// most once.
    fn on_error(&self, fault: &Fault);
}

struct PendingHandler {
    handler: Arc<dyn ResponseHandler>,
    expires: u64,
}

/// Messages kept while no handler wants them. Bounds memory if a peer
/// floods unsolicited traffic.
const BACKLOG_LIMIT: usize = 256;

/// The shared incoming queue of one session.
#[derive(Default)]
pub struct InQueue {
    inner: Mutex<InQueueInner>,
}

#[derive(Default)]
struct InQueueInner {
    handlers: Vec<PendingHandler>,
    backlog: VecDeque<Message>,
}

impl InQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers an inbound message: the first matching handler consumes
    /// it, otherwise it joins the backlog.
    pub fn add_message(&self, msg: Message) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.handlers.iter().position(|p| p.handler.matches(&msg)) {
            let handler = inner.handlers.remove(idx).handler;
            drop(inner);
            handler.on_response(msg);
        } else {
            if inner.backlog.len() == BACKLOG_LIMIT {
                tracing::debug!("incoming backlog full, dropping oldest message");
                inner.backlog.pop_front();
            }
            inner.backlog.push_back(msg);
        }
    }

    /// Registers a handler expiring at wall-clock time `expires`. A
    /// backlogged message that matches is delivered immediately.
    pub fn add_handler(&self, handler: Arc<dyn ResponseHandler>, expires: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.backlog.iter().position(|m| handler.matches(m)) {
            let msg = inner.backlog.remove(idx).expect("scanned index");
            drop(inner);
            handler.on_response(msg);
        } else {
            inner.handlers.push(PendingHandler { handler, expires });
        }
    }

    /// Fails every handler whose expiry has passed with a timeout.
    pub fn timeout_handlers(&self, now: u64) {
        let expired: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            let mut expired = Vec::new();
            inner.handlers.retain(|p| {
                if p.expires <= now {
                    expired.push(p.handler.clone());
                    false
                } else {
                    true
                }
            });
            expired
        };
        for handler in expired {
            handler.on_error(&Fault::Recoverable(LinkError::SocketTimeout));
        }
    }

    /// Fails every registered handler with `fault` and drops the
    /// backlog.
    pub fn fail_all_handlers(&self, fault: &Fault) {
        let failed: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.backlog.clear();
            inner.handlers.drain(..).map(|p| p.handler).collect()
        };
        for handler in failed {
            handler.on_error(fault);
        }
    }

    /// Number of handlers currently waiting.
    pub fn pending_handlers(&self) -> usize {
        self.inner.lock().unwrap().handlers.len()
    }

    /// Number of unclaimed messages.
    pub fn backlog_len(&self) -> usize {
        self.inner.lock().unwrap().backlog.len()
    }
}
