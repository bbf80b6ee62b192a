//! Table of outstanding calls awaiting server acks.
//!
//! Owned by the socket's I/O task; every mutation happens there, so no
//! synchronization is needed. Deadlines are surfaced through
//! [`PendingCalls::next_deadline`] for the task's timer arm rather than
//! one timer per entry.

use std::collections::HashMap;

use serde_json::Value;
use tokio::time::Instant;

use crate::{error::ScError, protocol::CallId};

/// Callback invoked exactly once with the call's outcome: the ack data,
/// a [`ScError::Response`], or a [`ScError::AckTimeout`].
pub type ResponseHandler = Box<dyn FnOnce(Result<Value, ScError>) + Send + 'static>;

struct PendingEntry {
    handler: ResponseHandler,
    deadline: Option<Instant>,
}

/// Outstanding calls keyed by cid.
#[derive(Default)]
pub(crate) struct PendingCalls {
    entries: HashMap<CallId, PendingEntry>,
}

impl PendingCalls {
    /// Store a handler; `deadline` of `None` means the call never times out.
    pub fn insert(&mut self, cid: CallId, handler: ResponseHandler, deadline: Option<Instant>) {
        self.entries.insert(cid, PendingEntry { handler, deadline });
    }

    /// Remove and return the handler for an ack, cancelling its deadline.
    pub fn take(&mut self, rid: CallId) -> Option<ResponseHandler> {
        self.entries.remove(&rid).map(|entry| entry.handler)
    }

    /// The earliest armed deadline, if any call still has one.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|entry| entry.deadline)
            .min()
    }

    /// Remove every entry whose deadline has passed, in cid order.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(CallId, ResponseHandler)> {
        let mut expired: Vec<CallId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(cid, _)| *cid)
            .collect();
        expired.sort_unstable();

        expired
            .into_iter()
            .filter_map(|cid| self.take(cid).map(|handler| (cid, handler)))
            .collect()
    }

    /// Drop every entry without invoking its handler. Called on socket
    /// close, where the disconnect event itself is the signal.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
