/// Directory of live sessions, used to fan out new work
///
/// The map is only touched under the lock for structural changes and for
/// taking a snapshot; delivery happens outside it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::protocol::Response;
use crate::error::{ProxyError, Result};
use crate::metrics::prometheus as metrics;
use crate::pow::Uint128;

/// The registry's view of a session: its outbound queue and its kill switch.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: u64,
    pub nonce_part1: Uint128,
    outbound: mpsc::Sender<Response>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        id: u64,
        nonce_part1: Uint128,
        outbound: mpsc::Sender<Response>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            nonce_part1,
            outbound,
            shutdown,
        }
    }

    /// Queue a message for the session's writer without waiting.
    pub fn push(&self, response: Response) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ProxyError::SessionClosed);
        }
        self.outbound
            .try_send(response)
            .map_err(|_| ProxyError::SessionClosed)
    }

    /// Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<SessionHandle>) {
        let n = {
            let mut sessions = self.sessions.lock();
            sessions.insert(handle.id, handle);
            sessions.len()
        };
        metrics::set_active_sessions(n);
    }

    /// Removing an absent id is a no-op.
    pub fn unregister(&self, id: u64) -> Option<Arc<SessionHandle>> {
        let (removed, n) = {
            let mut sessions = self.sessions.lock();
            (sessions.remove(&id), sessions.len())
        };
        if removed.is_some() {
            metrics::set_active_sessions(n);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Deliver `response` to every member. A member whose queue is full or
    /// gone is closed and dropped; the rest still get the message.
    ///
    /// Returns the number of members the message was queued for.
    pub fn broadcast(&self, response: &Response) -> usize {
        let members = self.snapshot();
        let mut delivered = 0;

        for member in members {
            match member.push(response.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(session = member.id, "Broadcast failed, closing session");
                    member.close();
                    self.unregister(member.id);
                }
            }
        }

        debug!(delivered, "Broadcast complete");
        delivered
    }

    /// Cancel every member. Members unregister themselves as they exit.
    pub fn close_all(&self) {
        for member in self.snapshot() {
            member.close();
        }
    }
}
