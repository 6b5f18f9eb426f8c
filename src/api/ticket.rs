use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::session::SessionId;

/// Time-to-live for a pending ticket.
const TICKET_TTL: Duration = Duration::from_secs(30);

/// Maximum number of pending (unredeemed) tickets.
const MAX_PENDING_TICKETS: usize = 1024;

struct Ticket {
    issued: Instant,
    /// When set, the ticket only opens this session's terminal.
    session: Option<SessionId>,
}

/// Short-lived, single-use tickets for WebSocket authentication.
///
/// Browsers cannot set an `Authorization` header on a WebSocket, so a client
/// first calls `POST /auth/ws-ticket` with its bearer token and then opens
/// `/ws/terminal/{id}?ticket=<nonce>`. A ticket expires after 30 seconds,
/// works once, and may be bound to a single session.
pub struct TicketStore {
    inner: Mutex<HashMap<String, Ticket>>,
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a ticket. `None` when too many tickets are pending.
    pub fn issue(&self, session: Option<SessionId>) -> Option<String> {
        let mut map = self.inner.lock();

        let now = Instant::now();
        map.retain(|_, t| now.duration_since(t.issued) < TICKET_TTL);
        if map.len() >= MAX_PENDING_TICKETS {
            return None;
        }

        let nonce: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        map.insert(nonce.clone(), Ticket { issued: now, session });
        Some(nonce)
    }

    /// Consume a ticket for a request targeting `session`.
    ///
    /// The ticket is removed whether or not it matches, so a leaked ticket
    /// cannot be retried against other sessions.
    pub fn redeem(&self, nonce: &str, session: Option<SessionId>) -> bool {
        let mut map = self.inner.lock();
        match map.remove(nonce) {
            Some(ticket) => {
                let fresh = Instant::now().duration_since(ticket.issued) < TICKET_TTL;
                let in_scope = match ticket.session {
                    None => true,
                    Some(bound) => session == Some(bound),
                };
                fresh && in_scope
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().len()
    }
}
