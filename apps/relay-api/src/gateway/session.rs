//! Per-connection gateway session state.

use std::sync::atomic::{AtomicU64, Ordering};

/// State for a single WebSocket connection after IDENTIFY.
pub struct GatewaySession {
    /// Connection identifier (`conn_` prefixed ULID).
    pub connection_id: String,
    /// User the connection's ticket resolved to.
    pub user_id: String,
    /// Monotonically increasing sequence number for dispatch events.
    seq: AtomicU64,
}

impl GatewaySession {
    pub fn new(connection_id: String, user_id: String) -> Self {
        Self {
            connection_id,
            user_id,
            seq: AtomicU64::new(0),
        }
    }

    /// Get the next sequence number for a dispatch event.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_starts_at_one() {
        let s = GatewaySession::new("conn_1".into(), "usr_1".into());
        assert_eq!(s.next_seq(), 1);
        assert_eq!(s.next_seq(), 2);
    }
}
