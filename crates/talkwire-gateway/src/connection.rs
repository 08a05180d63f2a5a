use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use talkwire_core::auth::Role;
use talkwire_proto::Frame;

const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Messages queued for one socket's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// One socket's identity and outbound half.
///
/// The handle is what the rest of the router holds; the socket itself lives
/// in the read/write tasks. Dropping the handle's queue is what ends the
/// writer, so no listener bookkeeping is needed on close.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Handshake nonce distinguishing this socket among several for the
    /// same user.
    pub key: String,
    pub device_id: String,
    pub user_id: String,
    pub role: Role,
    last_activity_ms: AtomicI64,
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        role: Role,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let handle = Arc::new(Self {
            key: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            user_id: user_id.into(),
            role,
            last_activity_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            outbound: tx,
        });
        (handle, rx)
    }

    /// Queue a frame for delivery. Best effort: a closed or saturated socket
    /// drops the frame silently.
    pub fn send_frame(&self, frame: Frame) {
        if self.outbound.try_send(Outbound::Frame(frame)).is_err() {
            tracing::debug!(user_id = %self.user_id, "outbound frame dropped (socket gone or backlogged)");
        }
    }

    pub fn send(&self, message: Outbound) {
        let _ = self.outbound.try_send(message);
    }

    pub fn close(&self) {
        let _ = self.outbound.try_send(Outbound::Close);
    }

    /// Record inbound traffic (any frame or control frame).
    pub fn touch(&self) {
        self.last_activity_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis();
        Duration::from_millis(now.saturating_sub(last).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_through_the_outbound_queue() {
        let (conn, mut rx) = ConnectionHandle::new("alice", "D1", Role::Mobile);
        conn.send_frame(Frame::control(talkwire_proto::types::MSG_ACK, "alice", rmpv::Value::Nil));
        match rx.recv().await {
            Some(Outbound::Frame(frame)) => {
                assert_eq!(frame.message_type, talkwire_proto::types::MSG_ACK);
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sends_after_close_are_swallowed() {
        let (conn, rx) = ConnectionHandle::new("alice", "D1", Role::Mobile);
        drop(rx);
        // Must not panic or error.
        conn.send_frame(Frame::control(talkwire_proto::types::MSG_ACK, "alice", rmpv::Value::Nil));
        conn.close();
    }

    #[test]
    fn connection_keys_are_unique_per_socket() {
        let (a, _rx_a) = ConnectionHandle::new("alice", "D1", Role::Mobile);
        let (b, _rx_b) = ConnectionHandle::new("alice", "D1", Role::Mobile);
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn touch_resets_the_idle_clock() {
        let (conn, _rx) = ConnectionHandle::new("alice", "D1", Role::Mobile);
        conn.touch();
        assert!(conn.idle_for() < Duration::from_secs(1));
    }
}
