// Channel types
pub const CHANNEL_PRIVATE: u8 = 0;
pub const CHANNEL_GROUP: u8 = 1;

// Client -> server message types
pub const MSG_TEXT: u8 = 1;
pub const MSG_AUDIO: u8 = 3;
pub const MSG_CONNECTION: u8 = 5;
pub const MSG_REGISTER: u8 = 6;
pub const MSG_HEARTBEAT: u8 = 30;

// Server -> client message types
pub const MSG_ACK: u8 = 4;
pub const MSG_CONNECTION_ACK: u8 = 12;
pub const MSG_LOGIN_DUPLICATED: u8 = 13;
pub const MSG_PRESENCE_UPDATE: u8 = 31;
pub const MSG_PRESENCE_SNAPSHOT: u8 = 32;

/// Destination carried by frames addressed to every dashboard socket.
pub const BROADCAST_TARGET: &str = "broadcast";

/// A control-frame pong payload may not exceed the websocket control limit.
pub const MAX_PONG_PAYLOAD_BYTES: usize = 125;

/// Truncate a pong payload to the control-frame limit on a char boundary.
pub fn pong_payload(user_id: &str) -> Vec<u8> {
    let mut end = user_id.len().min(MAX_PONG_PAYLOAD_BYTES);
    while end > 0 && !user_id.is_char_boundary(end) {
        end -= 1;
    }
    user_id.as_bytes()[..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_payload_passes_short_ids_through() {
        assert_eq!(pong_payload("TELENET_81*14946*0011"), b"TELENET_81*14946*0011");
    }

    #[test]
    fn pong_payload_truncates_to_control_limit() {
        let long = "x".repeat(400);
        assert_eq!(pong_payload(&long).len(), MAX_PONG_PAYLOAD_BYTES);
    }

    #[test]
    fn pong_payload_respects_char_boundaries() {
        // 125 bytes would split the last 4-byte scalar; we must back off.
        let id = format!("{}𝄞", "a".repeat(123));
        let payload = pong_payload(&id);
        assert_eq!(payload.len(), 123);
        assert!(std::str::from_utf8(&payload).is_ok());
    }
}
