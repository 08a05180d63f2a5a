use std::sync::Arc;

use tracing::{debug, info, warn};

use talkwire_proto::types::{MSG_ACK, MSG_AUDIO, MSG_CONNECTION, MSG_HEARTBEAT, MSG_REGISTER};
use talkwire_proto::{ChannelType, Frame};
use talkwire_store::StoreError;

use crate::clients::ClientTable;
use crate::connection::ConnectionHandle;
use crate::GatewayState;

/// Re-acquire the speaker slot when its expiry is this close, so an ongoing
/// turn is not cut off by the lock TTL while audio is still flowing.
const TURN_REFRESH_MARGIN_MS: i64 = 5_000;

/// The speaker slot this socket currently holds, if any.
pub(crate) struct ActiveTurn {
    pub group_id: String,
    pub started_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Route one inbound frame. Runs serially per socket.
pub(crate) async fn dispatch_frame(
    state: &GatewayState,
    conn: &Arc<ConnectionHandle>,
    mut frame: Frame,
    active_turn: &mut Option<ActiveTurn>,
) {
    // The resolved identity is authoritative, never the claimed field.
    frame.from_id = conn.user_id.clone();

    if frame.message_type == MSG_HEARTBEAT {
        if let Err(err) = state.app.presence.refresh_heartbeat(&conn.user_id).await {
            warn!(user_id = %conn.user_id, error = %err, "heartbeat refresh failed");
        }
        return;
    }

    match frame.channel_type {
        ChannelType::Private => match state.clients.get(&frame.to_id) {
            Some(target) => target.send_frame(frame),
            // Cross-instance private delivery is out of scope; drop silently.
            None => debug!(to = %frame.to_id, "private frame for non-resident user dropped"),
        },
        ChannelType::Group => match frame.message_type {
            MSG_CONNECTION | MSG_REGISTER => {
                info!(
                    user_id = %conn.user_id,
                    device_id = %conn.device_id,
                    "device token registration noted"
                );
                conn.send_frame(Frame::control(MSG_ACK, conn.user_id.clone(), rmpv::Value::Nil));
            }
            MSG_AUDIO => {
                if ensure_turn(state, conn, &frame.to_id, active_turn).await {
                    send_to_group(state, frame, false).await;
                }
            }
            _ => {
                send_to_group(state, frame, false).await;
            }
        },
    }
}

/// Hold (or take) the group's speaker slot for this sender.
///
/// Returns whether the frame may fan out. A slot held by someone else
/// suppresses the frame (`BUSY`, no automatic retry); a Store failure does
/// not — PTT keeps working on in-memory delivery when the Store is down.
async fn ensure_turn(
    state: &GatewayState,
    conn: &Arc<ConnectionHandle>,
    group_id: &str,
    active_turn: &mut Option<ActiveTurn>,
) -> bool {
    let now = chrono::Utc::now().timestamp_millis();
    let max_turn_ms = state.app.config.max_turn_duration.as_millis() as i64;
    let turn_exhausted = active_turn.as_ref().is_some_and(|turn| {
        turn.group_id == group_id && now >= turn.started_at_ms + max_turn_ms
    });
    if turn_exhausted {
        // The turn hit its duration ceiling: give the slot up and let the
        // next frame contend for it fresh.
        *active_turn = None;
        debug!(group = %group_id, from = %conn.user_id, "turn duration limit reached");
        if let Err(err) = state.app.groups.end_turns_of(&conn.user_id).await {
            warn!(user_id = %conn.user_id, error = %err, "speaker slot release failed");
        }
        return false;
    }
    let held_fresh = active_turn
        .as_ref()
        .is_some_and(|turn| turn.group_id == group_id && now + TURN_REFRESH_MARGIN_MS < turn.expires_at_ms);
    if held_fresh {
        return true;
    }
    if active_turn.as_ref().is_some_and(|turn| turn.group_id != group_id) {
        // Switching channels releases whatever we still hold.
        *active_turn = None;
        if let Err(err) = state.app.groups.end_turns_of(&conn.user_id).await {
            warn!(user_id = %conn.user_id, error = %err, "speaker slot release failed");
        }
    }

    match state.app.groups.begin_turn(group_id, &conn.user_id).await {
        Ok(turn) => {
            *active_turn = Some(ActiveTurn {
                group_id: group_id.to_string(),
                started_at_ms: turn.started_at,
                expires_at_ms: turn.expires_at,
            });
            true
        }
        Err(StoreError::Busy { holder }) => {
            debug!(group = %group_id, %holder, from = %conn.user_id, "audio frame suppressed; slot busy");
            *active_turn = None;
            false
        }
        Err(err) => {
            warn!(group = %group_id, error = %err, "speaker slot unavailable; fanning out anyway");
            true
        }
    }
}

/// Resolve the group's members and deliver to each resident one.
pub async fn send_to_group(state: &GatewayState, frame: Frame, echo: bool) -> usize {
    let members = match state.app.groups.members(&frame.to_id).await {
        Ok(members) => members,
        Err(err) => {
            warn!(group = %frame.to_id, error = %err, "member lookup failed; empty recipient set");
            Vec::new()
        }
    };
    deliver_to_members(&state.clients, &frame, &members, echo)
}

/// In-memory half of the fan-out. The sender is excluded unless `echo`.
pub fn deliver_to_members(
    clients: &ClientTable,
    frame: &Frame,
    members: &[String],
    echo: bool,
) -> usize {
    let mut delivered = 0;
    for member in members {
        if !echo && member == &frame.from_id {
            continue;
        }
        if let Some(target) = clients.get(member) {
            target.send_frame(frame.clone());
            delivered += 1;
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use talkwire_core::auth::Role;
    use talkwire_proto::types::MSG_AUDIO;

    fn audio_frame(from: &str, group: &str) -> Frame {
        Frame::new(
            ChannelType::Group,
            MSG_AUDIO,
            from,
            group,
            rmpv::Value::Binary(vec![1, 2, 3]),
        )
    }

    #[tokio::test]
    async fn fan_out_excludes_the_sender() {
        let clients = ClientTable::new();
        let (a, mut rx_a) = ConnectionHandle::new("A", "D", Role::Mobile);
        let (b, mut rx_b) = ConnectionHandle::new("B", "D", Role::Mobile);
        let (c, mut rx_c) = ConnectionHandle::new("C", "D", Role::Mobile);
        clients.register(a);
        clients.register(b);
        clients.register(c);

        let members = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let delivered = deliver_to_members(&clients, &audio_frame("A", "G"), &members, false);

        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv(), Ok(Outbound::Frame(_))));
        assert!(matches!(rx_c.try_recv(), Ok(Outbound::Frame(_))));
    }

    #[tokio::test]
    async fn fan_out_with_echo_includes_the_sender() {
        let clients = ClientTable::new();
        let (a, mut rx_a) = ConnectionHandle::new("A", "D", Role::Mobile);
        clients.register(a);

        let members = vec!["A".to_string()];
        let delivered = deliver_to_members(&clients, &audio_frame("A", "G"), &members, true);

        assert_eq!(delivered, 1);
        assert!(matches!(rx_a.try_recv(), Ok(Outbound::Frame(_))));
    }

    #[tokio::test]
    async fn non_resident_members_are_skipped() {
        let clients = ClientTable::new();
        let (b, mut rx_b) = ConnectionHandle::new("B", "D", Role::Mobile);
        clients.register(b);

        let members = vec!["B".to_string(), "gone".to_string()];
        let delivered = deliver_to_members(&clients, &audio_frame("A", "G"), &members, false);

        assert_eq!(delivered, 1);
        assert!(matches!(rx_b.try_recv(), Ok(Outbound::Frame(_))));
    }
}
