use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use talkwire_core::auth::ResolvedUser;
use talkwire_presence::DeviceInfo;
use talkwire_proto::types::{pong_payload, MSG_CONNECTION_ACK};
use talkwire_proto::Frame;

use crate::connection::{ConnectionHandle, Outbound};
use crate::dispatch::{dispatch_frame, ActiveTurn};
use crate::{snapshot_frame, GatewayState, Registration};

/// How often the idle watchdog looks at a held speaker slot.
const IDLE_CHECK_PERIOD: Duration = Duration::from_millis(500);

pub(crate) async fn handle_socket(
    socket: WebSocket,
    state: GatewayState,
    user: ResolvedUser,
    device_id: String,
) {
    let (conn, outbound_rx) = ConnectionHandle::new(&user.user_id, &device_id, user.role);
    let (ws_sink, ws_stream) = socket.split();
    let writer = tokio::spawn(write_loop(ws_sink, outbound_rx));

    info!(
        user_id = %conn.user_id,
        device_id = %conn.device_id,
        role = user.role.as_str(),
        "socket accepted"
    );
    if let Registration::Reused = state.clients.register(Arc::clone(&conn)) {
        debug!(user_id = %conn.user_id, "socket re-registered with same key");
    }

    if user.role.is_dashboard() {
        // A dashboard's first frame is its snapshot.
        state.dashboards.insert(Arc::clone(&conn));
        match state.app.presence.snapshot().await {
            Ok(snapshot) => conn.send_frame(snapshot_frame(&snapshot, &conn.user_id)),
            Err(err) => warn!(error = %err, "presence snapshot unavailable for new dashboard"),
        }
    } else {
        conn.send_frame(Frame::control(
            MSG_CONNECTION_ACK,
            conn.user_id.clone(),
            rmpv::Value::from(conn.user_id.as_str()),
        ));
        if let Err(err) = state
            .app
            .presence
            .set_user_online(
                &conn.user_id,
                DeviceInfo {
                    device_id: conn.device_id.clone(),
                    role: user.role.as_str().to_string(),
                },
            )
            .await
        {
            // Presence degradation must not block PTT.
            warn!(user_id = %conn.user_id, error = %err, "online transition failed");
        }
    }

    let reason = read_loop(&state, &conn, ws_stream).await;
    info!(user_id = %conn.user_id, reason = %reason, "socket closed");

    // Disconnect path: release speaker slots first so the group is not held
    // hostage by a dead sender, then presence, then the tables.
    if let Err(err) = state.app.groups.end_turns_of(&conn.user_id).await {
        warn!(user_id = %conn.user_id, error = %err, "speaker slot cleanup failed");
    }
    if user.role.is_dashboard() {
        state.dashboards.remove(&conn.key);
        state.clients.unregister(&conn.user_id, &conn.key);
    } else if state.clients.unregister(&conn.user_id, &conn.key) {
        // Fast-path offline only when this socket was still the registered
        // one — a displaced socket must not mark its replacement offline.
        if let Err(err) = state.app.presence.set_user_offline(&conn.user_id).await {
            warn!(user_id = %conn.user_id, error = %err, "offline transition failed");
        }
    }

    conn.close();
    // Dropping the handle releases the last outbound sender, so the writer
    // drains and exits even when the close request could not be queued.
    drop(conn);
    let _ = writer.await;
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    while let Some(message) = outbound.recv().await {
        let ws_message = match message {
            Outbound::Frame(frame) => match frame.encode() {
                Ok(bytes) => Message::Binary(bytes.into()),
                Err(err) => {
                    warn!(error = %err, "outbound frame dropped at encode");
                    continue;
                }
            },
            Outbound::Ping(payload) => Message::Ping(payload.into()),
            Outbound::Pong(payload) => Message::Pong(payload.into()),
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        };
        // Write failures end the writer; the read half observes the close.
        if sink.send(ws_message).await.is_err() {
            return;
        }
    }
}

async fn read_loop(
    state: &GatewayState,
    conn: &Arc<ConnectionHandle>,
    mut stream: SplitStream<WebSocket>,
) -> String {
    let mut active_turn: Option<ActiveTurn> = None;
    let mut ping_ticker = tokio::time::interval(state.app.config.ping_interval);
    ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut idle_ticker = tokio::time::interval(IDLE_CHECK_PERIOD);
    idle_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(bytes))) => {
                    conn.touch();
                    match Frame::decode(&bytes) {
                        Ok(frame) => {
                            dispatch_frame(state, conn, frame, &mut active_turn).await;
                        }
                        // One malformed frame is logged, not a disconnect.
                        Err(err) => {
                            debug!(user_id = %conn.user_id, error = %err, "malformed frame dropped");
                        }
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    conn.touch();
                    // Liveness may be driven from either side; a client ping
                    // is answered with the resolved identity.
                    conn.send(Outbound::Pong(pong_payload(&conn.user_id)));
                }
                Some(Ok(Message::Pong(_))) => {
                    conn.touch();
                    if !conn.role.is_dashboard() {
                        if let Err(err) = state.app.presence.refresh_heartbeat(&conn.user_id).await {
                            warn!(user_id = %conn.user_id, error = %err, "pong-driven ttl refresh failed");
                        }
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    conn.touch();
                    debug!(user_id = %conn.user_id, "text message ignored on binary channel");
                }
                Some(Ok(Message::Close(_))) => return "peer closed".to_string(),
                Some(Err(err)) => return format!("receive error: {err}"),
                None => return "stream ended".to_string(),
            },
            _ = ping_ticker.tick() => {
                conn.send(Outbound::Ping(Vec::new()));
            }
            _ = idle_ticker.tick() => {
                if active_turn.is_some() && conn.idle_for() > state.app.config.max_idle_duration {
                    active_turn = None;
                    debug!(user_id = %conn.user_id, "turn idle limit hit; releasing speaker slot");
                    if let Err(err) = state.app.groups.end_turns_of(&conn.user_id).await {
                        warn!(user_id = %conn.user_id, error = %err, "idle speaker release failed");
                    }
                }
            }
            _ = state.app.shutdown.notified() => return "server shutdown".to_string(),
        }
    }
}
