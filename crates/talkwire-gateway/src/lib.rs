mod clients;
mod connection;
mod dispatch;
mod handler;

pub use clients::{ClientTable, DashboardSet, Registration};
pub use connection::{ConnectionHandle, Outbound};
pub use dispatch::send_to_group;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast;
use tracing::warn;

use talkwire_core::auth::UserResolver;
use talkwire_core::AppState;
use talkwire_presence::{PresenceSnapshot, PresenceUpdate};
use talkwire_proto::types::{BROADCAST_TARGET, MSG_PRESENCE_SNAPSHOT, MSG_PRESENCE_UPDATE};
use talkwire_proto::{ChannelType, Frame};

/// Token resolution must answer within this long or the handshake aborts.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct GatewayState {
    pub app: AppState,
    pub resolver: Arc<dyn UserResolver>,
    pub clients: Arc<ClientTable>,
    pub dashboards: Arc<DashboardSet>,
}

pub fn gateway_router() -> Router<GatewayState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<GatewayState>,
) -> Response {
    let credentials = handshake_credentials(&headers);
    let Some(token) = credentials.token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    let resolved =
        match tokio::time::timeout(HANDSHAKE_DEADLINE, state.resolver.resolve(&token)).await {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(err)) => {
                warn!(error = %err, "handshake rejected");
                return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
            }
            Err(_) => {
                warn!("token resolution deadline exceeded");
                return (StatusCode::UNAUTHORIZED, "token resolution timed out").into_response();
            }
        };

    // Strict clients only complete the handshake when their offered
    // subprotocol is echoed back.
    let ws = match credentials.protocols.first() {
        Some(first) => ws.protocols([first.clone()]),
        None => ws,
    };
    ws.on_upgrade(move |socket| {
        handler::handle_socket(socket, state, resolved, credentials.device_id)
    })
}

struct HandshakeCredentials {
    token: Option<String>,
    device_id: String,
    protocols: Vec<String>,
}

/// Pull `[token, deviceId]` out of the handshake: dedicated headers first,
/// the websocket-subprotocol list as fallback.
fn handshake_credentials(headers: &HeaderMap) -> HandshakeCredentials {
    let protocols: Vec<String> = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let header_value = |names: &[&str]| {
        names.iter().find_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
    };

    let token = header_value(&["token", "voicepingtoken"]).or_else(|| protocols.first().cloned());
    let device_id = header_value(&["device_id", "deviceid"])
        .or_else(|| protocols.get(1).cloned())
        .unwrap_or_else(|| "unknown".to_string());

    HandshakeCredentials {
        token,
        device_id,
        protocols,
    }
}

/// Bridge presence transitions onto every dashboard socket.
pub fn spawn_presence_bridge(state: GatewayState) -> tokio::task::JoinHandle<()> {
    let mut events = state.app.presence.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(update) => {
                        state.dashboards.broadcast(&presence_update_frame(&update));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "presence bridge lagged; dashboards missed updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = state.app.shutdown.notified() => return,
            }
        }
    })
}

pub fn presence_update_frame(update: &PresenceUpdate) -> Frame {
    let payload = serde_json::to_value(update)
        .map(|value| Frame::json_payload(&value))
        .unwrap_or(rmpv::Value::Nil);
    Frame::new(
        ChannelType::Private,
        MSG_PRESENCE_UPDATE,
        update.user_id.clone(),
        BROADCAST_TARGET,
        payload,
    )
}

pub(crate) fn snapshot_frame(snapshot: &PresenceSnapshot, to_id: &str) -> Frame {
    let payload = serde_json::to_value(snapshot)
        .map(|value| Frame::json_payload(&value))
        .unwrap_or(rmpv::Value::Nil);
    Frame::control(MSG_PRESENCE_SNAPSHOT, to_id, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use talkwire_presence::PresenceState;

    fn header_map(entries: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in entries {
            headers.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).expect("header name"),
                HeaderValue::from_str(value).expect("header value"),
            );
        }
        headers
    }

    #[test]
    fn credentials_prefer_dedicated_headers() {
        let headers = header_map(&[
            ("token", "tok-1"),
            ("device_id", "D1"),
            ("sec-websocket-protocol", "other-tok, other-dev"),
        ]);
        let creds = handshake_credentials(&headers);
        assert_eq!(creds.token.as_deref(), Some("tok-1"));
        assert_eq!(creds.device_id, "D1");
    }

    #[test]
    fn credentials_accept_legacy_header_names() {
        let headers = header_map(&[("voicepingtoken", "tok-2"), ("deviceid", "D2")]);
        let creds = handshake_credentials(&headers);
        assert_eq!(creds.token.as_deref(), Some("tok-2"));
        assert_eq!(creds.device_id, "D2");
    }

    #[test]
    fn credentials_fall_back_to_the_subprotocol_list() {
        let headers = header_map(&[("sec-websocket-protocol", "tok-3, D3")]);
        let creds = handshake_credentials(&headers);
        assert_eq!(creds.token.as_deref(), Some("tok-3"));
        assert_eq!(creds.device_id, "D3");
        assert_eq!(creds.protocols, vec!["tok-3", "D3"]);
    }

    #[test]
    fn missing_token_is_reported_as_absent() {
        let creds = handshake_credentials(&HeaderMap::new());
        assert!(creds.token.is_none());
        assert_eq!(creds.device_id, "unknown");
    }

    #[test]
    fn presence_updates_become_broadcast_frames() {
        let update = PresenceUpdate {
            kind: "presence_update".into(),
            user_id: "alice".into(),
            status: PresenceState::Online,
            timestamp: 7,
            last_seen: Some(7),
            device_id: Some("D1".into()),
        };
        let frame = presence_update_frame(&update);
        assert_eq!(frame.message_type, MSG_PRESENCE_UPDATE);
        assert_eq!(frame.from_id, "alice");
        assert_eq!(frame.to_id, BROADCAST_TARGET);

        // The payload must survive the wire codec intact.
        let decoded = Frame::decode(&frame.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, frame);
    }
}
