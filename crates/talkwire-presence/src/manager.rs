use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use talkwire_store::{keys, Store, StoreError};

use crate::mirror::StatusMirror;

const EVENT_BUS_CAPACITY: usize = 4096;

const META_STATUS: &str = "status";
const META_LAST_SEEN: &str = "last_seen";
const META_DEVICE_ID: &str = "device_id";
const META_ROLE: &str = "role";

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("presence payload could not be encoded: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
}

/// Device details attached to an online transition.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: String,
    pub role: String,
}

/// The transition message published on the presence channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub status: PresenceState,
    pub timestamp: i64,
    #[serde(rename = "lastSeen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl PresenceUpdate {
    fn new(user_id: &str, status: PresenceState, now: i64, device_id: Option<String>) -> Self {
        Self {
            kind: "presence_update".to_string(),
            user_id: user_id.to_string(),
            status,
            timestamp: now,
            last_seen: Some(now),
            device_id,
        }
    }
}

/// One row of a bulk status query.
#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub status: PresenceState,
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
    #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceSnapshot {
    pub users: Vec<UserStatus>,
    #[serde(rename = "totalOnline")]
    pub total_online: usize,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
}

/// Online/offline state of record, held in the Store.
///
/// A user is online iff `presence:user:{id}` exists; the companion meta hash
/// survives offline transitions so `lastSeen` stays queryable. Transitions
/// are published through the Store's pub/sub so every instance observes them;
/// the silent-mobile path is driven by the Store's expired-key events.
pub struct PresenceManager {
    store: Store,
    config: PresenceConfig,
    events: broadcast::Sender<PresenceUpdate>,
    mirror: Option<Arc<dyn StatusMirror>>,
}

impl PresenceManager {
    pub fn new(
        store: Store,
        config: PresenceConfig,
        mirror: Option<Arc<dyn StatusMirror>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            store,
            config,
            events,
            mirror,
        }
    }

    /// Listener for transitions observed through the Store (all instances,
    /// this one included).
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.events.subscribe()
    }

    pub async fn set_user_online(
        &self,
        user_id: &str,
        device: DeviceInfo,
    ) -> Result<(), PresenceError> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp_millis();
        self.store
            .put_tracked(
                &keys::presence(user_id),
                "1",
                self.config.ttl_seconds,
                &keys::presence_meta(user_id),
                &[
                    (META_STATUS, "online".to_string()),
                    (META_LAST_SEEN, now.to_string()),
                    (META_DEVICE_ID, device.device_id.clone()),
                    (META_ROLE, device.role),
                ],
            )
            .await?;
        info!(user_id = %user_id, device_id = %device.device_id, "user online");
        let update =
            PresenceUpdate::new(user_id, PresenceState::Online, now, Some(device.device_id));
        self.publish_transition(keys::CHANNEL_PRESENCE_ONLINE, &update)
            .await?;
        self.mirror(&update);
        Ok(())
    }

    /// Extend the online TTL after a liveness pong or a voluntary heartbeat.
    ///
    /// Publishes nothing (the state did not change) and degrades to a no-op
    /// when the indicator key has already expired — a dead session is not
    /// silently resurrected.
    pub async fn refresh_heartbeat(&self, user_id: &str) -> Result<(), PresenceError> {
        if !self.config.enabled {
            return Ok(());
        }
        let extended = self
            .store
            .extend_ttl(&keys::presence(user_id), self.config.ttl_seconds)
            .await?;
        if extended {
            let now = chrono::Utc::now().timestamp_millis();
            self.store
                .hash_set(
                    &keys::presence_meta(user_id),
                    &[(META_LAST_SEEN, now.to_string())],
                )
                .await?;
        } else {
            debug!(user_id = %user_id, "heartbeat for expired presence ignored");
        }
        Ok(())
    }

    pub async fn set_user_offline(&self, user_id: &str) -> Result<(), PresenceError> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp_millis();
        self.store
            .drop_tracked(
                &keys::presence(user_id),
                &keys::presence_meta(user_id),
                &[
                    (META_STATUS, "offline".to_string()),
                    (META_LAST_SEEN, now.to_string()),
                ],
            )
            .await?;
        info!(user_id = %user_id, "user offline");
        let update = PresenceUpdate::new(user_id, PresenceState::Offline, now, None);
        self.publish_transition(keys::CHANNEL_PRESENCE_OFFLINE, &update)
            .await?;
        self.mirror(&update);
        Ok(())
    }

    /// Existence check plus meta read for each user, batched in one
    /// transaction.
    pub async fn bulk_status(&self, user_ids: &[String]) -> Result<Vec<UserStatus>, PresenceError> {
        let pairs: Vec<(String, String)> = user_ids
            .iter()
            .map(|id| (keys::presence(id), keys::presence_meta(id)))
            .collect();
        let rows = self.store.exists_with_hash(&pairs).await?;
        Ok(user_ids
            .iter()
            .zip(rows)
            .map(|(user_id, (exists, meta))| derive_status(user_id, exists, &meta))
            .collect())
    }

    /// Every currently-online user plus their meta, for the dashboard dump.
    pub async fn snapshot(&self) -> Result<PresenceSnapshot, PresenceError> {
        let indicator_keys = self.store.scan_all(keys::PRESENCE_PATTERN).await?;
        let user_ids: Vec<String> = indicator_keys
            .iter()
            .filter_map(|key| keys::user_from_presence_key(key))
            .map(str::to_string)
            .collect();
        let users = self.bulk_status(&user_ids).await?;
        let total_online = users
            .iter()
            .filter(|row| row.status == PresenceState::Online)
            .count();
        Ok(PresenceSnapshot {
            users,
            total_online,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Consume the Store's pub/sub: presence transitions are re-emitted on
    /// the local event bus, expired `presence:user:*` keys become offline
    /// transitions. This is the sole mechanism turning a silent mobile into
    /// an offline user.
    pub fn spawn_listener(self: &Arc<Self>, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = manager.store.subscribe(vec![
            keys::CHANNEL_PRESENCE_UPDATES.to_string(),
            keys::CHANNEL_KEY_EXPIRED.to_string(),
        ]);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => return,
                    },
                    _ = shutdown.notified() => return,
                };
                if message.channel == keys::CHANNEL_KEY_EXPIRED {
                    let Some(user_id) = keys::user_from_presence_key(&message.payload) else {
                        continue;
                    };
                    debug!(user_id = %user_id, "presence ttl expired");
                    if let Err(err) = manager.set_user_offline(user_id).await {
                        warn!(user_id = %user_id, error = %err, "expiry-driven offline failed");
                    }
                } else {
                    match serde_json::from_str::<PresenceUpdate>(&message.payload) {
                        Ok(update) => {
                            let _ = manager.events.send(update);
                        }
                        Err(err) => {
                            warn!(channel = %message.channel, error = %err, "unparseable presence message dropped");
                        }
                    }
                }
            }
        })
    }

    async fn publish_transition(
        &self,
        channel: &str,
        update: &PresenceUpdate,
    ) -> Result<(), PresenceError> {
        let payload =
            serde_json::to_string(update).map_err(|err| PresenceError::Encode(err.to_string()))?;
        self.store.publish(channel, &payload).await?;
        self.store
            .publish(keys::CHANNEL_PRESENCE_UPDATES, &payload)
            .await?;
        Ok(())
    }

    fn mirror(&self, update: &PresenceUpdate) {
        if let Some(mirror) = &self.mirror {
            let mirror = Arc::clone(mirror);
            let update = update.clone();
            tokio::spawn(async move {
                mirror.record(&update).await;
            });
        }
    }
}

/// Pure derivation of a bulk-status row from the Store's two entries.
fn derive_status(user_id: &str, exists: bool, meta: &HashMap<String, String>) -> UserStatus {
    let last_seen = meta
        .get(META_LAST_SEEN)
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(0);
    UserStatus {
        user_id: user_id.to_string(),
        status: if exists {
            PresenceState::Online
        } else {
            PresenceState::Offline
        },
        last_seen,
        device_id: meta.get(META_DEVICE_ID).cloned(),
        role: meta.get(META_ROLE).cloned(),
    }
}
