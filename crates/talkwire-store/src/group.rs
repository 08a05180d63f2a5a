use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::Store;
use crate::error::StoreError;
use crate::keys;

const SCAN_PAGE: usize = 100;

/// The "currently talking" lock held for one active audio turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerTurn {
    #[serde(rename = "fromId")]
    pub from_id: String,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
}

/// Group membership and per-group speaker lock, backed by the Store.
///
/// Membership is mirrored both ways (`group:members:{g}` and
/// `user:groups:{u}`) so fan-out and disconnect cleanup each have a direct
/// lookup.
pub struct GroupDirectory {
    store: Store,
    busy_timeout: Duration,
}

impl GroupDirectory {
    pub fn new(store: Store, busy_timeout: Duration) -> Self {
        Self {
            store,
            busy_timeout,
        }
    }

    pub async fn add_user(&self, user_id: &str, group_id: &str) -> Result<(), StoreError> {
        self.store
            .set_add_pair(
                &keys::group_members(group_id),
                user_id,
                &keys::user_groups(user_id),
                group_id,
            )
            .await
    }

    pub async fn remove_user(&self, user_id: &str, group_id: &str) -> Result<(), StoreError> {
        self.store
            .set_remove_pair(
                &keys::group_members(group_id),
                user_id,
                &keys::user_groups(user_id),
                group_id,
            )
            .await
    }

    pub async fn members(&self, group_id: &str) -> Result<Vec<String>, StoreError> {
        self.store.set_members(&keys::group_members(group_id)).await
    }

    pub async fn groups_of(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.store.set_members(&keys::user_groups(user_id)).await
    }

    /// Take (or refresh) the speaker slot for a group.
    ///
    /// The first successful write wins. A slot already held by the same
    /// speaker is refreshed; a slot held by anyone else returns
    /// [`StoreError::Busy`] and the caller must not retry automatically.
    pub async fn begin_turn(&self, group_id: &str, from_id: &str) -> Result<SpeakerTurn, StoreError> {
        let key = keys::group_current(group_id);
        let ttl_ms = self.busy_timeout.as_millis() as u64;
        let now = chrono::Utc::now().timestamp_millis();
        let turn = SpeakerTurn {
            from_id: from_id.to_string(),
            started_at: now,
            expires_at: now + ttl_ms as i64,
        };
        let value = serde_json::to_string(&turn)
            .map_err(|err| StoreError::Decode(err.to_string()))?;

        if self.store.acquire(&key, &value, ttl_ms).await? {
            return Ok(turn);
        }
        match self.current_turn(group_id).await? {
            Some(held) if held.from_id == from_id => {
                // Same speaker continuing the turn: keep the original
                // started_at, push the expiry out.
                let refreshed = SpeakerTurn {
                    expires_at: now + ttl_ms as i64,
                    ..held
                };
                let value = serde_json::to_string(&refreshed)
                    .map_err(|err| StoreError::Decode(err.to_string()))?;
                self.store.refresh_held(&key, &value, ttl_ms).await?;
                Ok(refreshed)
            }
            Some(held) => Err(StoreError::Busy {
                holder: held.from_id,
            }),
            // Lock expired between SET NX and the read; take it now.
            None => {
                if self.store.acquire(&key, &value, ttl_ms).await? {
                    Ok(turn)
                } else {
                    let holder = self
                        .current_turn(group_id)
                        .await?
                        .map(|t| t.from_id)
                        .unwrap_or_default();
                    Err(StoreError::Busy { holder })
                }
            }
        }
    }

    pub async fn current_turn(&self, group_id: &str) -> Result<Option<SpeakerTurn>, StoreError> {
        let raw = self.store.get(&keys::group_current(group_id)).await?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|err| StoreError::Decode(err.to_string())),
            None => Ok(None),
        }
    }

    /// Unconditionally clear a group's speaker slot.
    pub async fn end_turn(&self, group_id: &str) -> Result<(), StoreError> {
        self.store.delete(&keys::group_current(group_id)).await
    }

    /// Clear every speaker slot held by this user across their groups.
    /// Called on disconnect and by the idle watchdog.
    pub async fn end_turns_of(&self, user_id: &str) -> Result<(), StoreError> {
        for group_id in self.groups_of(user_id).await? {
            if let Some(turn) = self.current_turn(&group_id).await? {
                if turn.from_id == user_id {
                    self.end_turn(&group_id).await?;
                    tracing::debug!(user_id = %user_id, group = %group_id, "speaker slot cleared");
                }
            }
        }
        Ok(())
    }

    /// Remove speaker locks whose recorded expiry has passed. The Store's
    /// own TTL normally removes them first; this catches locks whose TTL and
    /// payload disagree after a failed refresh.
    pub async fn clear_expired_turns(&self) -> Result<usize, StoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut cleared = 0;
        let mut cursor = 0;
        loop {
            let (next, batch) = self
                .store
                .scan_step(cursor, keys::GROUP_CURRENT_PATTERN, SCAN_PAGE)
                .await?;
            for key in batch {
                let Some(group_id) = keys::group_from_current_key(&key) else {
                    continue;
                };
                if let Some(turn) = self.current_turn(group_id).await? {
                    if turn.expires_at <= now {
                        self.end_turn(group_id).await?;
                        cleared += 1;
                        tracing::debug!(group = %group_id, holder = %turn.from_id, "expired speaker lock cleared");
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                return Ok(cleared);
            }
        }
    }

    /// One janitor cycle: walk speaker-lock keys from `cursor`, examining at
    /// most `budget` groups, and clear state orphaned by membership churn.
    /// Returns the cursor to resume from next cycle.
    pub async fn sweep_orphans(&self, mut cursor: u64, budget: usize) -> Result<u64, StoreError> {
        let mut examined = 0;
        loop {
            let (next, batch) = self
                .store
                .scan_step(cursor, keys::GROUP_CURRENT_PATTERN, SCAN_PAGE)
                .await?;
            for key in batch {
                let Some(group_id) = keys::group_from_current_key(&key) else {
                    continue;
                };
                examined += 1;
                if self.store.set_len(&keys::group_members(group_id)).await? == 0 {
                    self.store.delete(&key).await?;
                    self.store.delete(&keys::group_members(group_id)).await?;
                    tracing::info!(group = %group_id, "orphaned group state removed");
                }
                if examined >= budget {
                    return Ok(next);
                }
            }
            cursor = next;
            if cursor == 0 {
                return Ok(0);
            }
        }
    }
}

/// Janitor schedule: how often to sweep and how many groups per cycle.
#[derive(Debug, Clone, Copy)]
pub struct JanitorConfig {
    pub interval: Duration,
    pub groups_per_cycle: usize,
}

/// Periodic sweep of orphaned group state. Run on the leader worker only.
pub async fn run_janitor(
    directory: std::sync::Arc<GroupDirectory>,
    config: JanitorConfig,
    shutdown: std::sync::Arc<tokio::sync::Notify>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut cursor = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match directory.sweep_orphans(cursor, config.groups_per_cycle).await {
                    Ok(next) => cursor = next,
                    Err(err) => {
                        tracing::warn!(error = %err, "janitor sweep failed");
                    }
                }
            }
            _ = shutdown.notified() => return,
        }
    }
}

/// Periodic speaker-lock inspection. Run on the leader worker only.
pub async fn run_lock_inspector(
    directory: std::sync::Arc<GroupDirectory>,
    interval: Duration,
    shutdown: std::sync::Arc<tokio::sync::Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = directory.clear_expired_turns().await {
                    tracing::warn!(error = %err, "speaker lock inspection failed");
                }
            }
            _ = shutdown.notified() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaker_turn_wire_format_uses_camel_case() {
        let turn = SpeakerTurn {
            from_id: "alice".into(),
            started_at: 1_700_000_000_000,
            expires_at: 1_700_000_095_000,
        };
        let json = serde_json::to_value(&turn).expect("serialize");
        assert_eq!(json["fromId"], "alice");
        assert_eq!(json["startedAt"], 1_700_000_000_000i64);
        assert_eq!(json["expiresAt"], 1_700_000_095_000i64);
    }

    #[test]
    fn speaker_turn_roundtrips() {
        let turn = SpeakerTurn {
            from_id: "bob".into(),
            started_at: 1,
            expires_at: 2,
        };
        let json = serde_json::to_string(&turn).expect("serialize");
        let parsed: SpeakerTurn = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, turn);
    }
}
