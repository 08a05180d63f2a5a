use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, FromRedisValue};
use tokio::sync::mpsc;

use crate::error::StoreError;

const SUBSCRIBE_BACKOFF_START: Duration = Duration::from_secs(1);
const SUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(30);
const SUBSCRIBE_QUEUE_DEPTH: usize = 1024;

/// One inbound pub/sub message, already decoded to UTF-8.
#[derive(Debug, Clone)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Client for the external in-memory key/value store.
///
/// Two disjoint connection paths: `manager` issues commands and publishes
/// (multiplexed, reconnecting), while [`Store::subscribe`] opens a dedicated
/// pub/sub connection per listener — the protocol forbids mixing the two.
#[derive(Clone)]
pub struct Store {
    client: redis::Client,
    manager: ConnectionManager,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { client, manager })
    }

    /// Ask the Store to publish expired-key events on DB 0.
    ///
    /// Callers treat failure as "expiry-driven offline transitions disabled"
    /// and log it; nothing else depends on this succeeding.
    pub async fn enable_keyspace_events(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.exists(key).await?)
    }

    /// Reset a key's TTL. Returns false when the key no longer exists.
    pub async fn extend_ttl(&self, key: &str, ttl_seconds: u64) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.expire(key, ttl_seconds as i64).await?)
    }

    pub async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.hgetall(key).await?)
    }

    /// Atomically write a TTL-tracked indicator key together with its
    /// companion metadata hash.
    pub async fn put_tracked(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        meta_key: &str,
        meta_fields: &[(&str, String)],
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(key, value, ttl_seconds)
            .ignore()
            .hset_multiple(meta_key, meta_fields)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Atomically delete an indicator key and update its metadata hash.
    pub async fn drop_tracked(
        &self,
        key: &str,
        meta_key: &str,
        meta_fields: &[(&str, String)],
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(key)
            .ignore()
            .hset_multiple(meta_key, meta_fields)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// One `EXISTS` + `HGETALL` pair per entry, in a single transaction.
    pub async fn exists_with_hash(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<(bool, HashMap<String, String>)>, StoreError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, meta_key) in pairs {
            pipe.exists(key).hgetall(meta_key);
        }
        let raw: Vec<redis::Value> = pipe.query_async(&mut conn).await?;
        if raw.len() != pairs.len() * 2 {
            return Err(StoreError::Decode(format!(
                "transaction returned {} replies for {} keys",
                raw.len(),
                pairs.len()
            )));
        }
        let mut out = Vec::with_capacity(pairs.len());
        for chunk in raw.chunks_exact(2) {
            let exists = bool::from_redis_value(&chunk[0])
                .map_err(|err| StoreError::Decode(err.to_string()))?;
            let meta = HashMap::from_redis_value(&chunk[1])
                .map_err(|err| StoreError::Decode(err.to_string()))?;
            out.push((exists, meta));
        }
        Ok(out)
    }

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    /// Bidirectional membership write (`a_key += a_member`, `b_key += b_member`)
    /// in one transaction so the two sets cannot diverge.
    pub async fn set_add_pair(
        &self,
        a_key: &str,
        a_member: &str,
        b_key: &str,
        b_member: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .sadd(a_key, a_member)
            .ignore()
            .sadd(b_key, b_member)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn set_remove_pair(
        &self,
        a_key: &str,
        a_member: &str,
        b_key: &str,
        b_member: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .srem(a_key, a_member)
            .ignore()
            .srem(b_key, b_member)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.smembers(key).await?)
    }

    pub async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.scard(key).await?)
    }

    /// `SET key value NX PX ttl_ms` — returns whether the write won.
    pub async fn acquire(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// `SET key value XX PX ttl_ms` — refresh an existing entry only.
    pub async fn refresh_held(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("XX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// One cursor step of `SCAN MATCH pattern COUNT count`.
    pub async fn scan_step(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut conn = self.manager.clone();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    /// Full keyspace walk for a pattern. Used by the snapshot query, where
    /// the result set is the currently-online population.
    pub async fn scan_all(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, mut batch) = self.scan_step(cursor, pattern, 500).await?;
            keys.append(&mut batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    /// Open the dedicated subscribe connection and forward every message on
    /// the returned channel. The connection is re-established with
    /// exponential backoff and re-subscribed after any failure; the task ends
    /// when the receiver is dropped.
    pub fn subscribe(&self, channels: Vec<String>) -> mpsc::Receiver<StoreMessage> {
        self.subscribe_inner(channels, Vec::new())
    }

    /// Like [`Store::subscribe`], but with `PSUBSCRIBE` patterns as well.
    pub fn subscribe_with_patterns(
        &self,
        channels: Vec<String>,
        patterns: Vec<String>,
    ) -> mpsc::Receiver<StoreMessage> {
        self.subscribe_inner(channels, patterns)
    }

    fn subscribe_inner(
        &self,
        channels: Vec<String>,
        patterns: Vec<String>,
    ) -> mpsc::Receiver<StoreMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_QUEUE_DEPTH);
        let client = self.client.clone();
        tokio::spawn(async move {
            use futures_util::StreamExt;

            let mut backoff = SUBSCRIBE_BACKOFF_START;
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        let mut subscribed = true;
                        for channel in &channels {
                            if let Err(err) = pubsub.subscribe(channel).await {
                                tracing::warn!(%channel, error = %err, "store subscribe failed");
                                subscribed = false;
                                break;
                            }
                        }
                        for pattern in &patterns {
                            if !subscribed {
                                break;
                            }
                            if let Err(err) = pubsub.psubscribe(pattern).await {
                                tracing::warn!(%pattern, error = %err, "store psubscribe failed");
                                subscribed = false;
                            }
                        }
                        if subscribed {
                            backoff = SUBSCRIBE_BACKOFF_START;
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                let channel = msg.get_channel_name().to_string();
                                let payload: String = match msg.get_payload() {
                                    Ok(payload) => payload,
                                    Err(err) => {
                                        tracing::warn!(%channel, error = %err, "non-utf8 store message dropped");
                                        continue;
                                    }
                                };
                                if tx.send(StoreMessage { channel, payload }).await.is_err() {
                                    return;
                                }
                            }
                            tracing::warn!("store subscription lost; reconnecting");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "store subscribe connection failed");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(SUBSCRIBE_BACKOFF_MAX);
            }
        });
        rx
    }
}
