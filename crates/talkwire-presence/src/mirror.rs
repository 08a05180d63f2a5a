use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::manager::PresenceUpdate;

/// Fire-and-forget sink for online/offline transitions.
///
/// The mirror never blocks or fails a presence operation; implementations
/// swallow their own errors.
#[async_trait]
pub trait StatusMirror: Send + Sync {
    async fn record(&self, update: &PresenceUpdate);
}

/// Mirrors transitions to an external user record store over HTTP.
pub struct HttpStatusMirror {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpStatusMirror {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, endpoint }
    }
}

#[async_trait]
impl StatusMirror for HttpStatusMirror {
    async fn record(&self, update: &PresenceUpdate) {
        match self.client.post(&self.endpoint).json(update).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(user_id = %update.user_id, "status mirrored");
            }
            Ok(response) => {
                warn!(
                    user_id = %update.user_id,
                    status = %response.status(),
                    "status mirror rejected update"
                );
            }
            Err(err) => {
                warn!(user_id = %update.user_id, error = %err, "status mirror unreachable");
            }
        }
    }
}
