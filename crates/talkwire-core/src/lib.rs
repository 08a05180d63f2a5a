pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use talkwire_presence::PresenceManager;
use talkwire_store::{GroupDirectory, Store};

/// Runtime view of the configuration, shared by every component.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Router -> client liveness ping period.
    pub ping_interval: Duration,
    /// Longest silent gap tolerated inside an active audio turn before the
    /// speaker slot is released.
    pub max_idle_duration: Duration,
    /// Hard ceiling on one audio turn.
    pub max_turn_duration: Duration,
}

/// Process-scoped services, constructed once at startup and passed by
/// reference — no ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Store,
    pub groups: Arc<GroupDirectory>,
    pub presence: Arc<PresenceManager>,
    pub shutdown: Arc<Notify>,
}
