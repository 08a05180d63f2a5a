use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub message: MessageConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Router -> client liveness ping period (ms).
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Verify token signatures when true; best-effort decode otherwise.
    #[serde(default = "default_true")]
    pub use_authentication: bool,
    pub secret_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            use_authentication: true,
            secret_key: generate_random_hex(64),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Group janitor period (ms).
    #[serde(default = "default_clean_interval_ms")]
    pub clean_interval_ms: u64,
    /// Groups examined per janitor cycle.
    #[serde(default = "default_clean_groups_amount")]
    pub clean_groups_amount: usize,
    /// Run the janitor and keyspace-event configuration on this instance.
    /// Exactly one instance per Store should have this set.
    #[serde(default = "default_true")]
    pub leader: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            clean_interval_ms: default_clean_interval_ms(),
            clean_groups_amount: default_clean_groups_amount(),
            leader: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PresenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds before an unrefreshed online indicator expires.
    #[serde(default = "default_presence_ttl")]
    pub ttl_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: default_presence_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GroupConfig {
    /// Current-speaker lock TTL (ms).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Speaker-lock inspect period (ms).
    #[serde(default = "default_inspect_interval_ms")]
    pub inspect_interval_ms: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            inspect_interval_ms: default_inspect_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MessageConfig {
    /// Hard ceiling on one audio turn (ms).
    #[serde(default = "default_maximum_duration_ms")]
    pub maximum_duration_ms: u64,
    /// Longest silent gap tolerated within a turn (ms).
    #[serde(default = "default_maximum_idle_duration_ms")]
    pub maximum_idle_duration_ms: u64,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            maximum_duration_ms: default_maximum_duration_ms(),
            maximum_idle_duration_ms: default_maximum_idle_duration_ms(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Endpoint receiving mirrored transitions. Required when enabled.
    pub endpoint: Option<String>,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".into()
}
fn default_ping_interval_ms() -> u64 {
    120_000
}
fn default_true() -> bool {
    true
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_clean_interval_ms() -> u64 {
    60_000
}
fn default_clean_groups_amount() -> usize {
    10_000
}
fn default_presence_ttl() -> u64 {
    120
}
fn default_busy_timeout_ms() -> u64 {
    95_000
}
fn default_inspect_interval_ms() -> u64 {
    60_000
}
fn default_maximum_duration_ms() -> u64 {
    90_000
}
fn default_maximum_idle_duration_ms() -> u64 {
    3_000
}

fn validate_secret_configuration(config: &Config) -> Result<()> {
    if config.auth.use_authentication && config.auth.secret_key.trim().len() < 16 {
        anyhow::bail!(
            "Invalid auth.secret_key: use a strong random secret (at least 16 characters) when use_authentication is enabled"
        );
    }
    if config.mirror.enabled && config.mirror.endpoint.as_deref().unwrap_or("").trim().is_empty() {
        anyhow::bail!("mirror.enabled is set but mirror.endpoint is empty");
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Talkwire Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"
# Router -> client liveness ping period (ms).
ping_interval_ms = {ping_interval_ms}

[auth]
use_authentication = {use_authentication}
secret_key = "{secret_key}"

[redis]
url = "{redis_url}"
# Group janitor period (ms) and groups examined per cycle.
clean_interval_ms = {clean_interval_ms}
clean_groups_amount = {clean_groups_amount}
# Exactly one instance per Store runs the janitor and keyspace-event setup.
leader = {leader}

[presence]
enabled = {presence_enabled}
# Seconds before an unrefreshed online indicator expires.
ttl_seconds = {presence_ttl}

[group]
# Current-speaker lock TTL (ms).
busy_timeout_ms = {busy_timeout_ms}
inspect_interval_ms = {inspect_interval_ms}

[message]
maximum_duration_ms = {maximum_duration_ms}
maximum_idle_duration_ms = {maximum_idle_duration_ms}

[mirror]
# Forward online/offline transitions to an external user record store.
enabled = {mirror_enabled}
# endpoint = "https://records.example.com/api/status"
"#,
        bind_address = config.server.bind_address,
        ping_interval_ms = config.server.ping_interval_ms,
        use_authentication = config.auth.use_authentication,
        secret_key = config.auth.secret_key,
        redis_url = config.redis.url,
        clean_interval_ms = config.redis.clean_interval_ms,
        clean_groups_amount = config.redis.clean_groups_amount,
        leader = config.redis.leader,
        presence_enabled = config.presence.enabled,
        presence_ttl = config.presence.ttl_seconds,
        busy_timeout_ms = config.group.busy_timeout_ms,
        inspect_interval_ms = config.group.inspect_interval_ms,
        maximum_duration_ms = config.message.maximum_duration_ms,
        maximum_idle_duration_ms = config.message.maximum_idle_duration_ms,
        mirror_enabled = config.mirror.enabled,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();
            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, generate_config_template(&config))?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        // Environment variable overrides
        if let Ok(value) = std::env::var("TALKWIRE_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("TALKWIRE_PING_INTERVAL_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.server.ping_interval_ms = parsed;
            }
        }
        if let Ok(value) = std::env::var("TALKWIRE_USE_AUTHENTICATION") {
            if let Ok(parsed) = value.parse::<bool>() {
                config.auth.use_authentication = parsed;
            }
        }
        if let Ok(value) = std::env::var("TALKWIRE_SECRET_KEY") {
            config.auth.secret_key = value;
        }
        if let Ok(value) = std::env::var("TALKWIRE_REDIS_URL") {
            config.redis.url = value;
        }
        if let Ok(value) = std::env::var("TALKWIRE_REDIS_LEADER") {
            if let Ok(parsed) = value.parse::<bool>() {
                config.redis.leader = parsed;
            }
        }
        if let Ok(value) = std::env::var("TALKWIRE_PRESENCE_ENABLED") {
            if let Ok(parsed) = value.parse::<bool>() {
                config.presence.enabled = parsed;
            }
        }
        if let Ok(value) = std::env::var("TALKWIRE_PRESENCE_TTL_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.presence.ttl_seconds = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("TALKWIRE_GROUP_BUSY_TIMEOUT_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.group.busy_timeout_ms = parsed.max(1_000);
            }
        }
        if let Ok(value) = std::env::var("TALKWIRE_MIRROR_ENABLED") {
            if let Ok(parsed) = value.parse::<bool>() {
                config.mirror.enabled = parsed;
            }
        }
        if let Ok(value) = std::env::var("TALKWIRE_MIRROR_ENDPOINT") {
            if !value.trim().is_empty() {
                config.mirror.endpoint = Some(value);
            }
        }

        validate_secret_configuration(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:3000");
        assert_eq!(config.server.ping_interval_ms, 120_000);
        assert!(config.auth.use_authentication);
        assert_eq!(config.presence.ttl_seconds, 120);
        assert_eq!(config.group.busy_timeout_ms, 95_000);
        assert_eq!(config.message.maximum_idle_duration_ms, 3_000);
        assert_eq!(config.redis.clean_groups_amount, 10_000);
        assert!(!config.mirror.enabled);
    }

    #[test]
    fn generated_secret_is_long_enough_to_validate() {
        let config = Config::default();
        assert!(validate_secret_configuration(&config).is_ok());
        assert_eq!(config.auth.secret_key.len(), 64);
    }

    #[test]
    fn mirror_without_endpoint_is_rejected() {
        let mut config = Config::default();
        config.mirror.enabled = true;
        assert!(validate_secret_configuration(&config).is_err());
    }

    #[test]
    fn first_run_writes_a_template_that_loads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("talkwire.toml");
        let path = path.to_str().expect("utf8 path");
        let generated = Config::load(path).expect("generate");
        let reloaded = Config::load(path).expect("reload");
        assert_eq!(generated.auth.secret_key, reloaded.auth.secret_key);
        assert_eq!(reloaded.server.bind_address, "0.0.0.0:3000");
    }

    #[test]
    fn env_overrides_take_effect() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("talkwire.toml");
        std::env::set_var("TALKWIRE_PRESENCE_TTL_SECONDS", "360");
        let config = Config::load(path.to_str().expect("utf8 path")).expect("load");
        std::env::remove_var("TALKWIRE_PRESENCE_TTL_SECONDS");
        assert_eq!(config.presence.ttl_seconds, 360);
    }
}
