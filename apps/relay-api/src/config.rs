use std::time::Duration;

/// Relay configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Redis holding access tokens and gateway tickets. In-memory when unset.
    pub redis_url: Option<String>,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Shared secret the CRUD layer presents on `/internal` routes.
    pub internal_api_token: Option<String>,
    /// Snowflake worker id; must differ between relay processes.
    pub worker_id: u16,
    pub presence: PresenceConfig,
    pub push: PushConfig,
    /// Upper bound on any single store call made from the presence or
    /// notification path.
    pub store_timeout: Duration,
}

/// Heartbeat and presence timing.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Interval clients are told to heartbeat at.
    pub heartbeat_interval: Duration,
    /// No heartbeat from any of a user's connections for this long → `away`.
    pub away_after: Duration,
    /// Delay between the last connection closing and the status sync.
    pub offline_grace: Duration,
    /// Connections silent for this long are evicted by the liveness sweep.
    pub stale_connection_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(41_250),
            away_after: Duration::from_secs(300),
            offline_grace: Duration::from_millis(3_000),
            stale_connection_after: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

/// Web Push (VAPID) settings. Push delivery is disabled without a key pair.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub vapid_private_key_pem: Option<String>,
    /// Uncompressed P-256 public key, base64url without padding.
    pub vapid_public_key: Option<String>,
    /// `mailto:` or `https:` contact sent in the VAPID claims.
    pub vapid_subject: String,
    pub timeout: Duration,
    /// How long the push service may hold an undelivered message.
    pub ttl_secs: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            vapid_private_key_pem: None,
            vapid_public_key: None,
            vapid_subject: "mailto:ops@circle.invalid".to_string(),
            timeout: Duration::from_secs(10),
            ttl_secs: 86_400,
        }
    }
}

impl PushConfig {
    pub fn is_enabled(&self) -> bool {
        self.vapid_private_key_pem.is_some() && self.vapid_public_key.is_some()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let presence_defaults = PresenceConfig::default();
        let push_defaults = PushConfig::default();

        Self {
            database_url: required_var("DATABASE_URL"),
            redis_url: optional_var("REDIS_URL"),
            port: parsed_var("PORT").unwrap_or(4003),
            internal_api_token: optional_var("INTERNAL_API_TOKEN"),
            worker_id: parsed_var("WORKER_ID").unwrap_or(0),
            presence: PresenceConfig {
                heartbeat_interval: parsed_var("HEARTBEAT_INTERVAL_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(presence_defaults.heartbeat_interval),
                away_after: parsed_var("AWAY_AFTER_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(presence_defaults.away_after),
                offline_grace: parsed_var("OFFLINE_GRACE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(presence_defaults.offline_grace),
                stale_connection_after: parsed_var("STALE_CONNECTION_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(presence_defaults.stale_connection_after),
                sweep_interval: parsed_var("LIVENESS_SWEEP_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(presence_defaults.sweep_interval),
            },
            push: PushConfig {
                vapid_private_key_pem: optional_var("VAPID_PRIVATE_KEY_PEM")
                    .map(|pem| pem.replace("\\n", "\n")),
                vapid_public_key: optional_var("VAPID_PUBLIC_KEY"),
                vapid_subject: optional_var("VAPID_SUBJECT")
                    .unwrap_or(push_defaults.vapid_subject),
                timeout: parsed_var("PUSH_TIMEOUT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(push_defaults.timeout),
                ttl_secs: parsed_var("PUSH_TTL_SECS").unwrap_or(push_defaults.ttl_secs),
            },
            store_timeout: parsed_var("STORE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(5)),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_requires_both_keys() {
        let mut push = PushConfig::default();
        assert!(!push.is_enabled());
        push.vapid_private_key_pem = Some("pem".into());
        assert!(!push.is_enabled());
        push.vapid_public_key = Some("pub".into());
        assert!(push.is_enabled());
    }

    #[test]
    fn parsed_var_ignores_garbage() {
        std::env::set_var("RELAY_TEST_PARSED_VAR", "not-a-number");
        assert_eq!(parsed_var::<u64>("RELAY_TEST_PARSED_VAR"), None);
        std::env::set_var("RELAY_TEST_PARSED_VAR", " 42 ");
        assert_eq!(parsed_var::<u64>("RELAY_TEST_PARSED_VAR"), Some(42));
        std::env::remove_var("RELAY_TEST_PARSED_VAR");
    }

    #[test]
    fn defaults_keep_grace_below_stale_timeout() {
        let p = PresenceConfig::default();
        assert!(p.offline_grace < p.stale_connection_after);
        assert!(p.heartbeat_interval < p.stale_connection_after);
    }
}
