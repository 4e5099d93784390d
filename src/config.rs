use crate::gateway::events::ConnectionProperties;
use crate::gateway::intents;

/// Client configuration. Built either programmatically starting from
/// `ClientConfig::new(token)` or from `ACCORD_*` environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Auth token, including its `"Bot "` / `"Bearer "` prefix.
    pub token: String,
    /// REST base URL.
    pub api_url: String,
    /// Fixed gateway socket URL. When unset the URL is resolved through
    /// the REST surface before each connection attempt.
    pub gateway_url: Option<String>,
    /// IDENTIFY intent bitmask, see `gateway::intents`.
    pub intents: u64,
    pub properties: ConnectionProperties,
    pub compress: Option<bool>,
    pub large_threshold: Option<u64>,
    /// `[shard_id, shard_count]`
    pub shard: Option<[u64; 2]>,
    pub presence: Option<serde_json::Value>,
    /// Slots in the dispatch reorder buffer. Must cover the worst-case
    /// out-of-order window; overflowing it is fatal.
    pub sequencer_capacity: usize,
    /// Un-acked heartbeats tolerated before forcing a reconnect.
    /// 0 means an ack must arrive before the next tick.
    pub missed_heartbeat_limit: u32,
    /// Seconds to wait for HELLO after the socket opens.
    pub hello_timeout_secs: u64,
    /// Ceiling for exponential reconnect backoff, in seconds.
    pub reconnect_cap_secs: u64,
    /// Times a request may be re-queued by rate limiting before its
    /// future fails.
    pub max_retries: u32,
    /// Requests released per drain tick while a global window is active.
    pub global_batch_size: usize,
}

impl ClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_url: "http://127.0.0.1:39099".to_string(),
            gateway_url: None,
            intents: intents::unprivileged(),
            properties: ConnectionProperties::default(),
            compress: None,
            large_threshold: None,
            shard: None,
            presence: None,
            sequencer_capacity: 512,
            missed_heartbeat_limit: 1,
            hello_timeout_secs: 30,
            reconnect_cap_secs: 60,
            max_retries: 5,
            global_batch_size: 50,
        }
    }

    pub fn from_env() -> Self {
        let token = std::env::var("ACCORD_TOKEN").expect("ACCORD_TOKEN is required");
        let mut config = Self::new(token);

        if let Ok(url) = std::env::var("ACCORD_API_URL") {
            config.api_url = url;
        }
        config.gateway_url = std::env::var("ACCORD_GATEWAY_URL").ok();
        config.intents = std::env::var("ACCORD_INTENTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.intents);
        config.sequencer_capacity = std::env::var("ACCORD_SEQUENCER_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.sequencer_capacity);
        config.missed_heartbeat_limit = std::env::var("ACCORD_MISSED_HEARTBEAT_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.missed_heartbeat_limit);
        config.max_retries = std::env::var("ACCORD_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.max_retries);

        config
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }

    pub fn with_intents(mut self, intents: u64) -> Self {
        self.intents = intents;
        self
    }

    pub fn with_shard(mut self, id: u64, count: u64) -> Self {
        self.shard = Some([id, count]);
        self
    }

    pub fn with_presence(mut self, presence: serde_json::Value) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn with_sequencer_capacity(mut self, capacity: usize) -> Self {
        self.sequencer_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var("ACCORD_TOKEN");
        std::env::remove_var("ACCORD_API_URL");
        std::env::remove_var("ACCORD_GATEWAY_URL");
        std::env::remove_var("ACCORD_INTENTS");
        std::env::remove_var("ACCORD_SEQUENCER_CAPACITY");
        std::env::remove_var("ACCORD_MISSED_HEARTBEAT_LIMIT");
        std::env::remove_var("ACCORD_MAX_RETRIES");
    }

    #[test]
    #[serial]
    fn test_default_config() {
        clear_env();
        let config = ClientConfig::new("Bot abc");
        assert_eq!(config.api_url, "http://127.0.0.1:39099");
        assert_eq!(config.intents, intents::unprivileged());
        assert_eq!(config.sequencer_capacity, 512);
        assert!(config.gateway_url.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("ACCORD_TOKEN", "Bot xyz");
        std::env::set_var("ACCORD_API_URL", "http://example.test:9000");
        std::env::set_var("ACCORD_GATEWAY_URL", "ws://example.test:9000/ws");
        std::env::set_var("ACCORD_INTENTS", "17");
        let config = ClientConfig::from_env();
        assert_eq!(config.token, "Bot xyz");
        assert_eq!(config.api_url, "http://example.test:9000");
        assert_eq!(config.gateway_url.as_deref(), Some("ws://example.test:9000/ws"));
        assert_eq!(config.intents, 17);
    }

    #[test]
    #[serial]
    fn test_invalid_numeric_env_falls_back_to_default() {
        clear_env();
        std::env::set_var("ACCORD_TOKEN", "Bot xyz");
        std::env::set_var("ACCORD_SEQUENCER_CAPACITY", "not_a_number");
        let config = ClientConfig::from_env();
        assert_eq!(config.sequencer_capacity, 512);
    }

    #[test]
    #[serial]
    #[should_panic(expected = "ACCORD_TOKEN is required")]
    fn test_missing_token_panics() {
        clear_env();
        ClientConfig::from_env();
    }

    #[test]
    #[serial]
    fn test_builder_setters() {
        clear_env();
        let config = ClientConfig::new("Bearer t")
            .with_intents(intents::MESSAGES | intents::SPACES)
            .with_shard(0, 2)
            .with_sequencer_capacity(64);
        assert_eq!(config.intents, intents::MESSAGES | intents::SPACES);
        assert_eq!(config.shard, Some([0, 2]));
        assert_eq!(config.sequencer_capacity, 64);
    }
}
