use std::env;
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::ChatError;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_RECORD_TTL_SECONDS: u64 = 86_400;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_millis(3000);
pub const DEFAULT_PEER_NICKNAME: &str = "Peer";

const OPEN_RELAY_CREDENTIAL: &str = "openrelayproject";

/// Per-session knobs, independent of which store or transport backs the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub display_name: String,
    pub channel_label: String,
    /// How long a peer's typing indicator stays on without another `typing` or `chat`.
    pub typing_timeout: Duration,
    /// Delay between noticing the channel closed and tearing the session down.
    pub disconnect_grace: Duration,
    /// `None` waits for the channel to open indefinitely.
    pub negotiation_timeout: Option<Duration>,
}

impl SessionSettings {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    pub fn with_typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing_timeout = timeout;
        self
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Trims the display name and rejects an empty one.
    pub fn validate(mut self) -> Result<Self, ChatError> {
        let trimmed = self.display_name.trim();
        if trimmed.is_empty() {
            return Err(ChatError::InvalidConfig(
                "display name must not be empty".into(),
            ));
        }
        self.display_name = trimmed.to_string();
        if self.channel_label.is_empty() {
            return Err(ChatError::InvalidConfig(
                "channel label must not be empty".into(),
            ));
        }
        Ok(self)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            channel_label: crate::transport::CHAT_CHANNEL_LABEL.to_string(),
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            negotiation_timeout: None,
        }
    }
}

/// beach-chat application configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub redis_url: String,
    /// Expiry applied to every signaling key so abandoned records age out.
    pub record_ttl_seconds: u64,
    pub poll_interval: Duration,
    pub ice_servers: Vec<RTCIceServer>,
    pub localhost_only: bool,
    pub session: SessionSettings,
}

impl ChatConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let redis_url = env::var("BEACH_CHAT_REDIS_URL")
            .or_else(|_| env::var("REDIS_URL"))
            .unwrap_or(defaults.redis_url);

        let record_ttl_seconds = env::var("BEACH_CHAT_RECORD_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.record_ttl_seconds);

        let poll_interval = env_millis("BEACH_CHAT_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval);

        let localhost_only = env::var("BEACH_CHAT_LOCALHOST_ONLY").is_ok();
        let ice_servers = if localhost_only {
            vec![]
        } else {
            defaults.ice_servers
        };

        let mut session = defaults.session;
        if let Ok(name) = env::var("BEACH_CHAT_NAME") {
            session.display_name = name;
        }
        if let Some(timeout) = env_millis("BEACH_CHAT_TYPING_TIMEOUT_MS") {
            session.typing_timeout = timeout;
        }
        if let Some(grace) = env_millis("BEACH_CHAT_DISCONNECT_GRACE_MS") {
            session.disconnect_grace = grace;
        }
        session.negotiation_timeout = env::var("BEACH_CHAT_NEGOTIATION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            redis_url,
            record_ttl_seconds,
            poll_interval,
            ice_servers,
            localhost_only,
            session,
        }
    }

    /// No STUN/TURN, loopback candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            localhost_only: true,
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.session.display_name = name.into();
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            record_ttl_seconds: DEFAULT_RECORD_TTL_SECONDS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ice_servers: default_ice_servers(),
            localhost_only: false,
            session: SessionSettings::default(),
        }
    }
}

pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![
        RTCIceServer {
            urls: vec![
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        },
        RTCIceServer {
            urls: vec!["stun:openrelay.metered.ca:80".to_string()],
            ..Default::default()
        },
        RTCIceServer {
            urls: vec![
                "turn:openrelay.metered.ca:80".to_string(),
                "turn:openrelay.metered.ca:443".to_string(),
            ],
            username: OPEN_RELAY_CREDENTIAL.to_string(),
            credential: OPEN_RELAY_CREDENTIAL.to_string(),
            ..Default::default()
        },
    ]
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const KEYS: &[&str] = &[
        "BEACH_CHAT_NAME",
        "BEACH_CHAT_REDIS_URL",
        "REDIS_URL",
        "BEACH_CHAT_RECORD_TTL",
        "BEACH_CHAT_POLL_INTERVAL_MS",
        "BEACH_CHAT_LOCALHOST_ONLY",
        "BEACH_CHAT_TYPING_TIMEOUT_MS",
        "BEACH_CHAT_DISCONNECT_GRACE_MS",
        "BEACH_CHAT_NEGOTIATION_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test_timeout::timeout]
    fn default_config() {
        let config = ChatConfig::default();
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.record_ttl_seconds, 86_400);
        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(config.session.channel_label, "chat");
        assert_eq!(config.session.typing_timeout, Duration::from_millis(2000));
        assert_eq!(config.session.disconnect_grace, Duration::from_millis(3000));
        assert!(config.session.negotiation_timeout.is_none());
    }

    #[test_timeout::timeout]
    fn from_env_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        let config = ChatConfig::from_env();
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert!(!config.localhost_only);
        assert!(config.session.display_name.is_empty());
    }

    #[test_timeout::timeout]
    fn from_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        unsafe {
            env::set_var("BEACH_CHAT_NAME", "river");
            env::set_var("REDIS_URL", "redis://fallback:6379");
            env::set_var("BEACH_CHAT_RECORD_TTL", "60");
            env::set_var("BEACH_CHAT_LOCALHOST_ONLY", "1");
            env::set_var("BEACH_CHAT_TYPING_TIMEOUT_MS", "500");
            env::set_var("BEACH_CHAT_NEGOTIATION_TIMEOUT_SECS", "30");
            env::set_var("BEACH_CHAT_POLL_INTERVAL_MS", "not-a-number");
        }
        let config = ChatConfig::from_env();
        clear_env();

        assert_eq!(config.redis_url, "redis://fallback:6379");
        assert_eq!(config.record_ttl_seconds, 60);
        assert!(config.localhost_only);
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.session.display_name, "river");
        assert_eq!(config.session.typing_timeout, Duration::from_millis(500));
        assert_eq!(
            config.session.negotiation_timeout,
            Some(Duration::from_secs(30))
        );
    }

    #[test_timeout::timeout]
    fn primary_redis_url_wins_over_fallback() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        unsafe {
            env::set_var("BEACH_CHAT_REDIS_URL", "redis://primary:6379");
            env::set_var("REDIS_URL", "redis://fallback:6379");
        }
        let config = ChatConfig::from_env();
        clear_env();

        assert_eq!(config.redis_url, "redis://primary:6379");
    }

    #[test_timeout::timeout]
    fn validate_rejects_blank_names() {
        assert!(matches!(
            SessionSettings::new("   ").validate(),
            Err(ChatError::InvalidConfig(_))
        ));
        let settings = SessionSettings::new("  sam ").validate().unwrap();
        assert_eq!(settings.display_name, "sam");
    }
}
