/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_HISTORY_URL: &str = "http://127.0.0.1:8081";

/// Chat session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Signed-in user's id, supplied by the identity provider
    pub user_id: String,

    /// Live channel address (host:port)
    pub server_addr: String,

    /// Base URL of the history service
    pub history_url: String,

    /// Bearer token for the history service
    pub auth_token: Option<String>,

    /// Seed conversations from the history service on activation
    pub fetch_history: bool,

    /// Timeout for establishing the transport
    pub connect_timeout: Duration,

    /// Timeout for one invocation round trip
    pub invoke_timeout: Duration,

    /// Idle time after which the transport pings the server
    pub keepalive_interval: Duration,

    /// First reconnect delay after a drop
    pub reconnect_initial_delay: Duration,

    /// Upper bound for the reconnect delay
    pub reconnect_max_delay: Duration,

    /// Give up reconnecting after this many attempts (None = never)
    pub max_reconnect_attempts: Option<u32>,

    /// Capacity of the transport event and signal channels
    pub event_buffer: usize,

    /// Server method invoked to join the user's channel
    pub join_method: String,

    /// Server method invoked to send a message
    pub send_method: String,

    /// Server event carrying inbound messages
    pub receive_event: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            server_addr: "127.0.0.1:8080".to_string(),
            history_url: DEFAULT_HISTORY_URL.to_string(),
            auth_token: None,
            fetch_history: true,
            connect_timeout: Duration::from_secs(10),
            invoke_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
            event_buffer: 256,
            join_method: "JoinChat".to_string(),
            send_method: "SendMessage".to_string(),
            receive_event: "ReceiveMessage".to_string(),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(ChatError::Config(format!(
                "Usage: {} <user_id> <server_addr> [--history-url <url>] [--token <token>] [--max-reconnects <n>] [--no-history]",
                args.first().map(String::as_str).unwrap_or("leasechat")
            )));
        }

        let user_id = args[1].clone();
        let server_addr = args[2].clone();

        let mut history_url: Option<String> = None;
        let mut auth_token: Option<String> = None;
        let mut max_reconnect_attempts: Option<u32> = None;
        let mut fetch_history = true;

        let mut i = 3;
        while i < args.len() {
            match args[i].as_str() {
                "--history-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--history-url requires a URL argument".to_string())
                    })?;
                    history_url = Some(url.clone());
                    i += 2;
                }
                "--token" => {
                    let token = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--token requires a value".to_string())
                    })?;
                    auth_token = Some(token.clone());
                    i += 2;
                }
                "--max-reconnects" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--max-reconnects requires a number".to_string())
                    })?;
                    max_reconnect_attempts = Some(n.parse::<u32>().map_err(|_| {
                        ChatError::Config("--max-reconnects must be a valid number".to_string())
                    })?);
                    i += 2;
                }
                "--no-history" => {
                    fetch_history = false;
                    i += 1;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides
        if let Ok(url) = std::env::var("LEASECHAT_HISTORY_URL") {
            history_url = Some(url);
        }
        if let Ok(token) = std::env::var("LEASECHAT_TOKEN") {
            auth_token = Some(token);
        }
        if let Some(n) = std::env::var("LEASECHAT_MAX_RECONNECTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            max_reconnect_attempts = Some(n);
        }

        let config = Self {
            user_id,
            server_addr,
            history_url: history_url.unwrap_or_else(|| DEFAULT_HISTORY_URL.to_string()),
            auth_token,
            fetch_history,
            max_reconnect_attempts,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(ChatError::Config("user id must not be empty".to_string()));
        }
        if self.server_addr.trim().is_empty() {
            return Err(ChatError::Config("server address must not be empty".to_string()));
        }
        if self.connect_timeout.is_zero() || self.invoke_timeout.is_zero() {
            return Err(ChatError::Config("timeouts must be non-zero".to_string()));
        }
        if self.reconnect_initial_delay > self.reconnect_max_delay {
            return Err(ChatError::Config(
                "reconnect initial delay exceeds max delay".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ChatError::Config("event buffer must be non-zero".to_string()));
        }
        Ok(())
    }
}
