/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PAGE_SIZE: u32 = 50;

/// Reconnect policy for the live event stream.
/// Delay doubles per attempt starting at `base_delay`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Give up after this many consecutive failed attempts
    pub max_attempts: u32,

    pub base_delay: Duration,

    pub max_delay: Duration,

    /// Timeout for a single connect attempt
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based). `None` once attempts
    /// are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chat server address for the live event stream
    pub server_addr: String,

    /// Logged-in user id
    pub user_id: String,

    /// Display name sent with group typing indicators
    pub user_name: String,

    /// History page size
    pub page_size: u32,

    /// Delay before background prefetch of older pages starts
    pub prefetch_delay: Duration,

    /// Idle time after the last keystroke before "stopped typing" is sent
    pub typing_timeout: Duration,

    /// Max queued messages per background conversation
    pub pending_max_per_conversation: usize,

    /// Queued messages for a conversation never opened within this window are discarded
    pub pending_max_age: Duration,

    pub reconnect: ReconnectPolicy,

    /// Data directory for the local history store (defaults to `.chatsync/<user_id>`)
    pub data_dir: Option<PathBuf>,

    /// REST API base for history and sends (e.g. `http://localhost:5000/api`).
    /// Without it the client works offline against the local store.
    pub api_url: Option<String>,

    /// Bearer token for the REST API
    pub api_token: Option<String>,

    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7070".to_string(),
            user_id: String::new(),
            user_name: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            prefetch_delay: Duration::from_millis(500),
            typing_timeout: Duration::from_secs(1),
            pending_max_per_conversation: 500,
            pending_max_age: Duration::from_secs(24 * 60 * 60),
            reconnect: ReconnectPolicy::default(),
            data_dir: None,
            api_url: None,
            api_token: None,
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(SyncError::Config(format!(
                "Usage: {} <server_addr> <user_id> [--name <display_name>] [--data-dir <path>] [--page-size <n>] [--api <url>]",
                args.first().map(|s| s.as_str()).unwrap_or("chatsync")
            )));
        }

        let server_addr = args[1].clone();
        let user_id = args[2].clone();
        if user_id.is_empty() {
            return Err(SyncError::Config("user_id must not be empty".to_string()));
        }

        let mut user_name: Option<String> = None;
        let mut data_dir: Option<PathBuf> = None;
        let mut page_size: Option<u32> = None;
        let mut api_url: Option<String> = None;

        let mut i = 3;
        while i < args.len() {
            match args[i].as_str() {
                "--name" => {
                    let name = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--name requires an argument".to_string())
                    })?;
                    user_name = Some(name.clone());
                    i += 2;
                }
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--page-size" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--page-size requires a number".to_string())
                    })?;
                    page_size = Some(parse_page_size(n)?);
                    i += 2;
                }
                "--api" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--api requires a url".to_string())
                    })?;
                    api_url = Some(url.clone());
                    i += 2;
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides
        if let Ok(n) = std::env::var("CHATSYNC_PAGE_SIZE") {
            page_size = Some(parse_page_size(&n)?);
        }
        if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
            data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(url) = std::env::var("CHATSYNC_API_URL") {
            api_url = Some(url);
        }
        let api_token = std::env::var("CHATSYNC_TOKEN").ok().filter(|t| !t.is_empty());

        Ok(Self {
            server_addr,
            user_name: user_name.unwrap_or_else(|| user_id.clone()),
            user_id,
            data_dir,
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            api_url,
            api_token,
            ..Default::default()
        })
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".chatsync").join(&self.user_id))
    }
}

fn parse_page_size(raw: &str) -> Result<u32> {
    match raw.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(SyncError::Config(format!(
            "page size must be a positive number, got '{}'",
            raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reconnect_delay_is_capped_exponential() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(4000)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(5000)));
        assert_eq!(policy.delay_for(10), Some(Duration::from_millis(5000)));
        assert_eq!(policy.delay_for(11), None);
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn test_from_args() {
        let config = Config::from_args(&args(&[
            "chatsync",
            "127.0.0.1:9000",
            "u1",
            "--name",
            "Ada",
            "--data-dir",
            "/tmp/cs",
        ]))
        .unwrap();
        assert_eq!(config.server_addr, "127.0.0.1:9000");
        assert_eq!(config.user_id, "u1");
        assert_eq!(config.user_name, "Ada");
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/cs"));
        assert_eq!(config.api_url, None);
    }

    #[test]
    fn test_from_args_api_url() {
        let config = Config::from_args(&args(&[
            "chatsync",
            "127.0.0.1:9000",
            "u1",
            "--api",
            "http://localhost:5000/api",
        ]))
        .unwrap();
        assert_eq!(config.api_url.as_deref(), Some("http://localhost:5000/api"));
        assert!(Config::from_args(&args(&["chatsync", "addr", "u1", "--api"])).is_err());
    }

    #[test]
    fn test_from_args_rejects_bad_input() {
        assert!(Config::from_args(&args(&["chatsync"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "addr", "u1", "--page-size", "0"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "addr", "u1", "--bogus"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "addr", "u1", "--name"])).is_err());
    }
}
