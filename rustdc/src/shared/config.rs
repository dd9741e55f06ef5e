use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of hashes held by one hash block.
pub const FANOUT: usize = 16;

/// Slots in the trust cache. Client and server must agree on this value,
/// since the server mirrors the reader's cache.
pub const CACHE_SIZE: usize = 4096;

/// Largest framed message either side will accept.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Requests a subscriber may pipeline behind a blocked `wait_after`
/// before the server drops the connection.
pub const MAX_QUEUED_REQUESTS: usize = 64;

pub const DEFAULT_ADDR: &str = "127.0.0.1:6142";
pub const DEFAULT_DB_PATH: &str = "env/my_db";
pub const DEFAULT_KEY_PATH: &str = "env/server_private.pem";
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

fn default_wait_timeout_ms() -> u64 {
    DEFAULT_WAIT_TIMEOUT_MS
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: String,
    pub db_path: String,
    pub key_path: String,
    /// Upper bound on a single `wait_after` subscription request.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl ServerConfig {
    pub fn new(addr: String, db_path: String, key_path: String) -> Self {
        Self {
            addr,
            db_path,
            key_path,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_ADDR.into(),
            DEFAULT_DB_PATH.into(),
            DEFAULT_KEY_PATH.into(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_without_timeout_uses_default() {
        let c = ServerConfig::from_json(
            r#"{"addr": "0.0.0.0:7000", "db_path": "db", "key_path": "key.pem"}"#,
        )
        .unwrap();
        assert_eq!(c.addr, "0.0.0.0:7000");
        assert_eq!(c.wait_timeout(), Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS));
    }

    #[test]
    fn json_with_timeout() {
        let c = ServerConfig::from_json(
            r#"{"addr": "a", "db_path": "b", "key_path": "c", "wait_timeout_ms": 250}"#,
        )
        .unwrap();
        assert_eq!(c.wait_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn defaults_match_prototype_layout() {
        let c = ServerConfig::default();
        assert_eq!(c.addr, "127.0.0.1:6142");
        assert_eq!(c.key_path, "env/server_private.pem");
    }
}
