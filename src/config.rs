use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Timing and sizing knobs for the transaction engine.
///
/// Durations are (de)serialized as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Hard wall-clock budget for `Txn::run` on the initiator.
    #[serde(with = "duration_ms")]
    pub txn_timeout: Duration,
    /// Window a sync barrier waits for every node to catch up.
    #[serde(with = "duration_ms")]
    pub sync_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
    /// Bound applied to individual store calls.
    #[serde(with = "duration_ms")]
    pub store_op_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub session_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Transactions older than this are failed by the stale sweep.
    #[serde(with = "duration_ms")]
    pub txn_max_age: Duration,
    #[serde(with = "duration_ms")]
    pub election_retry_interval: Duration,
    #[serde(with = "duration_ms")]
    pub watch_retry_interval: Duration,
    pub watch_buffer: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            txn_timeout: Duration::from_secs(15),
            sync_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5),
            store_op_timeout: Duration::from_secs(5),
            session_ttl: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(5 * 60),
            txn_max_age: Duration::from_secs(5 * 60),
            election_retry_interval: Duration::from_secs(5),
            watch_retry_interval: Duration::from_millis(100),
            watch_buffer: 64,
        }
    }
}

const ENV_PREFIX: &str = "CLUSTER_TXN_";

impl TxnConfig {
    /// Load configuration from a JSON file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| Error::Io(e.to_string()))?;
        let mut config = Self::from_json(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Config(format!("JSON parse error: {}", e)))
    }

    /// Override fields from `CLUSTER_TXN_<FIELD>_MS` variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let durations: [(&str, &mut Duration); 9] = [
            ("TXN_TIMEOUT_MS", &mut self.txn_timeout),
            ("SYNC_TIMEOUT_MS", &mut self.sync_timeout),
            ("LOCK_TIMEOUT_MS", &mut self.lock_timeout),
            ("STORE_OP_TIMEOUT_MS", &mut self.store_op_timeout),
            ("SESSION_TTL_MS", &mut self.session_ttl),
            ("CLEANUP_INTERVAL_MS", &mut self.cleanup_interval),
            ("TXN_MAX_AGE_MS", &mut self.txn_max_age),
            ("ELECTION_RETRY_INTERVAL_MS", &mut self.election_retry_interval),
            ("WATCH_RETRY_INTERVAL_MS", &mut self.watch_retry_interval),
        ];

        for (name, slot) in durations {
            if let Some(raw) = lookup(name) {
                let ms: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("Invalid value for {}{}: {}", ENV_PREFIX, name, raw)))?;
                *slot = Duration::from_millis(ms);
            }
        }

        if let Some(raw) = lookup("WATCH_BUFFER") {
            self.watch_buffer = raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("Invalid watch buffer: {}", raw)))?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("txn_timeout", self.txn_timeout),
            ("sync_timeout", self.sync_timeout),
            ("lock_timeout", self.lock_timeout),
            ("store_op_timeout", self.store_op_timeout),
            ("session_ttl", self.session_ttl),
            ("cleanup_interval", self.cleanup_interval),
            ("election_retry_interval", self.election_retry_interval),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.session_ttl < Duration::from_millis(300) {
            return Err(Error::Config(
                "session_ttl must be at least 300ms to allow keep-alives".into(),
            ));
        }

        if self.sync_timeout > self.txn_timeout {
            return Err(Error::Config(
                "sync_timeout must not exceed txn_timeout".into(),
            ));
        }

        if self.watch_buffer == 0 {
            return Err(Error::Config("watch_buffer must be greater than 0".into()));
        }

        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
