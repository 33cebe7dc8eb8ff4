use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult};
use crate::source::MemorySourceConfig;

/// Top-level engine configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerConfig,
    pub ingest: IngestConfig,
    /// Used only when the engine runs on top of the in-memory source.
    pub source: MemorySourceConfig,
}

/// How a session with more ready work shares its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationPolicy {
    /// After `quantum` messages the session yields its slot to the longest
    /// waiting session, if there is one.
    Rotate,
    /// The session keeps its slot until it has no ready work.
    Drain,
}

/// Scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Admission budget: sessions worked concurrently.
    pub max_concurrent_sessions: usize,
    pub rotation: RotationPolicy,
    /// Messages a session may process per admission under `rotate`.
    pub quantum: u32,
    /// Per-session buffered message cap. `None` means unbounded.
    pub max_queue_depth: Option<usize>,
    /// Idle, empty sessions are forgotten after this long. `None` keeps them.
    pub session_retention_ms: Option<u64>,
    /// Delay before retrying a failed session lock acquisition.
    pub lock_retry_backoff_ms: u64,
    /// How long the dispatcher parks before running housekeeping.
    pub idle_timeout_ms: u64,
}

/// Handler execution configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub handler_timeout_ms: u64,
    /// Deliveries after which a failing message is dead-lettered.
    pub max_delivery_attempts: u32,
}

/// Ingestion loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub max_batch: usize,
    pub receive_wait_ms: u64,
    /// Capacity of the bounded arrival channel into the dispatcher.
    pub channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
            rotation: RotationPolicy::Rotate,
            quantum: 1,
            max_queue_depth: None,
            session_retention_ms: Some(300_000),
            lock_retry_backoff_ms: 1_000,
            idle_timeout_ms: 100,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 30_000,
            max_delivery_attempts: 10,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch: 64,
            receive_wait_ms: 100,
            channel_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfig(msg.to_string()));

        if self.dispatcher.max_concurrent_sessions == 0 {
            return invalid("dispatcher.max_concurrent_sessions must be > 0");
        }
        if self.dispatcher.quantum == 0 {
            return invalid("dispatcher.quantum must be > 0");
        }
        if self.dispatcher.max_queue_depth == Some(0) {
            return invalid("dispatcher.max_queue_depth must be > 0 when set");
        }
        if self.worker.handler_timeout_ms == 0 {
            return invalid("worker.handler_timeout_ms must be > 0");
        }
        if self.worker.max_delivery_attempts == 0 {
            return invalid("worker.max_delivery_attempts must be > 0");
        }
        if self.ingest.max_batch == 0 {
            return invalid("ingest.max_batch must be > 0");
        }
        if self.ingest.channel_capacity == 0 {
            return invalid("ingest.channel_capacity must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.dispatcher.max_concurrent_sessions, 5);
        assert_eq!(config.dispatcher.rotation, RotationPolicy::Rotate);
        assert_eq!(config.dispatcher.quantum, 1);
        assert_eq!(config.dispatcher.max_queue_depth, None);
        assert_eq!(config.worker.handler_timeout_ms, 30_000);
        assert_eq!(config.worker.max_delivery_attempts, 10);
        assert_eq!(config.ingest.max_batch, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_parsing_with_overrides() {
        let toml_str = r#"
            [dispatcher]
            max_concurrent_sessions = 800
            rotation = "drain"
            max_queue_depth = 1000

            [worker]
            handler_timeout_ms = 500

            [source]
            visibility_timeout_ms = 2000
        "#;
        let config = EngineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.dispatcher.max_concurrent_sessions, 800);
        assert_eq!(config.dispatcher.rotation, RotationPolicy::Drain);
        assert_eq!(config.dispatcher.max_queue_depth, Some(1000));
        assert_eq!(config.worker.handler_timeout_ms, 500);
        assert_eq!(config.source.visibility_timeout_ms, 2000);
        // Untouched sections keep defaults
        assert_eq!(config.ingest.channel_capacity, 10_000);
    }

    #[test]
    fn toml_parsing_empty_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.dispatcher.max_concurrent_sessions, 5);
        assert_eq!(config.dispatcher.idle_timeout_ms, 100);
    }

    #[test]
    fn zero_budget_is_rejected() {
        let err = EngineConfig::from_toml_str(
            r#"
            [dispatcher]
            max_concurrent_sessions = 0
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(msg) if msg.contains("max_concurrent_sessions")));
    }

    #[test]
    fn zero_quantum_and_depth_are_rejected() {
        let mut config = EngineConfig::default();
        config.dispatcher.quantum = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.dispatcher.max_queue_depth = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_rotation_fails_to_parse() {
        let err = EngineConfig::from_toml_str(
            r#"
            [dispatcher]
            rotation = "random"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ConfigParse(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fairway.toml");
        std::fs::write(&path, "[dispatcher]\nquantum = 4\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.dispatcher.quantum, 4);

        let missing = EngineConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, EngineError::Io(_)));
    }
}
