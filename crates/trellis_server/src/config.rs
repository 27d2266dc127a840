//! Server configuration, loaded from a JSON file.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use trellis_runtime::{EngineConfig, PoolResourceConfig, TaskQueueConfig};
use trellis_stream::StreamServerConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Path
        path: String,
        /// Cause
        source: std::io::Error,
    },

    /// File is not a valid config
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// Path
        path: String,
        /// Cause
        source: serde_json::Error,
    },

    /// Values are inconsistent
    #[error("Invalid config field {field}: {reason}")]
    Invalid {
        /// Field
        field: String,
        /// Reason
        reason: String,
    },
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the stream listener binds
    pub listen: String,
    /// Instance id stamped on sessions started here
    pub instance_id: u64,
    /// Task queues
    pub task_queues: Vec<TaskQueueConfig>,
    /// Pool resource settings
    pub pool: PoolResourceConfig,
    /// Interval of the report loop
    pub report_interval_ms: u64,
    /// Interval of the pool sample loop
    pub pool_sample_interval_ms: u64,
    /// Deadline for graphs that set none; 0 disables
    pub default_timeout_ms: u64,
    /// Poll interval while draining streams and snapshots
    pub stop_poll_interval_ms: u64,
    /// Start forked sub-graphs from their task queue
    pub async_mode: bool,
    /// Queue ratio reported as saturated
    pub backpressure_threshold: f64,
    /// Peers sub-graphs can be forked to
    pub peers: IndexMap<String, SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7800".to_string(),
            instance_id: 0,
            task_queues: vec![TaskQueueConfig::default()],
            pool: PoolResourceConfig::default(),
            report_interval_ms: 10_000,
            pool_sample_interval_ms: 1_000,
            default_timeout_ms: 0,
            stop_poll_interval_ms: 10,
            async_mode: true,
            backpressure_threshold: 0.8,
            peers: IndexMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot
    ///
    /// # Errors
    ///
    /// Returns error on the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: String| ConfigError::Invalid {
            field: field.to_string(),
            reason,
        };
        if self.listen.parse::<SocketAddr>().is_err() {
            return Err(invalid("listen", format!("{} is not a socket address", self.listen)));
        }
        for queue in &self.task_queues {
            queue
                .validate()
                .map_err(|e| invalid("task_queues", e.to_string()))?;
        }
        if self.report_interval_ms == 0 || self.pool_sample_interval_ms == 0 {
            return Err(invalid("report_interval_ms", "intervals must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.backpressure_threshold) {
            return Err(invalid(
                "backpressure_threshold",
                format!("{} is outside [0, 1]", self.backpressure_threshold),
            ));
        }
        Ok(())
    }

    /// Set the listen address
    #[must_use]
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    /// Set the instance id
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: u64) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Add a task queue
    #[must_use]
    pub fn with_task_queue(mut self, queue: TaskQueueConfig) -> Self {
        self.task_queues.retain(|q| q.name != queue.name);
        self.task_queues.push(queue);
        self
    }

    /// Set the report interval
    #[must_use]
    pub fn with_report_interval_ms(mut self, interval_ms: u64) -> Self {
        self.report_interval_ms = interval_ms;
        self
    }

    /// Set the pool sample interval
    #[must_use]
    pub fn with_pool_sample_interval_ms(mut self, interval_ms: u64) -> Self {
        self.pool_sample_interval_ms = interval_ms;
        self
    }

    /// Add a peer
    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>, addr: SocketAddr) -> Self {
        self.peers.insert(peer.into(), addr);
        self
    }

    /// Engine settings derived from this config
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::default()
            .with_instance_id(self.instance_id)
            .with_default_timeout_ms(self.default_timeout_ms)
            .with_pool(self.pool.clone())
            .with_drain_poll_ms(self.stop_poll_interval_ms);
        for queue in &self.task_queues {
            engine = engine.with_task_queue(queue.clone());
        }
        engine
    }

    /// Stream server settings derived from this config
    #[must_use]
    pub fn stream_config(&self) -> StreamServerConfig {
        StreamServerConfig::default()
            .with_async_mode(self.async_mode)
            .with_stop_poll_ms(self.stop_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_partial_config() {
        let file = write(
            r#"{
                "listen": "0.0.0.0:9000",
                "instance_id": 4,
                "task_queues": [{ "name": "io", "thread_num": 2 }],
                "peers": { "w1": "10.0.0.2:7800" }
            }"#,
        );
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.instance_id, 4);
        assert_eq!(config.task_queues[0].name, "io");
        assert_eq!(config.task_queues[0].thread_num, 2);
        assert_eq!(config.report_interval_ms, 10_000);
        assert_eq!(config.peers["w1"].port(), 7800);

        let engine = config.engine_config();
        assert_eq!(engine.instance_id, 4);
        assert!(engine.task_queues.iter().any(|q| q.name == "io"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_bad_json() {
        let file = write("{ not json");
        assert!(matches!(
            ServerConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_listen = ServerConfig::default().with_listen("nowhere");
        assert!(matches!(
            bad_listen.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "listen"
        ));

        let bad_interval = ServerConfig::default().with_report_interval_ms(0);
        assert!(bad_interval.validate().is_err());

        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_stream_config() {
        let mut config = ServerConfig::default();
        config.async_mode = false;
        config.stop_poll_interval_ms = 3;
        let stream = config.stream_config();
        assert!(!stream.async_mode);
        assert_eq!(stream.stop_poll_ms, 3);
    }
}
