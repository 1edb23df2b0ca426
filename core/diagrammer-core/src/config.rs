//! Runtime configuration (`config.toml`).
//!
//! Every section is optional; missing keys fall back to the timings the
//! lifecycle components were tuned with. A missing file yields the defaults.
//!
//! ```toml
//! port = 3737
//!
//! [supervisor]
//! max_retries = 5
//! keepalive_interval_secs = 30
//!
//! [idle]
//! enabled = true
//! inactivity_threshold_secs = 60
//!
//! [socket]
//! max_reconnect_attempts = 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagrammerConfig {
    pub port: u16,
    pub supervisor: SupervisorConfig,
    pub idle: IdleConfig,
    pub socket: SocketConfig,
}

impl Default for DiagrammerConfig {
    fn default() -> Self {
        Self {
            port: diagrammer_protocol::DEFAULT_PORT,
            supervisor: SupervisorConfig::default(),
            idle: IdleConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

impl DiagrammerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file; using defaults");
            return Ok(Self::default());
        }

        let content = fs_err::read_to_string(path)
            .map_err(|err| LifecycleError::io("Failed to read config", err))?;
        let config = toml::from_str::<Self>(&content).map_err(|err| {
            LifecycleError::ConfigMalformed {
                path: path.to_path_buf(),
                details: err.to_string(),
            }
        })?;

        let zero = config.zero_periods();
        if !zero.is_empty() {
            return Err(LifecycleError::ConfigMalformed {
                path: path.to_path_buf(),
                details: format!("periods must be greater than zero: {}", zero.join(", ")),
            });
        }
        Ok(config)
    }

    /// Timer and polling periods set to zero, by their config key.
    pub fn zero_periods(&self) -> Vec<&'static str> {
        [
            ("supervisor.readiness_poll_interval_ms", self.supervisor.readiness_poll_interval_ms),
            ("supervisor.keepalive_interval_secs", self.supervisor.keepalive_interval_secs),
            ("idle.check_interval_secs", self.idle.check_interval_secs),
            ("socket.reconnect_interval_ms", self.socket.reconnect_interval_ms),
            ("socket.keep_trying_interval_ms", self.socket.keep_trying_interval_ms),
        ]
        .into_iter()
        .filter(|(_, value)| *value == 0)
        .map(|(key, _)| key)
        .collect()
    }
}

/// Connection supervisor timings and retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub reconnect_delay_ms: u64,
    pub readiness_poll_interval_ms: u64,
    pub readiness_max_attempts: u32,
    pub keepalive_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub tool_connect_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff_ms: 3_000,
            reconnect_delay_ms: 1_000,
            readiness_poll_interval_ms: 500,
            readiness_max_attempts: 20,
            keepalive_interval_secs: 30,
            probe_timeout_ms: 2_000,
            tool_connect_timeout_secs: 10,
        }
    }
}

impl SupervisorConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms.max(1))
    }

    /// Never zero: the heartbeat ticker cannot run with an empty period.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn tool_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_connect_timeout_secs)
    }
}

/// Backend idle shutdown policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub inactivity_threshold_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 30,
            inactivity_threshold_secs: 60,
            shutdown_grace_secs: 5,
        }
    }
}

impl IdleConfig {
    /// Never zero: the idle ticker cannot run with an empty period.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Viewer push-channel reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
    pub keep_trying_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 3_000,
            keep_trying_interval_ms: 30_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl SocketConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(1))
    }

    pub fn keep_trying_interval(&self) -> Duration {
        Duration::from_millis(self.keep_trying_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = DiagrammerConfig::load(&temp_dir.path().join("missing.toml")).expect("load");
        assert_eq!(config, DiagrammerConfig::default());
        assert_eq!(config.port, 3737);
        assert_eq!(config.supervisor.max_retries, 5);
        assert_eq!(config.idle.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.socket.keep_trying_interval(), Duration::from_secs(30));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
port = 4100

[idle]
enabled = false

[socket]
max_reconnect_attempts = 2
"#,
        )
        .expect("write config");

        let config = DiagrammerConfig::load(&path).expect("load");
        assert_eq!(config.port, 4100);
        assert!(!config.idle.enabled);
        assert_eq!(config.idle.inactivity_threshold_secs, 60);
        assert_eq!(config.socket.max_reconnect_attempts, 2);
        assert_eq!(config.socket.reconnect_interval_ms, 3_000);
        assert_eq!(config.supervisor, SupervisorConfig::default());
    }

    #[test]
    fn malformed_file_is_reported_with_path() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "port = \"not a number\"").expect("write config");

        let err = DiagrammerConfig::load(&path).unwrap_err();
        assert!(matches!(err, LifecycleError::ConfigMalformed { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn zero_periods_are_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[supervisor]
keepalive_interval_secs = 0

[idle]
check_interval_secs = 0
"#,
        )
        .expect("write config");

        let err = DiagrammerConfig::load(&path).unwrap_err();
        assert!(matches!(err, LifecycleError::ConfigMalformed { .. }));
        let message = err.to_string();
        assert!(message.contains("supervisor.keepalive_interval_secs"));
        assert!(message.contains("idle.check_interval_secs"));
    }

    #[test]
    fn zero_period_accessors_never_return_zero() {
        let idle = IdleConfig {
            check_interval_secs: 0,
            ..IdleConfig::default()
        };
        let supervisor = SupervisorConfig {
            keepalive_interval_secs: 0,
            readiness_poll_interval_ms: 0,
            ..SupervisorConfig::default()
        };
        let socket = SocketConfig {
            reconnect_interval_ms: 0,
            keep_trying_interval_ms: 0,
            ..SocketConfig::default()
        };
        assert_eq!(idle.check_interval(), Duration::from_secs(1));
        assert_eq!(supervisor.keepalive_interval(), Duration::from_secs(1));
        assert!(!supervisor.readiness_poll_interval().is_zero());
        assert!(!socket.reconnect_interval().is_zero());
        assert!(!socket.keep_trying_interval().is_zero());
        assert!(DiagrammerConfig::default().zero_periods().is_empty());
    }
}
