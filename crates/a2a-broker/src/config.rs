use std::time::Duration;

use derive_builder::Builder;

/// Default message time-to-live before a pending request is reclaimed.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;
pub const DEFAULT_HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_RESOLVED_HISTORY: usize = 1024;
pub const DEFAULT_SESSION_RETENTION: usize = 1024;
pub const DEFAULT_OFFLINE_AGENT_RETENTION: usize = 1024;
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Tunables shared by every broker component.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct BrokerConfig {
    /// Deadline applied to requests that do not carry their own.
    #[builder(default = "DEFAULT_DEADLINE")]
    pub default_deadline: Duration,
    /// Maximum number of undelivered events buffered per stream.
    #[builder(default = "DEFAULT_STREAM_CAPACITY")]
    pub stream_capacity: usize,
    #[builder(default = "DEFAULT_HEARTBEAT_SWEEP_INTERVAL")]
    pub heartbeat_sweep_interval: Duration,
    /// Agents that heartbeat and then go silent for longer than this are degraded.
    #[builder(default = "DEFAULT_HEARTBEAT_TIMEOUT")]
    pub heartbeat_timeout: Duration,
    /// Number of finished correlations whose final state is remembered.
    #[builder(default = "DEFAULT_RESOLVED_HISTORY")]
    pub resolved_history: usize,
    /// Number of terminal session records kept for status queries.
    #[builder(default = "DEFAULT_SESSION_RETENTION")]
    pub session_retention: usize,
    /// Number of deregistered agents still answered by `lookup`.
    #[builder(default = "DEFAULT_OFFLINE_AGENT_RETENTION")]
    pub offline_agent_retention: usize,
    #[builder(default = "DEFAULT_KEEP_ALIVE_INTERVAL")]
    pub keep_alive_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_deadline: DEFAULT_DEADLINE,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            heartbeat_sweep_interval: DEFAULT_HEARTBEAT_SWEEP_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            resolved_history: DEFAULT_RESOLVED_HISTORY,
            session_retention: DEFAULT_SESSION_RETENTION,
            offline_agent_retention: DEFAULT_OFFLINE_AGENT_RETENTION,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_match_default() {
        let built = BrokerConfigBuilder::default().build().unwrap();
        let default = BrokerConfig::default();

        assert_eq!(built.default_deadline, default.default_deadline);
        assert_eq!(built.stream_capacity, default.stream_capacity);
        assert_eq!(built.heartbeat_timeout, default.heartbeat_timeout);
        assert_eq!(built.session_retention, default.session_retention);
    }

    #[test]
    fn test_builder_overrides() {
        let config = BrokerConfigBuilder::default()
            .default_deadline(Duration::from_millis(50))
            .stream_capacity(4usize)
            .build()
            .unwrap();

        assert_eq!(config.default_deadline, Duration::from_millis(50));
        assert_eq!(config.stream_capacity, 4);
        assert_eq!(config.resolved_history, DEFAULT_RESOLVED_HISTORY);
    }
}
