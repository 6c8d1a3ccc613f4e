use std::time::Duration;

/// Name of the environment variable that tells a job which slots it owns.
pub const SLOT_ENV_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// Upper bound on the formatted slot-assignment value handed to a child.
pub const MAX_ENV_VALUE_LEN: usize = 10_000;

/// Runtime configuration for a slotd server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Total number of resource slots this server manages. Must be > 0.
    pub slots: u32,
    /// TCP port for the submission listener. 0 picks an ephemeral port,
    /// which is then recorded in the server directory's port file.
    pub port: u16,
    /// Environment variable used to pass a job its slot assignment.
    pub slot_env_var: String,
    /// How long the scheduler sleeps between cycles when idle.
    pub poll_interval: Duration,
    /// Cap on the formatted slot-assignment string.
    pub max_env_value_len: usize,
    /// How long a graceful shutdown waits for running jobs before
    /// force-killing the stragglers.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            slots: 1,
            port: 0,
            slot_env_var: SLOT_ENV_VAR.to_string(),
            poll_interval: Duration::from_secs(3),
            max_env_value_len: MAX_ENV_VALUE_LEN,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn new(slots: u32, port: u16) -> Self {
        Self {
            slots,
            port,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.slots, 1);
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.slot_env_var, "CUDA_VISIBLE_DEVICES");
        assert_eq!(cfg.poll_interval, Duration::from_secs(3));
        assert_eq!(cfg.max_env_value_len, 10_000);
    }

    #[test]
    fn server_config_new_and_builders() {
        let cfg = ServerConfig::new(4, 7070)
            .with_poll_interval(Duration::from_millis(50))
            .with_drain_timeout(Duration::from_secs(5));
        assert_eq!(cfg.slots, 4);
        assert_eq!(cfg.port, 7070);
        assert_eq!(cfg.poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.drain_timeout, Duration::from_secs(5));
    }
}
