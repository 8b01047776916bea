use std::time::Duration;

pub const PERMISSION_TIMEOUT_ENV: &str = "JARVIS_PERMISSION_TIMEOUT_MS";
pub const UPDATE_CAPACITY_ENV: &str = "JARVIS_UPDATE_CAPACITY";
pub const CHUNK_DELAY_ENV: &str = "JARVIS_CHUNK_DELAY_MS";

const DEFAULT_UPDATE_CAPACITY: usize = 256;
const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(70);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// `None` waits for the user indefinitely.
    pub permission_timeout: Option<Duration>,
    /// Buffered session updates per subscriber before slow receivers lag.
    pub update_capacity: usize,
    /// Pause between scripted events.
    pub chunk_delay: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            permission_timeout: None,
            update_capacity: DEFAULT_UPDATE_CAPACITY,
            chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            permission_timeout: u64_from_env(PERMISSION_TIMEOUT_ENV)
                .filter(|value| *value > 0)
                .map(Duration::from_millis),
            update_capacity: u64_from_env(UPDATE_CAPACITY_ENV)
                .filter(|value| *value > 0)
                .and_then(|value| usize::try_from(value).ok())
                .unwrap_or(defaults.update_capacity),
            chunk_delay: u64_from_env(CHUNK_DELAY_ENV)
                .map(Duration::from_millis)
                .unwrap_or(defaults.chunk_delay),
        }
    }

    pub fn with_permission_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.permission_timeout = timeout;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

fn u64_from_env(var_name: &str) -> Option<u64> {
    let raw = std::env::var(var_name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(var = var_name, value = %raw, error = %err, "ignoring invalid setting");
            None
        }
    }
}
