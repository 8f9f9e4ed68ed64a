use std::time::Duration;

use crate::error::EngineError;

/// Client engine configuration loaded from environment variables.
///
/// All intervals have defaults matching the coordination protocol; only
/// the server URL usually needs overriding.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the tandem API (default: `http://localhost:3000`).
    pub api_url: String,
    /// Match liveness poll interval (default: 5 s).
    pub heartbeat_interval: Duration,
    /// Presence re-publish interval (default: 10 s).
    pub presence_interval: Duration,
    /// Quiet period before the local participant turns idle (default: 60 s).
    pub idle_threshold: Duration,
    /// Countdown before an automatic requeue after a break (default: 10 s).
    pub requeue_countdown: Duration,
    /// Per-request timeout for remote calls (default: 10 s).
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000".into(),
            heartbeat_interval: Duration::from_secs(5),
            presence_interval: Duration::from_secs(10),
            idle_threshold: Duration::from_secs(60),
            requeue_countdown: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                 |
    /// |--------------------------|-------------------------|
    /// | `TANDEM_API_URL`         | `http://localhost:3000` |
    /// | `HEARTBEAT_INTERVAL_SECS`| `5`                     |
    /// | `PRESENCE_INTERVAL_SECS` | `10`                    |
    /// | `IDLE_THRESHOLD_SECS`    | `60`                    |
    /// | `REQUEUE_COUNTDOWN_SECS` | `10`                    |
    /// | `REQUEST_TIMEOUT_SECS`   | `10`                    |
    pub fn from_env() -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let api_url = std::env::var("TANDEM_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);

        Ok(Self {
            api_url,
            heartbeat_interval: secs_var("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            presence_interval: secs_var("PRESENCE_INTERVAL_SECS", defaults.presence_interval)?,
            idle_threshold: secs_var("IDLE_THRESHOLD_SECS", defaults.idle_threshold)?,
            requeue_countdown: secs_var("REQUEUE_COUNTDOWN_SECS", defaults.requeue_countdown)?,
            request_timeout: secs_var("REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
        })
    }
}

/// Read a whole-seconds variable. Zero is rejected for intervals, since
/// `tokio::time::interval` panics on a zero period.
fn secs_var(name: &str, default: Duration) -> Result<Duration, EngineError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(EngineError::Config(format!("{name} must be greater than zero"))),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => Err(EngineError::Config(format!(
            "{name} must be a whole number of seconds, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let config = EngineConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.idle_threshold, Duration::from_secs(60));
        assert_eq!(config.requeue_countdown, Duration::from_secs(10));
    }

    #[test]
    fn missing_variable_falls_back_to_default() {
        let d = secs_var("TANDEM_TEST_UNSET_VARIABLE", Duration::from_secs(7)).unwrap();
        assert_eq!(d, Duration::from_secs(7));
    }
}
