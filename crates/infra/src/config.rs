//! Environment-based configuration.

use std::time::Duration;

use tallyforge_coordination::OrchestratorConfig;

/// Infrastructure settings, loaded from the environment with defaults that
/// work for local development.
#[derive(Debug, Clone)]
pub struct InfraConfig {
    pub redis_url: String,
    pub database_url: Option<String>,
    pub queued_ttl: Duration,
    pub running_ttl: Duration,
    pub guard_interval: Duration,
}

impl InfraConfig {
    /// Read configuration from the environment.
    ///
    /// - `REDIS_URL` (default `redis://localhost:6379`)
    /// - `DATABASE_URL` (no default; status tracking is skipped without it)
    /// - `JOB_QUEUED_TTL_SECS` / `JOB_RUNNING_TTL_SECS` / `JOB_GUARD_INTERVAL_SECS`
    pub fn from_env() -> Self {
        let redis_url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let database_url = std::env::var("DATABASE_URL").ok();

        Self {
            redis_url,
            database_url,
            queued_ttl: seconds_from_env("JOB_QUEUED_TTL_SECS", 60 * 60),
            running_ttl: seconds_from_env("JOB_RUNNING_TTL_SECS", 4 * 60 * 60),
            guard_interval: seconds_from_env("JOB_GUARD_INTERVAL_SECS", 5),
        }
    }

    /// Coordination knobs derived from this configuration.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_queued_ttl(self.queued_ttl)
            .with_running_ttl(self.running_ttl)
            .with_guard_interval(self.guard_interval)
    }
}

fn seconds_from_env(key: &str, default_secs: u64) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(default_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_duration_variables_fall_back_to_defaults() {
        assert_eq!(
            seconds_from_env("TALLYFORGE_TEST_UNSET_VARIABLE", 42),
            Duration::from_secs(42)
        );
    }

    #[test]
    fn orchestrator_config_carries_the_tuned_values() {
        let config = InfraConfig {
            redis_url: "redis://localhost:6379".to_string(),
            database_url: None,
            queued_ttl: Duration::from_secs(120),
            running_ttl: Duration::from_secs(600),
            guard_interval: Duration::from_secs(3),
        };

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.queued_ttl, Duration::from_secs(120));
        assert_eq!(orchestrator.running_ttl, Duration::from_secs(600));
        assert_eq!(orchestrator.guard_interval, Duration::from_secs(3));
    }
}
