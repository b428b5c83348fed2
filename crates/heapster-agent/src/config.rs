//! Agent configuration from the environment.

use heapster_sampler::DEFAULT_SAMPLE_PERIOD;
use std::path::PathBuf;

/// Mean bytes between samples, in decimal.
pub const SAMPLE_PERIOD_ENV: &str = "HEAPSTER_SAMPLE_PERIOD";

/// When set: profile from startup, and write the profile to this path
/// at VM death.
pub const PROFILE_PATH_ENV: &str = "HEAPSTER_PROFILE";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub sample_period: u64,
    pub profile_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sample_period: DEFAULT_SAMPLE_PERIOD,
            profile_path: None,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(SAMPLE_PERIOD_ENV) {
            match value.parse() {
                Ok(period) => config.sample_period = period,
                Err(err) => {
                    tracing::warn!("ignoring unparsable {SAMPLE_PERIOD_ENV}={value}: {err}")
                }
            }
        }

        if let Some(path) = std::env::var_os(PROFILE_PATH_ENV) {
            config.profile_path = Some(path.into());
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The environment is process-global, so a single test exercises
    // every combination.
    #[test]
    fn reads_the_environment() {
        std::env::remove_var(SAMPLE_PERIOD_ENV);
        std::env::remove_var(PROFILE_PATH_ENV);
        let config = AgentConfig::from_env();
        assert_eq!(config.sample_period, DEFAULT_SAMPLE_PERIOD);
        assert_eq!(config.profile_path, None);

        std::env::set_var(SAMPLE_PERIOD_ENV, "4096");
        std::env::set_var(PROFILE_PATH_ENV, "/tmp/app.heap");
        let config = AgentConfig::from_env();
        assert_eq!(config.sample_period, 4096);
        assert_eq!(config.profile_path, Some(PathBuf::from("/tmp/app.heap")));

        // Junk in the period variable falls back to the default.
        std::env::set_var(SAMPLE_PERIOD_ENV, "lots");
        let config = AgentConfig::from_env();
        assert_eq!(config.sample_period, DEFAULT_SAMPLE_PERIOD);

        std::env::remove_var(SAMPLE_PERIOD_ENV);
        std::env::remove_var(PROFILE_PATH_ENV);
    }
}
