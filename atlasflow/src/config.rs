//! Pipeline configuration.
//!
//! Configuration is code-first with builder methods, plus a `from_env`
//! constructor for deployments that configure through `ATLAS_`-prefixed
//! environment variables.

use crate::core::{Stage, STAGE_SEQUENCE};
use std::env;
use std::time::Duration;

/// Per-stage execution policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePolicy {
    /// When true the stage advances to its successor on completion without
    /// waiting for a user proceed signal.
    pub auto_advance: bool,

    /// Attempt budget for remote activities, including the first attempt.
    pub max_attempts: u32,

    /// Base delay for exponential backoff between activity attempts.
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay.
    pub backoff_max_ms: u64,

    /// Execution budget for a single activity attempt.
    pub activity_timeout_ms: u64,

    /// Extra headroom added to the per-stage deadline on top of the summed
    /// activity budgets.
    pub stage_slack_ms: u64,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            auto_advance: false,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            activity_timeout_ms: 30_000,
            stage_slack_ms: 5_000,
        }
    }
}

impl StagePolicy {
    /// Sets auto-advance.
    #[must_use]
    pub const fn with_auto_advance(mut self, auto_advance: bool) -> Self {
        self.auto_advance = auto_advance;
        self
    }

    /// Sets the remote attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff window.
    #[must_use]
    pub const fn with_backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.backoff_base_ms = base;
        self.backoff_max_ms = max;
        self
    }

    /// Sets the per-activity budget.
    #[must_use]
    pub const fn with_activity_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.activity_timeout_ms = timeout_ms;
        self
    }

    /// The per-activity budget as a [`Duration`].
    #[must_use]
    pub const fn activity_timeout(&self) -> Duration {
        Duration::from_millis(self.activity_timeout_ms)
    }

    /// Deadline for a dispatch that plans `activity_count` activities:
    /// the summed activity budgets plus slack.
    #[must_use]
    pub fn stage_deadline(&self, activity_count: usize) -> Duration {
        let total = self
            .activity_timeout_ms
            .saturating_mul(activity_count as u64)
            .saturating_add(self.stage_slack_ms);
        Duration::from_millis(total)
    }
}

/// Retry policy for re-driving a stage dispatch after an infrastructure
/// failure. Distinct from activity retries: the dispatch never recorded a
/// result, so re-driving it is not a new attempt class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRetry {
    /// Total dispatch attempts before the stage is marked failed.
    pub max_attempts: u32,

    /// Flat delay between re-drives.
    pub backoff_ms: u64,
}

impl Default for DispatchRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Policy for the Prospect stage.
    pub prospect: StagePolicy,

    /// Policy for the Extract stage.
    pub extract: StagePolicy,

    /// Policy for the Transmute stage.
    pub transmute: StagePolicy,

    /// Policy for the Confer stage.
    pub confer: StagePolicy,

    /// Attempt budget for local (pure compute) activities. Local work is
    /// deterministic, so the default gives it a single attempt.
    pub local_max_attempts: u32,

    /// Re-drive policy after infrastructure failures.
    pub dispatch_retry: DispatchRetry,

    /// Formats rendered by Confer when the entity requests none.
    pub default_formats: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prospect: StagePolicy::default(),
            extract: StagePolicy::default(),
            transmute: StagePolicy::default(),
            confer: StagePolicy::default(),
            local_max_attempts: 1,
            dispatch_retry: DispatchRetry::default(),
            default_formats: vec!["digest".to_string()],
        }
    }
}

impl PipelineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads configuration from `ATLAS_`-prefixed environment variables.
    ///
    /// Global knobs (`ATLAS_MAX_ATTEMPTS`, `ATLAS_BACKOFF_BASE_MS`,
    /// `ATLAS_BACKOFF_MAX_MS`, `ATLAS_ACTIVITY_TIMEOUT_MS`,
    /// `ATLAS_AUTO_ADVANCE`, `ATLAS_DEFAULT_FORMATS`) apply to all stages;
    /// `ATLAS_<STAGE>_AUTO_ADVANCE` overrides the gate per stage.
    /// Unset or unparsable variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(auto) = env_bool("ATLAS_AUTO_ADVANCE") {
            config = config.with_auto_advance_all(auto);
        }
        if let Some(attempts) = env_parse::<u32>("ATLAS_MAX_ATTEMPTS") {
            for stage in STAGE_SEQUENCE {
                config.policy_mut(stage).max_attempts = attempts;
            }
        }
        if let Some(base) = env_parse::<u64>("ATLAS_BACKOFF_BASE_MS") {
            for stage in STAGE_SEQUENCE {
                config.policy_mut(stage).backoff_base_ms = base;
            }
        }
        if let Some(max) = env_parse::<u64>("ATLAS_BACKOFF_MAX_MS") {
            for stage in STAGE_SEQUENCE {
                config.policy_mut(stage).backoff_max_ms = max;
            }
        }
        if let Some(timeout) = env_parse::<u64>("ATLAS_ACTIVITY_TIMEOUT_MS") {
            for stage in STAGE_SEQUENCE {
                config.policy_mut(stage).activity_timeout_ms = timeout;
            }
        }
        if let Some(attempts) = env_parse::<u32>("ATLAS_DISPATCH_MAX_ATTEMPTS") {
            config.dispatch_retry.max_attempts = attempts;
        }
        if let Some(backoff) = env_parse::<u64>("ATLAS_DISPATCH_BACKOFF_MS") {
            config.dispatch_retry.backoff_ms = backoff;
        }
        if let Ok(formats) = env::var("ATLAS_DEFAULT_FORMATS") {
            let parsed: Vec<String> = formats
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                config.default_formats = parsed;
            }
        }
        for stage in STAGE_SEQUENCE {
            let key = format!("ATLAS_{}_AUTO_ADVANCE", stage.as_str().to_uppercase());
            if let Some(auto) = env_bool(&key) {
                config.policy_mut(stage).auto_advance = auto;
            }
        }

        config
    }

    /// The policy for a stage.
    #[must_use]
    pub const fn policy(&self, stage: Stage) -> &StagePolicy {
        match stage {
            Stage::Prospect => &self.prospect,
            Stage::Extract => &self.extract,
            Stage::Transmute => &self.transmute,
            Stage::Confer => &self.confer,
        }
    }

    /// Mutable access to a stage policy.
    pub fn policy_mut(&mut self, stage: Stage) -> &mut StagePolicy {
        match stage {
            Stage::Prospect => &mut self.prospect,
            Stage::Extract => &mut self.extract,
            Stage::Transmute => &mut self.transmute,
            Stage::Confer => &mut self.confer,
        }
    }

    /// Replaces the policy for one stage.
    #[must_use]
    pub fn with_stage_policy(mut self, stage: Stage, policy: StagePolicy) -> Self {
        *self.policy_mut(stage) = policy;
        self
    }

    /// Sets auto-advance on every stage.
    #[must_use]
    pub fn with_auto_advance_all(mut self, auto_advance: bool) -> Self {
        for stage in STAGE_SEQUENCE {
            self.policy_mut(stage).auto_advance = auto_advance;
        }
        self
    }

    /// Sets the dispatch re-drive policy.
    #[must_use]
    pub const fn with_dispatch_retry(mut self, retry: DispatchRetry) -> Self {
        self.dispatch_retry = retry;
        self
    }

    /// Sets the default output formats.
    #[must_use]
    pub fn with_default_formats(mut self, formats: Vec<String>) -> Self {
        self.default_formats = formats;
        self
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = StagePolicy::default();
        assert!(!policy.auto_advance);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_base_ms, 1000);
    }

    #[test]
    fn test_stage_deadline_sums_budgets() {
        let policy = StagePolicy::default()
            .with_activity_timeout_ms(10_000);
        let deadline = policy.stage_deadline(4);
        assert_eq!(deadline, Duration::from_millis(45_000));
    }

    #[test]
    fn test_policy_lookup() {
        let config = PipelineConfig::default().with_stage_policy(
            Stage::Extract,
            StagePolicy::default().with_max_attempts(5),
        );
        assert_eq!(config.policy(Stage::Extract).max_attempts, 5);
        assert_eq!(config.policy(Stage::Prospect).max_attempts, 3);
    }

    #[test]
    fn test_auto_advance_all() {
        let config = PipelineConfig::default().with_auto_advance_all(true);
        for stage in STAGE_SEQUENCE {
            assert!(config.policy(stage).auto_advance);
        }
    }

    #[test]
    fn test_default_formats() {
        let config = PipelineConfig::default();
        assert_eq!(config.default_formats, vec!["digest".to_string()]);
    }

    #[test]
    fn test_env_bool_parsing() {
        assert_eq!(env_bool("ATLAS_TEST_UNSET_VAR"), None);
        env::set_var("ATLAS_TEST_BOOL_VAR", "true");
        assert_eq!(env_bool("ATLAS_TEST_BOOL_VAR"), Some(true));
        env::set_var("ATLAS_TEST_BOOL_VAR", "0");
        assert_eq!(env_bool("ATLAS_TEST_BOOL_VAR"), Some(false));
        env::remove_var("ATLAS_TEST_BOOL_VAR");
    }
}
