//! Generation run configuration.
//!
//! Settings can be built in code, read from `FORGE_*` environment variables,
//! and are overridden by command-line flags in the binary.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::generator::resolver::{DEFAULT_ENUMERATION_THRESHOLD, DEFAULT_MAX_DRAWS};
use crate::pattern::{MAX_COMPLEXITY, MIN_COMPLEXITY};
use crate::sandbox::{SandboxBackend, SandboxConfig, DEFAULT_TIMEOUT};
use crate::validation::{DeepAnalysisPolicy, PipelineConfig};

/// Ceiling on accepted samples per pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QuotaCeiling {
    Unlimited,
    /// Fraction of the target in `(0, 1]`.
    Fraction(f64),
    Absolute(usize),
}

impl QuotaCeiling {
    /// Per-pattern limit for the given target.
    ///
    /// Fractions are floored but never below one, so every pattern can
    /// contribute at least one sample.
    pub fn limit_for(&self, target: usize) -> usize {
        match *self {
            QuotaCeiling::Unlimited => target,
            QuotaCeiling::Fraction(f) => ((f * target as f64).floor() as usize).max(1),
            QuotaCeiling::Absolute(n) => n,
        }
    }
}

impl Default for QuotaCeiling {
    fn default() -> Self {
        QuotaCeiling::Unlimited
    }
}

impl fmt::Display for QuotaCeiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaCeiling::Unlimited => write!(f, "unlimited"),
            QuotaCeiling::Fraction(v) => write!(f, "{}%", v * 100.0),
            QuotaCeiling::Absolute(n) => write!(f, "{}", n),
        }
    }
}

/// Parses a quota: `0.5` or `50%` is a fraction of the target, `10` an
/// absolute count, `none` or `unlimited` disables the ceiling.
pub fn parse_quota(value: &str) -> Result<QuotaCeiling, ConfigError> {
    let value = value.trim();
    let invalid = |message: &str| ConfigError::InvalidValue {
        key: "quota".to_string(),
        message: format!("{} (got '{}')", message, value),
    };

    match value.to_lowercase().as_str() {
        "none" | "unlimited" => return Ok(QuotaCeiling::Unlimited),
        _ => {}
    }

    if let Some(percent) = value.strip_suffix('%') {
        let p: f64 = percent
            .trim()
            .parse()
            .map_err(|_| invalid("expected a percentage"))?;
        if p <= 0.0 || p > 100.0 {
            return Err(invalid("percentage must be in (0, 100]"));
        }
        return Ok(QuotaCeiling::Fraction(p / 100.0));
    }

    if value.contains('.') {
        let f: f64 = value.parse().map_err(|_| invalid("expected a fraction"))?;
        if f <= 0.0 || f > 1.0 {
            return Err(invalid("fraction must be in (0, 1]"));
        }
        return Ok(QuotaCeiling::Fraction(f));
    }

    let n: usize = value.parse().map_err(|_| invalid("expected a count"))?;
    if n == 0 {
        return Err(invalid("count must be greater than 0"));
    }
    Ok(QuotaCeiling::Absolute(n))
}

/// Configuration for one generation run.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    // Targets
    /// Number of accepted samples to produce.
    pub target: usize,
    /// Per-pattern ceiling on accepted samples.
    pub quota: QuotaCeiling,

    // Validation
    /// Run the deep-analysis stage.
    pub deep_analysis: bool,
    pub deep_analysis_policy: DeepAnalysisPolicy,
    /// Wall-clock limit for one sandboxed execution.
    pub execution_timeout: Duration,
    pub sandbox: SandboxConfig,

    // Resolution
    /// Failed random draws before a pattern counts as exhausted.
    pub max_draws: u32,
    /// Largest binding space enumerated instead of sampled.
    pub enumeration_threshold: u64,
    /// Validated candidates per pattern before it counts as exhausted.
    pub max_attempts_per_pattern: Option<usize>,

    // Execution
    /// Candidates validated concurrently.
    pub max_concurrent_validations: usize,
    /// Seed for binding draws; a fixed seed makes the run reproducible.
    pub seed: u64,

    // Pattern selection
    /// Inclusive complexity range of patterns to use.
    pub complexity_range: (u8, u8),
    /// Categories to use; all when empty.
    pub categories: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            target: 100,
            quota: QuotaCeiling::Unlimited,
            deep_analysis: false,
            deep_analysis_policy: DeepAnalysisPolicy::Reject,
            execution_timeout: DEFAULT_TIMEOUT,
            sandbox: SandboxConfig::default(),
            max_draws: DEFAULT_MAX_DRAWS,
            enumeration_threshold: DEFAULT_ENUMERATION_THRESHOLD,
            max_attempts_per_pattern: None,
            max_concurrent_validations: 4,
            seed: 42,
            complexity_range: (MIN_COMPLEXITY, MAX_COMPLEXITY),
            categories: Vec::new(),
        }
    }
}

impl GenerationConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from `FORGE_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Loads configuration through a variable lookup function.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("FORGE_TARGET") {
            config.target = parse_env_value(&val, "FORGE_TARGET")?;
        }
        if let Some(val) = lookup("FORGE_QUOTA") {
            config.quota = parse_quota(&val)?;
        }
        if let Some(val) = lookup("FORGE_DEEP_ANALYSIS") {
            config.deep_analysis = parse_env_bool(&val, "FORGE_DEEP_ANALYSIS")?;
        }
        if let Some(val) = lookup("FORGE_DEEP_ANALYSIS_POLICY") {
            config.deep_analysis_policy = match val.to_lowercase().as_str() {
                "reject" => DeepAnalysisPolicy::Reject,
                "advisory" => DeepAnalysisPolicy::Advisory,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "FORGE_DEEP_ANALYSIS_POLICY".to_string(),
                        message: format!("expected 'reject' or 'advisory', got '{}'", val),
                    })
                }
            };
        }
        if let Some(val) = lookup("FORGE_EXECUTION_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FORGE_EXECUTION_TIMEOUT_SECS")?;
            config.execution_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("FORGE_INTERPRETER") {
            config.sandbox.interpreter = val;
        }
        if let Some(val) = lookup("FORGE_DOCKER_IMAGE") {
            config.sandbox = config.sandbox.with_docker(val);
        }
        if let Some(val) = lookup("FORGE_UNCONFINED") {
            if parse_env_bool(&val, "FORGE_UNCONFINED")? {
                if matches!(config.sandbox.backend, SandboxBackend::Docker { .. }) {
                    return Err(ConfigError::InvalidValue {
                        key: "FORGE_UNCONFINED".to_string(),
                        message: "cannot be combined with FORGE_DOCKER_IMAGE".to_string(),
                    });
                }
                config.sandbox = config.sandbox.unconfined();
            }
        }
        if let Some(val) = lookup("FORGE_DOCKER_MEMORY_MB") {
            config.sandbox.memory_limit_mb = parse_env_value(&val, "FORGE_DOCKER_MEMORY_MB")?;
        }
        if let Some(val) = lookup("FORGE_MAX_DRAWS") {
            config.max_draws = parse_env_value(&val, "FORGE_MAX_DRAWS")?;
        }
        if let Some(val) = lookup("FORGE_ENUMERATION_THRESHOLD") {
            config.enumeration_threshold = parse_env_value(&val, "FORGE_ENUMERATION_THRESHOLD")?;
        }
        if let Some(val) = lookup("FORGE_MAX_ATTEMPTS_PER_PATTERN") {
            config.max_attempts_per_pattern =
                Some(parse_env_value(&val, "FORGE_MAX_ATTEMPTS_PER_PATTERN")?);
        }
        if let Some(val) = lookup("FORGE_MAX_CONCURRENT_VALIDATIONS") {
            config.max_concurrent_validations =
                parse_env_value(&val, "FORGE_MAX_CONCURRENT_VALIDATIONS")?;
        }
        if let Some(val) = lookup("FORGE_SEED") {
            config.seed = parse_env_value(&val, "FORGE_SEED")?;
        }
        if let Some(val) = lookup("FORGE_CATEGORIES") {
            config.categories = val
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target == 0 {
            return Err(ConfigError::ValidationFailed(
                "target must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_validations == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_validations must be greater than 0".to_string(),
            ));
        }
        if self.max_draws == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_draws must be greater than 0".to_string(),
            ));
        }
        if self.execution_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "execution_timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_attempts_per_pattern == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_attempts_per_pattern must be greater than 0".to_string(),
            ));
        }
        match self.quota {
            QuotaCeiling::Fraction(f) if !(f > 0.0 && f <= 1.0) => {
                return Err(ConfigError::ValidationFailed(format!(
                    "quota fraction must be in (0, 1], got {}",
                    f
                )));
            }
            QuotaCeiling::Absolute(0) => {
                return Err(ConfigError::ValidationFailed(
                    "quota count must be greater than 0".to_string(),
                ));
            }
            _ => {}
        }
        let (lo, hi) = self.complexity_range;
        if lo > hi || lo < MIN_COMPLEXITY || hi > MAX_COMPLEXITY {
            return Err(ConfigError::ValidationFailed(format!(
                "complexity_range must lie within {}..={} and be ordered, got {}..={}",
                MIN_COMPLEXITY, MAX_COMPLEXITY, lo, hi
            )));
        }
        if self.sandbox.interpreter.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "interpreter cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-pattern accepted-sample limit.
    pub fn quota_limit(&self) -> usize {
        self.quota.limit_for(self.target)
    }

    /// Settings for the standard validation pipeline.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            sandbox: self.sandbox.clone().with_timeout(self.execution_timeout),
            deep_analysis: self.deep_analysis,
            policy: self.deep_analysis_policy,
            ..PipelineConfig::default()
        }
    }

    // Builder methods

    pub fn with_target(mut self, target: usize) -> Self {
        self.target = target;
        self
    }

    pub fn with_quota(mut self, quota: QuotaCeiling) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_deep_analysis(mut self, enabled: bool) -> Self {
        self.deep_analysis = enabled;
        self
    }

    pub fn with_deep_analysis_policy(mut self, policy: DeepAnalysisPolicy) -> Self {
        self.deep_analysis_policy = policy;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_max_draws(mut self, max_draws: u32) -> Self {
        self.max_draws = max_draws;
        self
    }

    pub fn with_enumeration_threshold(mut self, threshold: u64) -> Self {
        self.enumeration_threshold = threshold;
        self
    }

    pub fn with_max_attempts_per_pattern(mut self, attempts: usize) -> Self {
        self.max_attempts_per_pattern = Some(attempts);
        self
    }

    pub fn with_max_concurrent_validations(mut self, n: usize) -> Self {
        self.max_concurrent_validations = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_complexity_range(mut self, min: u8, max: u8) -> Self {
        self.complexity_range = (min, max);
        self
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = GenerationConfig::default();
        assert_eq!(config.target, 100);
        assert_eq!(config.quota, QuotaCeiling::Unlimited);
        assert!(!config.deep_analysis);
        assert_eq!(config.deep_analysis_policy, DeepAnalysisPolicy::Reject);
        assert_eq!(config.max_draws, 256);
        assert_eq!(config.enumeration_threshold, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_quota() {
        assert_eq!(parse_quota("0.5").expect("parse"), QuotaCeiling::Fraction(0.5));
        assert_eq!(parse_quota("25%").expect("parse"), QuotaCeiling::Fraction(0.25));
        assert_eq!(parse_quota("10").expect("parse"), QuotaCeiling::Absolute(10));
        assert_eq!(parse_quota("none").expect("parse"), QuotaCeiling::Unlimited);
        assert!(parse_quota("0").is_err());
        assert!(parse_quota("1.5").is_err());
        assert!(parse_quota("150%").is_err());
        assert!(parse_quota("lots").is_err());
    }

    #[test]
    fn test_quota_limit_floor_and_minimum() {
        assert_eq!(QuotaCeiling::Fraction(0.5).limit_for(20), 10);
        assert_eq!(QuotaCeiling::Fraction(0.3).limit_for(10), 3);
        assert_eq!(QuotaCeiling::Fraction(0.01).limit_for(10), 1);
        assert_eq!(QuotaCeiling::Absolute(7).limit_for(100), 7);
        assert_eq!(QuotaCeiling::Unlimited.limit_for(100), 100);
    }

    #[test]
    fn test_from_vars() {
        let config = GenerationConfig::from_vars(vars(&[
            ("FORGE_TARGET", "20"),
            ("FORGE_QUOTA", "50%"),
            ("FORGE_DEEP_ANALYSIS", "yes"),
            ("FORGE_DEEP_ANALYSIS_POLICY", "advisory"),
            ("FORGE_EXECUTION_TIMEOUT_SECS", "3"),
            ("FORGE_DOCKER_IMAGE", "python:3.12-slim"),
            ("FORGE_SEED", "7"),
            ("FORGE_CATEGORIES", "geometry, strings,"),
        ]))
        .expect("failed to load");

        assert_eq!(config.target, 20);
        assert_eq!(config.quota_limit(), 10);
        assert!(config.deep_analysis);
        assert_eq!(config.deep_analysis_policy, DeepAnalysisPolicy::Advisory);
        assert_eq!(config.execution_timeout, Duration::from_secs(3));
        assert!(matches!(config.sandbox.backend, SandboxBackend::Docker { .. }));
        assert_eq!(config.seed, 7);
        assert_eq!(config.categories, vec!["geometry", "strings"]);
    }

    #[test]
    fn test_from_vars_invalid() {
        assert!(matches!(
            GenerationConfig::from_vars(vars(&[("FORGE_TARGET", "many")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(GenerationConfig::from_vars(vars(&[("FORGE_DEEP_ANALYSIS", "maybe")])).is_err());
        assert!(
            GenerationConfig::from_vars(vars(&[("FORGE_DEEP_ANALYSIS_POLICY", "ignore")]))
                .is_err()
        );
        assert!(GenerationConfig::from_vars(vars(&[
            ("FORGE_DOCKER_IMAGE", "python:3.12-slim"),
            ("FORGE_UNCONFINED", "true"),
        ]))
        .is_err());
    }

    #[test]
    fn test_sandbox_is_confined_unless_opted_out() {
        let config = GenerationConfig::from_vars(vars(&[])).expect("failed to load");
        assert_eq!(config.sandbox.backend, SandboxBackend::Isolated);

        let config = GenerationConfig::from_vars(vars(&[("FORGE_UNCONFINED", "1")]))
            .expect("failed to load");
        assert_eq!(config.sandbox.backend, SandboxBackend::Unconfined);

        let config = GenerationConfig::from_vars(vars(&[("FORGE_UNCONFINED", "false")]))
            .expect("failed to load");
        assert_eq!(config.sandbox.backend, SandboxBackend::Isolated);
    }

    #[test]
    fn test_validation_failures() {
        assert!(GenerationConfig::new().with_target(0).validate().is_err());
        assert!(GenerationConfig::new()
            .with_max_concurrent_validations(0)
            .validate()
            .is_err());
        assert!(GenerationConfig::new()
            .with_complexity_range(4, 2)
            .validate()
            .is_err());
        assert!(GenerationConfig::new()
            .with_quota(QuotaCeiling::Fraction(0.0))
            .validate()
            .is_err());
        assert!(GenerationConfig::new()
            .with_execution_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_pipeline_config_carries_timeout_and_policy() {
        let config = GenerationConfig::new()
            .with_execution_timeout(Duration::from_secs(2))
            .with_deep_analysis(true)
            .with_deep_analysis_policy(DeepAnalysisPolicy::Advisory);
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.sandbox.timeout, Duration::from_secs(2));
        assert!(pipeline.deep_analysis);
        assert_eq!(pipeline.policy, DeepAnalysisPolicy::Advisory);
    }
}
