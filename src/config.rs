//! Engine configuration.
//!
//! All tunables are plain serializable numbers so a configuration can be
//! loaded from JSON and validated before a run starts. Note that `epsilon`
//! is expressed in the units of the sampled measurement and should be
//! adjusted per measurement rather than treated as universal.

use serde::de::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for sampling, refinement and resume behavior.
///
/// # Example
///
/// ```rust
/// use vargrid::Config;
///
/// let config = Config::default()
///     .with_epsilon(0.5)
///     .with_max_batch(100);
/// assert!(config.validate().is_ok());
///
/// // Load from JSON; missing fields fall back to defaults.
/// let config: Config = Config::from_json(r#"{"epsilon": 2.0}"#).unwrap();
/// assert_eq!(config.epsilon, 2.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Convergence threshold: a region becomes a leaf once the summed
    /// pairwise absolute differences against its parent and grandparent
    /// values fall below this, in measurement units.
    #[serde(default = "Config::default_epsilon")]
    pub epsilon: f64,

    /// Maximum distinct coordinates per remote provider request.
    #[serde(default = "Config::default_max_batch")]
    pub max_batch: usize,

    /// Pause between sampler batching cycles.
    #[serde(default = "Config::default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// Wall-clock bound on waiting for a single region's value.
    #[serde(default = "Config::default_sample_timeout_ms")]
    pub sample_timeout_ms: u64,

    /// How long one scheduler cycle keeps popping queued work before
    /// switching to collecting completions.
    #[serde(default = "Config::default_drain_window_ms")]
    pub drain_window_ms: u64,

    /// How long one scheduler cycle waits for task completions. Partial
    /// completion is expected; whatever finished in the window is applied.
    #[serde(default = "Config::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Persisted values this close to the requested observation time are
    /// reused on resume instead of being re-sampled.
    #[serde(default = "Config::default_freshness_window_secs")]
    pub freshness_window_secs: u64,

    /// Whether intermediate branch nodes are retained in the returned
    /// outcome. Persistence always receives them regardless, so ancestry
    /// edges can resolve.
    #[serde(default = "Config::default_keep_branches")]
    pub keep_branches: bool,
}

impl Config {
    const fn default_epsilon() -> f64 {
        1.0
    }

    const fn default_max_batch() -> usize {
        200
    }

    const fn default_batch_interval_ms() -> u64 {
        1_000
    }

    // 40 minutes: a deep frontier behind a rate-limited provider drains slowly.
    const fn default_sample_timeout_ms() -> u64 {
        2_400_000
    }

    const fn default_drain_window_ms() -> u64 {
        5_000
    }

    const fn default_poll_timeout_ms() -> u64 {
        1_000
    }

    // One day minus a minute, so a daily re-run lands inside the window.
    const fn default_freshness_window_secs() -> u64 {
        86_340
    }

    const fn default_keep_branches() -> bool {
        true
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_batch_interval_ms(mut self, ms: u64) -> Self {
        self.batch_interval_ms = ms;
        self
    }

    pub fn with_sample_timeout_ms(mut self, ms: u64) -> Self {
        self.sample_timeout_ms = ms;
        self
    }

    pub fn with_drain_window_ms(mut self, ms: u64) -> Self {
        self.drain_window_ms = ms;
        self
    }

    pub fn with_poll_timeout_ms(mut self, ms: u64) -> Self {
        self.poll_timeout_ms = ms;
        self
    }

    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window_secs = window.as_secs();
        self
    }

    pub fn with_keep_branches(mut self, keep: bool) -> Self {
        self.keep_branches = keep;
        self
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err("epsilon must be finite and positive".to_string());
        }

        if self.max_batch == 0 {
            return Err("max_batch must be greater than zero".to_string());
        }

        if self.sample_timeout_ms == 0 {
            return Err("sample_timeout_ms must be greater than zero".to_string());
        }

        if self.poll_timeout_ms == 0 {
            return Err("poll_timeout_ms must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Config = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epsilon: Self::default_epsilon(),
            max_batch: Self::default_max_batch(),
            batch_interval_ms: Self::default_batch_interval_ms(),
            sample_timeout_ms: Self::default_sample_timeout_ms(),
            drain_window_ms: Self::default_drain_window_ms(),
            poll_timeout_ms: Self::default_poll_timeout_ms(),
            freshness_window_secs: Self::default_freshness_window_secs(),
            keep_branches: Self::default_keep_branches(),
        }
    }
}
