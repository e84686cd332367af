use serde::Deserialize;
use std::path::Path;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `CAMPAIGN_SENDER__`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub smart_delay: SmartDelayConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub warmup: WarmUpConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    /// Pause after a batch in which every message was deferred by warm-up.
    #[serde(default = "default_deferral_backoff_ms")]
    pub deferral_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub use_spintax: bool,
    #[serde(default = "default_true")]
    pub use_typing: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: usize,
    #[serde(default = "default_max_per_second")]
    pub max_per_second: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Humanized pacing. Delays and durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SmartDelayConfig {
    #[serde(default = "default_message_delay_min")]
    pub message_delay_min: f64,
    #[serde(default = "default_message_delay_max")]
    pub message_delay_max: f64,
    #[serde(default = "default_short_break_every")]
    pub short_break_every: Span,
    #[serde(default = "default_short_break_duration")]
    pub short_break_duration: Span,
    #[serde(default = "default_long_break_every")]
    pub long_break_every: Span,
    #[serde(default = "default_long_break_duration")]
    pub long_break_duration: Span,
    #[serde(default = "default_business_hours_start")]
    pub business_hours_start: u32,
    #[serde(default = "default_business_hours_end")]
    pub business_hours_end: u32,
    #[serde(default = "default_true")]
    pub respect_business_hours: bool,
    #[serde(default = "default_message_length_factor")]
    pub message_length_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_hosts")]
    pub hosts: Vec<String>,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retries after the first attempt, only for timeout-class failures.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarmUpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Daily limit once an identity is 15 days old.
    #[serde(default = "default_warm_daily_limit")]
    pub warm_daily_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Inclusive `[min, max]` range, written as a two-element list in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<u64>")]
pub struct Span {
    pub min: u64,
    pub max: u64,
}

impl Span {
    pub fn new(min: u64, max: u64) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }
}

impl TryFrom<Vec<u64>> for Span {
    type Error = String;

    fn try_from(values: Vec<u64>) -> Result<Self, Self::Error> {
        match values.as_slice() {
            [min, max] if min <= max => Ok(Self {
                min: *min,
                max: *max,
            }),
            [min, max] => Err(format!("range [{min}, {max}] has min greater than max")),
            other => Err(format!(
                "expected a [min, max] pair, got {} values",
                other.len()
            )),
        }
    }
}

// Default functions
fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_pause_ms() -> u64 {
    1000
}
fn default_deferral_backoff_ms() -> u64 {
    60_000
}
fn default_max_per_hour() -> usize {
    50
}
fn default_max_per_second() -> usize {
    1
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_message_delay_min() -> f64 {
    15.0
}
fn default_message_delay_max() -> f64 {
    45.0
}
fn default_short_break_every() -> Span {
    Span::new(8, 12)
}
fn default_short_break_duration() -> Span {
    Span::new(120, 300)
}
fn default_long_break_every() -> Span {
    Span::new(30, 50)
}
fn default_long_break_duration() -> Span {
    Span::new(600, 1200)
}
fn default_business_hours_start() -> u32 {
    8
}
fn default_business_hours_end() -> u32 {
    20
}
fn default_message_length_factor() -> f64 {
    0.05
}
fn default_bridge_hosts() -> Vec<String> {
    vec!["http://localhost:8003".to_string()]
}
fn default_api_prefix() -> String {
    "/api".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_max_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    30_000
}
fn default_identity() -> String {
    "default-session".to_string()
}
fn default_warm_daily_limit() -> u32 {
    40
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
            deferral_backoff_ms: default_deferral_backoff_ms(),
            use_spintax: true,
            use_typing: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_hour: default_max_per_hour(),
            max_per_second: default_max_per_second(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for SmartDelayConfig {
    fn default() -> Self {
        Self {
            message_delay_min: default_message_delay_min(),
            message_delay_max: default_message_delay_max(),
            short_break_every: default_short_break_every(),
            short_break_duration: default_short_break_duration(),
            long_break_every: default_long_break_every(),
            long_break_duration: default_long_break_duration(),
            business_hours_start: default_business_hours_start(),
            business_hours_end: default_business_hours_end(),
            respect_business_hours: true,
            message_length_factor: default_message_length_factor(),
        }
    }
}

impl SmartDelayConfig {
    /// No delays, no breaks, no business-hour gating.
    pub fn immediate() -> Self {
        Self {
            message_delay_min: 0.0,
            message_delay_max: 0.0,
            short_break_every: Span::new(u64::MAX, u64::MAX),
            short_break_duration: Span::new(0, 0),
            long_break_every: Span::new(u64::MAX, u64::MAX),
            long_break_duration: Span::new(0, 0),
            business_hours_start: 0,
            business_hours_end: 24,
            respect_business_hours: false,
            message_length_factor: 0.0,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            hosts: default_bridge_hosts(),
            api_prefix: default_api_prefix(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for WarmUpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            identity: default_identity(),
            warm_daily_limit: default_warm_daily_limit(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file, then environment
    /// variables, which take precedence.
    pub fn load_from(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CAMPAIGN_SENDER")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("bridge.hosts")
                .with_list_parse_key("smart_delay.short_break_every")
                .with_list_parse_key("smart_delay.short_break_duration")
                .with_list_parse_key("smart_delay.long_break_every")
                .with_list_parse_key("smart_delay.long_break_duration"),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let delay = &self.smart_delay;
        if delay.message_delay_min < 0.0 || delay.message_delay_min > delay.message_delay_max {
            return Err(config::ConfigError::Message(format!(
                "smart_delay.message_delay_min ({}) must be between 0 and message_delay_max ({})",
                delay.message_delay_min, delay.message_delay_max
            )));
        }
        if delay.business_hours_start > 23 || delay.business_hours_end > 24 {
            return Err(config::ConfigError::Message(
                "business hours must be within 0..=24".to_string(),
            ));
        }
        if delay.respect_business_hours && delay.business_hours_start == delay.business_hours_end {
            return Err(config::ConfigError::Message(format!(
                "smart_delay business hours window is empty (start == end == {})",
                delay.business_hours_start
            )));
        }
        if self.bridge.hosts.is_empty() {
            return Err(config::ConfigError::Message(
                "bridge.hosts must name at least one host".to_string(),
            ));
        }
        if self.rate_limit.max_per_hour == 0 || self.rate_limit.max_per_second == 0 {
            return Err(config::ConfigError::Message(
                "rate limits must be greater than zero".to_string(),
            ));
        }
        if self.dispatch.batch_size == 0 {
            return Err(config::ConfigError::Message(
                "dispatch.batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
