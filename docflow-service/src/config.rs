//! Service configuration.
//!
//! Loaded once at startup from a `config.*` file plus `DOCFLOW__`-prefixed
//! environment variables. Every section has serde defaults so an empty
//! source still produces a runnable configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default = "default_broker")]
    pub broker: BrokerConfig,

    #[serde(default = "default_workers")]
    pub workers: WorkersConfig,

    #[serde(default = "default_extraction")]
    pub extraction: ExtractionConfig,

    #[serde(default = "default_summarizer")]
    pub summarizer: SummarizerConfig,

    #[serde(default = "default_resilience")]
    pub resilience: ResilienceConfig,

    #[serde(default = "default_idempotency")]
    pub idempotency: IdempotencyConfig,

    #[serde(default = "default_limits")]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            broker: default_broker(),
            workers: default_workers(),
            extraction: default_extraction(),
            summarizer: default_summarizer(),
            resilience: default_resilience(),
            idempotency: default_idempotency(),
            limits: default_limits(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Optional intake directory. When set, files placed here are picked up
    /// and fed into the pipeline. Failed files are moved to a failed/
    /// subdirectory after import.
    #[serde(default)]
    pub intake_dir: Option<PathBuf>,
}

/// Message channel configuration, applied to every queue.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Bounded queue capacity; publishing blocks when full (backpressure).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Message time-to-live before dead-lettering.
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,

    /// Redeliveries allowed before a message is dead-lettered.
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

impl BrokerConfig {
    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }
}

/// Consumer pool sizes per stage
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_extraction_workers")]
    pub extraction: usize,

    #[serde(default = "default_summarization_workers")]
    pub summarization: usize,

    #[serde(default = "default_result_sink_workers")]
    pub result_sink: usize,
}

/// Extraction stage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// Longest edge of a rendered page in pixels.
    #[serde(default = "default_render_target_pixels")]
    pub render_target_pixels: u32,

    /// OCR language code (e.g., "eng", "deu").
    #[serde(default = "default_ocr_language")]
    pub ocr_language: String,

    /// Pages recognized concurrently per document.
    #[serde(default = "default_page_parallelism")]
    pub page_parallelism: usize,
}

/// Summarizer API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default = "default_summarizer_url")]
    pub base_url: String,

    #[serde(default = "default_summarizer_model")]
    pub model: String,

    /// Bearer token for the API. Absent means the summarizer is treated as
    /// unconfigured unless the endpoint needs no credentials.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Whether the endpoint requires credentials at all. Local endpoints
    /// (Ollama) don't; hosted ones do.
    #[serde(default)]
    pub require_api_key: bool,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Inputs shorter than this are rejected without calling the API.
    #[serde(default = "default_min_input_chars")]
    pub min_input_chars: usize,

    /// Inputs longer than this are truncated at a sentence boundary.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// What to publish when the resilience envelope gives up on the API.
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
}

/// Behavior when the summarizer dependency is unavailable after retries or
/// behind an open circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Publish a success-shaped result carrying a placeholder summary and a
    /// degraded marker.
    #[default]
    Degraded,
    /// Publish a failure result.
    Fail,
}

/// Resilience envelope configuration, shared by all wrapped dependencies.
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    /// Sliding window size the circuit breaker tracks.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Failure rate over the window that opens the circuit.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// How long an open circuit fails fast before going half-open.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Trial calls admitted while half-open.
    #[serde(default = "default_half_open_trials")]
    pub half_open_trials: u32,

    /// Attempt cap per logical call (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Sustained rate per dependency.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    #[serde(default = "default_burst_size")]
    pub burst_size: u64,

    /// How long a call may wait for a rate-limit token before failing.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl ResilienceConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Idempotency guard configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default = "default_idempotency_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Intake limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_document_size_bytes")]
    pub max_document_size_bytes: u64,
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

// ==================== Default Value Functions ====================

pub(crate) fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
        intake_dir: None,
    }
}

pub(crate) fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

pub(crate) fn default_broker() -> BrokerConfig {
    BrokerConfig {
        queue_capacity: default_queue_capacity(),
        message_ttl_secs: default_message_ttl_secs(),
        max_redeliveries: default_max_redeliveries(),
    }
}

fn default_queue_capacity() -> usize {
    64
}

fn default_message_ttl_secs() -> u64 {
    300
}

fn default_max_redeliveries() -> u32 {
    5
}

pub(crate) fn default_workers() -> WorkersConfig {
    WorkersConfig {
        extraction: default_extraction_workers(),
        summarization: default_summarization_workers(),
        result_sink: default_result_sink_workers(),
    }
}

fn default_extraction_workers() -> usize {
    2
}

fn default_summarization_workers() -> usize {
    2
}

fn default_result_sink_workers() -> usize {
    1
}

pub(crate) fn default_extraction() -> ExtractionConfig {
    ExtractionConfig {
        render_target_pixels: default_render_target_pixels(),
        ocr_language: default_ocr_language(),
        page_parallelism: default_page_parallelism(),
    }
}

fn default_render_target_pixels() -> u32 {
    2048
}

fn default_ocr_language() -> String {
    "eng".to_string()
}

fn default_page_parallelism() -> usize {
    4
}

pub(crate) fn default_summarizer() -> SummarizerConfig {
    SummarizerConfig {
        base_url: default_summarizer_url(),
        model: default_summarizer_model(),
        api_key: None,
        require_api_key: false,
        temperature: default_temperature(),
        max_output_tokens: default_max_output_tokens(),
        min_input_chars: default_min_input_chars(),
        max_input_chars: default_max_input_chars(),
        request_timeout_secs: default_request_timeout_secs(),
        fallback_policy: FallbackPolicy::default(),
    }
}

fn default_summarizer_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_summarizer_model() -> String {
    "llama3.1".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_output_tokens() -> u32 {
    512
}

fn default_min_input_chars() -> usize {
    50
}

fn default_max_input_chars() -> usize {
    50_000
}

fn default_request_timeout_secs() -> u64 {
    120
}

pub(crate) fn default_resilience() -> ResilienceConfig {
    ResilienceConfig {
        window_size: default_window_size(),
        failure_rate_threshold: default_failure_rate_threshold(),
        cooldown_secs: default_cooldown_secs(),
        half_open_trials: default_half_open_trials(),
        max_attempts: default_max_attempts(),
        base_delay_ms: default_base_delay_ms(),
        max_delay_ms: default_max_delay_ms(),
        requests_per_second: default_requests_per_second(),
        burst_size: default_burst_size(),
        acquire_timeout_ms: default_acquire_timeout_ms(),
    }
}

fn default_window_size() -> usize {
    10
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_half_open_trials() -> u32 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst_size() -> u64 {
    20
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

pub(crate) fn default_idempotency() -> IdempotencyConfig {
    IdempotencyConfig {
        ttl_secs: default_idempotency_ttl_secs(),
        sweep_interval_secs: default_sweep_interval_secs(),
    }
}

fn default_idempotency_ttl_secs() -> u64 {
    86_400
}

fn default_sweep_interval_secs() -> u64 {
    3_600
}

pub(crate) fn default_limits() -> LimitsConfig {
    LimitsConfig {
        max_document_size_bytes: default_max_document_size_bytes(),
    }
}

fn default_max_document_size_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_metrics_enabled() -> bool {
    true
}

/// Resilience defaults with near-zero backoff so retry tests stay fast.
#[cfg(test)]
pub(crate) fn default_resilience_for_tests() -> ResilienceConfig {
    ResilienceConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        ..default_resilience()
    }
}

fn default_metrics_port() -> u16 {
    9090
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sources_produce_defaults() {
        let config: StaticConfig = ::config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.broker.message_ttl_secs, 300);
        assert_eq!(config.summarizer.min_input_chars, 50);
        assert_eq!(config.summarizer.max_input_chars, 50_000);
        assert_eq!(config.resilience.window_size, 10);
        assert_eq!(config.idempotency.ttl_secs, 86_400);
        assert_eq!(config.summarizer.fallback_policy, FallbackPolicy::Degraded);
    }
}
