//! 编排器配置：依赖服务、重试、队列、健康检查与回退链参数。
//!
//! Orchestrator configuration.
//!
//! Everything is deserialised from YAML with serde defaults for every field, so a minimal file
//! only names the services it talks to:
//!
//! ```yaml
//! services:
//!   ocr:
//!     base_url: https://ocr.example.com
//!     credentials: [OCR_API_KEY, OCR_API_KEY_BACKUP]
//!   structurer:
//!     base_url: https://ai.example.com
//!     requests_per_minute: 30
//!     credentials: [AI_API_KEY]
//! fallback:
//!   primary: [ocr, structurer]
//!   secondary: structurer
//! ```
//!
//! A handful of knobs can be overridden from the environment
//! (see [`OrchestratorConfig::apply_env`]).

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub services: BTreeMap<String, ServiceConfig>,
    pub retry: RetryConfig,
    pub jobs: JobQueueConfig,
    pub health: HealthConfig,
    pub fallback: FallbackConfig,
    pub batch: BatchConfig,
}

/// One external extraction dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub extract_path: String,
    pub probe_path: String,
    pub requests_per_minute: u32,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub timeout_ms: u64,
    pub rotation_delay_ms: u64,
    /// Environment variable names holding the credentials, in priority order.
    pub credentials: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            extract_path: "/v1/extract".to_string(),
            probe_path: "/v1/extract".to_string(),
            requests_per_minute: 60,
            failure_threshold: 5,
            cooldown_ms: 60_000,
            timeout_ms: 30_000,
            rotation_delay_ms: 1_000,
            credentials: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rotation_delay(&self) -> Duration {
        Duration::from_millis(self.rotation_delay_ms)
    }
}

/// Backoff settings for a single retried operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay used as symmetric random jitter (0.0 disables).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

/// Job queue and processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub lease_ms: u64,
    pub job_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Reschedules allowed for circuit-open skips before the retry budget is charged.
    pub max_deferrals: u32,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            jitter: 0.1,
            lease_ms: 600_000,
            job_timeout_ms: 300_000,
            poll_interval_ms: 1_000,
            max_deferrals: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub ttl_ms: u64,
    pub degraded_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            degraded_latency_ms: 5_000,
        }
    }
}

/// Confidence multipliers applied per tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceDecay {
    pub primary: f64,
    pub fallback_1: f64,
    pub fallback_2: f64,
}

impl Default for ConfidenceDecay {
    fn default() -> Self {
        Self {
            primary: 1.0,
            fallback_1: 0.8,
            fallback_2: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub enabled: bool,
    pub min_confidence: f64,
    pub max_samples: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.8,
            max_samples: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Services used by the hybrid tier: OCR first, structuring second.
    pub primary: Vec<String>,
    /// Service used by the single-service tier.
    pub secondary: Option<String>,
    pub template: TemplateConfig,
    pub decay: ConfidenceDecay,
    /// Attempt tiers whose dependencies are degraded (not only healthy).
    pub allow_degraded: bool,
    /// Extraction instructions; `{document_type}` is substituted per document.
    pub instructions: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            primary: Vec::new(),
            secondary: None,
            template: TemplateConfig::default(),
            decay: ConfidenceDecay::default(),
            allow_degraded: false,
            instructions: "Extract every field of this {document_type} as a flat JSON object."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            inter_batch_delay_ms: 1_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl OrchestratorConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: OrchestratorConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config: OrchestratorConfig = serde_yaml::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `INTAKE_JOB_MAX_RETRIES` | `jobs.max_retries` |
    /// | `INTAKE_JOB_TIMEOUT_MS` | `jobs.job_timeout_ms` |
    /// | `INTAKE_POLL_INTERVAL_MS` | `jobs.poll_interval_ms` |
    /// | `INTAKE_HEALTH_TTL_MS` | `health.ttl_ms` |
    /// | `INTAKE_HTTP_TIMEOUT_MS` | `services.*.timeout_ms` |
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("INTAKE_JOB_MAX_RETRIES") {
            self.jobs.max_retries = v;
        }
        if let Some(v) = env_parse("INTAKE_JOB_TIMEOUT_MS") {
            self.jobs.job_timeout_ms = v;
        }
        if let Some(v) = env_parse("INTAKE_POLL_INTERVAL_MS") {
            self.jobs.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("INTAKE_HEALTH_TTL_MS") {
            self.health.ttl_ms = v;
        }
        if let Some(v) = env_parse::<u64>("INTAKE_HTTP_TIMEOUT_MS") {
            for service in self.services.values_mut() {
                service.timeout_ms = v;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, service) in &self.services {
            let field = |f: &str| format!("services.{}.{}", name, f);
            url::Url::parse(&service.base_url).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid base_url: {}", e),
                    ErrorContext::new()
                        .with_field_path(field("base_url"))
                        .with_details(service.base_url.clone())
                        .with_source("config"),
                )
            })?;
            if service.requests_per_minute == 0 {
                return Err(invalid(field("requests_per_minute"), "must be positive"));
            }
            if service.failure_threshold == 0 {
                return Err(invalid(field("failure_threshold"), "must be positive"));
            }
            if service.timeout_ms == 0 {
                return Err(invalid(field("timeout_ms"), "must be positive"));
            }
        }

        for name in self
            .fallback
            .primary
            .iter()
            .chain(self.fallback.secondary.iter())
        {
            if !self.services.contains_key(name) {
                return Err(Error::configuration_with_context(
                    format!("fallback references unknown service '{}'", name),
                    ErrorContext::new()
                        .with_field_path("fallback")
                        .with_source("config"),
                ));
            }
        }
        if !self.fallback.primary.is_empty() && self.fallback.primary.len() != 2 {
            return Err(invalid(
                "fallback.primary".to_string(),
                "hybrid tier needs exactly two services (ocr, structuring)",
            ));
        }

        let decay = &self.fallback.decay;
        let ordered = (0.0..=1.0).contains(&decay.fallback_2)
            && decay.fallback_2 <= decay.fallback_1
            && decay.fallback_1 <= decay.primary
            && decay.primary <= 1.0;
        if !ordered {
            return Err(invalid(
                "fallback.decay".to_string(),
                "multipliers must satisfy 0 <= fallback_2 <= fallback_1 <= primary <= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) || !(0.0..=1.0).contains(&self.jobs.jitter) {
            return Err(invalid("jitter".to_string(), "must be within [0, 1]"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts".to_string(), "must be positive"));
        }
        if self.batch.batch_size == 0 {
            return Err(invalid("batch.batch_size".to_string(), "must be positive"));
        }
        // A lease shorter than the job timeout expires under a live worker.
        if self.jobs.lease_ms <= self.jobs.job_timeout_ms {
            return Err(invalid(
                "jobs.lease_ms".to_string(),
                "must exceed jobs.job_timeout_ms",
            ));
        }
        Ok(())
    }
}

fn invalid(field: String, message: &str) -> Error {
    Error::configuration_with_context(
        message,
        ErrorContext::new().with_field_path(field).with_source("config"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
services:
  ocr:
    base_url: https://ocr.example.com
    requests_per_minute: 20
    credentials: [OCR_API_KEY, OCR_API_KEY_BACKUP]
  structurer:
    base_url: https://ai.example.com
    credentials: [AI_API_KEY]
fallback:
  primary: [ocr, structurer]
  secondary: structurer
jobs:
  max_retries: 5
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = OrchestratorConfig::from_yaml_str(SAMPLE).unwrap();
        let ocr = &config.services["ocr"];
        assert_eq!(ocr.requests_per_minute, 20);
        assert_eq!(ocr.failure_threshold, 5);
        assert_eq!(ocr.credentials, vec!["OCR_API_KEY", "OCR_API_KEY_BACKUP"]);
        assert_eq!(config.jobs.max_retries, 5);
        assert_eq!(config.health.ttl_ms, 300_000);
        assert_eq!(config.fallback.decay, ConfidenceDecay::default());
        assert_eq!(config.fallback.template.min_confidence, 0.8);
    }

    #[test]
    fn test_unknown_fallback_service_is_rejected() {
        let raw = r#"
services:
  ocr:
    base_url: https://ocr.example.com
fallback:
  secondary: vision
"#;
        let err = OrchestratorConfig::from_yaml_str(raw).unwrap_err();
        assert!(err.to_string().contains("unknown service 'vision'"));
    }

    #[test]
    fn test_invalid_base_url_reports_field() {
        let raw = r#"
services:
  ocr:
    base_url: not a url
"#;
        let err = OrchestratorConfig::from_yaml_str(raw).unwrap_err();
        let ctx = err.context().unwrap();
        assert_eq!(ctx.field_path.as_deref(), Some("services.ocr.base_url"));
    }

    #[test]
    fn test_decay_must_be_non_increasing() {
        let raw = r#"
fallback:
  decay:
    primary: 1.0
    fallback_1: 0.5
    fallback_2: 0.7
"#;
        assert!(OrchestratorConfig::from_yaml_str(raw).is_err());
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        let raw = r#"
services:
  ocr:
    base_url: https://ocr.example.com
    requests_per_minute: 0
"#;
        assert!(OrchestratorConfig::from_yaml_str(raw).is_err());
    }

    #[test]
    fn test_lease_must_outlive_job_timeout() {
        let raw = r#"
jobs:
  lease_ms: 1000
  job_timeout_ms: 300000
"#;
        let err = OrchestratorConfig::from_yaml_str(raw).unwrap_err();
        let ctx = err.context().unwrap();
        assert_eq!(ctx.field_path.as_deref(), Some("jobs.lease_ms"));

        let equal = r#"
jobs:
  lease_ms: 300000
  job_timeout_ms: 300000
"#;
        assert!(OrchestratorConfig::from_yaml_str(equal).is_err());
    }
}
