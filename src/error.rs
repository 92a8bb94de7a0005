use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "services.ocr.base_url")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config", "job_store", "circuit_breaker")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the extraction orchestrator.
///
/// The first group of variants is the dependency-failure taxonomy the fallback chain and the job
/// processor make decisions on; the rest are local failures (configuration, storage, I/O).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Transient failure from {service}: {message}")]
    TransientDependency {
        service: String,
        message: String,
        status: Option<u16>,
    },

    #[error("Quota exhausted for {service} (credential {credential})")]
    QuotaExhausted {
        service: String,
        credential: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Circuit open for {service} (retry in {retry_in_ms}ms)")]
    CircuitOpen { service: String, retry_in_ms: u64 },

    #[error("Malformed response from {service}: {reason}; payload starts with {snippet:?}")]
    MalformedResponse {
        service: String,
        reason: String,
        snippet: String,
    },

    #[error("All credentials exhausted for {service}: {}", .attempts.join("; "))]
    AllCredentialsExhausted {
        service: String,
        attempts: Vec<String>,
    },

    #[error("Retry budget exhausted for job {job_id} after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted {
        job_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Request rejected by {service}: HTTP {status}: {message}")]
    HardFailure {
        service: String,
        status: u16,
        message: String,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Storage error: {message}{}", format_context(.context))]
    Store {
        message: String,
        context: ErrorContext,
    },

    #[error("Network transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Error::TransientDependency {
            service: service.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn store_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Store {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Store { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Failures worth repeating the same operation for after a delay.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransientDependency { .. } | Error::QuotaExhausted { .. } => true,
            Error::Transport(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Failures that count towards opening a dependency's circuit.
    ///
    /// Quota and request rejections are scoped to one credential or one request, not to the
    /// health of the dependency itself.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Error::TransientDependency { .. }
                | Error::MalformedResponse { .. }
                | Error::Transport(_)
        )
    }

    /// Circuit-open skips are deliberate and are not charged to a job's retry budget.
    pub fn counts_against_retry_budget(&self) -> bool {
        !matches!(self, Error::CircuitOpen { .. })
    }

    /// Failures that another credential for the same dependency may not hit.
    pub fn is_credential_scoped(&self) -> bool {
        match self {
            Error::QuotaExhausted { .. } => true,
            Error::HardFailure { status, .. } => matches!(status, 401 | 403),
            _ => false,
        }
    }

    /// Name of the dependency that produced the failure, if it came from one.
    pub fn service(&self) -> Option<&str> {
        match self {
            Error::TransientDependency { service, .. }
            | Error::QuotaExhausted { service, .. }
            | Error::CircuitOpen { service, .. }
            | Error::MalformedResponse { service, .. }
            | Error::AllCredentialsExhausted { service, .. }
            | Error::HardFailure { service, .. } => Some(service),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_rendered_in_display() {
        let err = Error::configuration_with_context(
            "requests_per_minute must be positive",
            ErrorContext::new()
                .with_field_path("services.ocr.requests_per_minute")
                .with_source("config"),
        );
        let text = err.to_string();
        assert!(text.contains("services.ocr.requests_per_minute"));
        assert!(text.contains("source: config"));
        assert!(err.context().is_some());
    }

    #[test]
    fn test_classification_helpers() {
        let transient = Error::transient("ocr", "502 bad gateway");
        assert!(transient.is_retryable());
        assert!(transient.trips_breaker());
        assert!(transient.counts_against_retry_budget());

        let open = Error::CircuitOpen {
            service: "ocr".into(),
            retry_in_ms: 1_000,
        };
        assert!(!open.is_retryable());
        assert!(!open.trips_breaker());
        assert!(!open.counts_against_retry_budget());

        let quota = Error::QuotaExhausted {
            service: "ocr".into(),
            credential: "primary".into(),
            retry_after_ms: None,
        };
        assert!(quota.is_credential_scoped());
        assert!(!quota.trips_breaker());

        let rejected = Error::HardFailure {
            service: "ocr".into(),
            status: 400,
            message: "bad".into(),
        };
        assert!(!rejected.is_credential_scoped());
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.service(), Some("ocr"));
    }

    #[test]
    fn test_all_credentials_exhausted_lists_attempts() {
        let err = Error::AllCredentialsExhausted {
            service: "ai".into(),
            attempts: vec!["primary: quota".into(), "backup: quota".into()],
        };
        assert_eq!(
            err.to_string(),
            "All credentials exhausted for ai: primary: quota; backup: quota"
        );
    }
}
