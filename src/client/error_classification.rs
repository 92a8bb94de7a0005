//! Error classification logic

use crate::transport::RawResponse;
use crate::Error;

/// How a non-success HTTP response should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseClass {
    /// Rate-limited or out of quota for this credential: rotate.
    QuotaExhausted,
    /// Key rejected: rotate if a backup exists.
    Unauthorized,
    /// Server-side trouble; the same request may succeed later.
    Transient,
    /// The request itself was rejected.
    Rejected,
}

/// Some providers report quota exhaustion as a 400/403 with a recognisable body.
fn body_signals_quota(body: &str) -> bool {
    let b = body.to_ascii_lowercase();
    b.contains("resource_exhausted")
        || b.contains("insufficient_quota")
        || b.contains("quota exceeded")
        || b.contains("rate limit")
}

pub(crate) fn classify_status(status: u16, body: &str) -> ResponseClass {
    match status {
        429 | 402 => ResponseClass::QuotaExhausted,
        400 | 403 if body_signals_quota(body) => ResponseClass::QuotaExhausted,
        401 | 403 => ResponseClass::Unauthorized,
        408 | 425 => ResponseClass::Transient,
        500..=599 => ResponseClass::Transient,
        _ => ResponseClass::Rejected,
    }
}

fn truncate(body: &str, max: usize) -> String {
    body.chars().take(max).collect()
}

/// Convert a non-success response into the error taxonomy.
pub(crate) fn error_from_response(service: &str, credential: &str, resp: &RawResponse) -> Error {
    let message = truncate(resp.body.trim(), 300);
    match classify_status(resp.status, &resp.body) {
        ResponseClass::QuotaExhausted => Error::QuotaExhausted {
            service: service.to_string(),
            credential: credential.to_string(),
            retry_after_ms: resp.retry_after_ms,
        },
        ResponseClass::Transient => Error::TransientDependency {
            service: service.to_string(),
            message: format!("HTTP {}: {}", resp.status, message),
            status: Some(resp.status),
        },
        ResponseClass::Unauthorized | ResponseClass::Rejected => Error::HardFailure {
            service: service.to_string(),
            status: resp.status,
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status,
            body: body.to_string(),
            retry_after_ms: None,
            upstream_request_id: None,
        }
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(classify_status(429, ""), ResponseClass::QuotaExhausted);
        assert_eq!(classify_status(401, ""), ResponseClass::Unauthorized);
        assert_eq!(classify_status(403, "forbidden"), ResponseClass::Unauthorized);
        assert_eq!(classify_status(503, ""), ResponseClass::Transient);
        assert_eq!(classify_status(408, ""), ResponseClass::Transient);
        assert_eq!(classify_status(422, ""), ResponseClass::Rejected);
    }

    #[test]
    fn test_quota_in_body() {
        let body = r#"{"error":{"status":"RESOURCE_EXHAUSTED","message":"Quota exceeded"}}"#;
        assert_eq!(classify_status(400, body), ResponseClass::QuotaExhausted);
        assert_eq!(classify_status(400, "bad field"), ResponseClass::Rejected);
    }

    #[test]
    fn test_error_mapping() {
        let e = error_from_response("ocr", "OCR_API_KEY", &raw(429, "slow down"));
        assert!(matches!(
            e,
            Error::QuotaExhausted { ref credential, .. } if credential == "OCR_API_KEY"
        ));

        let e = error_from_response("ocr", "OCR_API_KEY", &raw(502, "bad gateway"));
        assert!(e.is_retryable());
        assert!(e.trips_breaker());

        let e = error_from_response("ocr", "OCR_API_KEY", &raw(401, "invalid key"));
        assert!(e.is_credential_scoped());
    }
}
