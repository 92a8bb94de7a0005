use crate::config::ServiceConfig;
use crate::Result;
use reqwest::header::HeaderMap;
use reqwest::Proxy;
use std::env;
use std::time::Duration;

/// Raw HTTP outcome, before any classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub retry_after_ms: Option<u64>,
    pub upstream_request_id: Option<String>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP transport for one external service.
///
/// Every request carries the service's deadline through the client-level timeout, so a stuck
/// dependency surfaces as a transient transport error instead of blocking the worker.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout().min(Duration::from_secs(10)))
            .pool_max_idle_per_host(
                env::var("INTAKE_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(16),
            )
            .pool_idle_timeout(Some(Duration::from_secs(90)));

        if let Ok(proxy_url) = env::var("INTAKE_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        let client = builder
            .build()
            .map_err(|e| crate::Error::Transport(TransportError::Other(e.to_string())))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
        client_request_id: &str,
    ) -> Result<RawResponse> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .post(&url)
            .json(body)
            .header("x-intake-request-id", client_request_id);
        if let Some(key) = bearer {
            req = req.bearer_auth(key);
        }
        Self::finish(req).await
    }

    async fn finish(req: reqwest::RequestBuilder) -> Result<RawResponse> {
        let resp = req.send().await.map_err(TransportError::from)?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.text().await.map_err(TransportError::from)?;
        Ok(RawResponse {
            status,
            body,
            retry_after_ms: retry_after_ms(&headers),
            upstream_request_id: header_first(
                &headers,
                &["x-request-id", "request-id", "x-amzn-requestid", "cf-ray"],
            ),
        })
    }
}

/// Extract the first matching header value from a list of header names.
fn header_first(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(v) = headers.get(*name) {
            if let Ok(s) = v.to_str() {
                let s = s.trim();
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let v = header_first(headers, &["retry-after", "x-ratelimit-reset-requests"])?;
    v.parse::<u64>().ok().map(|secs| secs.saturating_mul(1_000))
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Timeouts and connection failures; a retry may land on a healthy instance.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            TransportError::Other(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_retry_after_seconds_to_ms() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(retry_after_ms(&headers), Some(7_000));
    }

    #[test]
    fn test_header_first_skips_blank_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("  "));
        headers.insert("cf-ray", HeaderValue::from_static("abc"));
        assert_eq!(
            header_first(&headers, &["x-request-id", "cf-ray"]).as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let config = ServiceConfig {
            base_url: "http://localhost:9/".to_string(),
            ..ServiceConfig::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.base_url(), "http://localhost:9");
    }
}
