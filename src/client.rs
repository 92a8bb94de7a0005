//! 外部抽取服务客户端：凭据轮换、防御式响应解析与统一服务接口。
//!
//! Clients for external extraction services.
//!
//! The fallback chain and the health cache only see [`ExtractionService`]; the HTTP
//! implementation is [`CredentialRotatingClient`].

pub mod credentials;
mod error_classification;
pub mod response;
pub mod rotating;

pub use credentials::{resolve_credentials, Credential};
pub use response::{parse_service_response, CostBreakdown, ServiceResponse};
pub use rotating::CredentialRotatingClient;

use crate::types::ClassificationHints;
use crate::Result;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Value};

/// What the service should extract from.
#[derive(Debug, Clone)]
pub enum RequestContent {
    /// URL the service can fetch the file from.
    Url(String),
    /// File bytes sent inline (base64 on the wire).
    Inline { data: Bytes, mime_type: String },
    /// Already-recognised text, e.g. OCR output passed to a structuring service.
    Text(String),
}

impl RequestContent {
    pub(crate) fn to_json(&self) -> Value {
        match self {
            RequestContent::Url(url) => json!({ "url": url }),
            RequestContent::Inline { data, mime_type } => json!({
                "content_base64": base64::engine::general_purpose::STANDARD.encode(data),
                "mime_type": mime_type,
            }),
            RequestContent::Text(text) => json!({ "text": text }),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub hints: ClassificationHints,
    /// Extra top-level request fields; never override the standard ones.
    pub extra: Option<Value>,
}

impl CallOptions {
    pub fn with_hints(hints: ClassificationHints) -> Self {
        Self { hints, extra: None }
    }
}

/// An external extraction dependency.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Dependency name; also the key of its guard and health verdict.
    fn name(&self) -> &str;

    async fn call(
        &self,
        content: &RequestContent,
        instructions: &str,
        options: &CallOptions,
    ) -> Result<ServiceResponse>;

    /// Minimal-cost synthetic request used by the health cache.
    async fn probe(&self) -> Result<()>;
}
