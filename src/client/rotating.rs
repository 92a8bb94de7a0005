//! Extraction client that rotates through a service's credentials.

use super::credentials::{resolve_credentials, Credential};
use super::error_classification::error_from_response;
use super::response::{parse_service_response, ServiceResponse};
use super::{CallOptions, ExtractionService, RequestContent};
use crate::config::ServiceConfig;
use crate::resilience::{DependencyGuard, GuardRegistry};
use crate::transport::{HttpTransport, RawResponse};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// HTTP client for one extraction service.
///
/// Credentials are tried in priority order. Quota exhaustion and rejected keys (401/403) fall
/// through to the next credential after `rotation_delay`; transient failures, open circuits,
/// other rejections and malformed bodies propagate immediately. Every attempt passes
/// through the service's shared [`DependencyGuard`].
pub struct CredentialRotatingClient {
    service: String,
    config: ServiceConfig,
    credentials: Vec<Credential>,
    transport: HttpTransport,
    guard: Arc<DependencyGuard>,
}

impl CredentialRotatingClient {
    pub fn new(
        service: impl Into<String>,
        config: ServiceConfig,
        credentials: Vec<Credential>,
        guard: Arc<DependencyGuard>,
    ) -> Result<Self> {
        let service = service.into();
        if credentials.is_empty() {
            return Err(Error::configuration_with_context(
                format!("service '{}' has no credentials", service),
                crate::ErrorContext::new()
                    .with_field_path(format!("services.{}.credentials", service))
                    .with_source("client"),
            ));
        }
        let transport = HttpTransport::new(&config)?;
        Ok(Self {
            service,
            config,
            credentials,
            transport,
            guard,
        })
    }

    /// Build from configuration, resolving credentials from the keyring or environment and
    /// sharing the registry's guard for `name`.
    pub fn from_config(name: &str, config: &ServiceConfig, guards: &GuardRegistry) -> Result<Self> {
        let credentials = resolve_credentials(name, &config.credentials)?;
        Self::new(name, config.clone(), credentials, guards.guard(name))
    }

    pub fn credential_labels(&self) -> Vec<&str> {
        self.credentials.iter().map(Credential::label).collect()
    }

    fn request_body(content: &RequestContent, instructions: &str, options: &CallOptions) -> Value {
        let mut body = json!({
            "document": content.to_json(),
            "instructions": instructions,
            "hints": options.hints,
        });
        if let (Some(Value::Object(extra)), Some(obj)) = (&options.extra, body.as_object_mut()) {
            for (k, v) in extra {
                obj.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        body
    }

    async fn send_with<T, P>(&self, path: &str, body: &Value, parse: P) -> Result<T>
    where
        P: Fn(&RawResponse) -> Result<T>,
    {
        let total = self.credentials.len();
        let mut attempts: Vec<String> = Vec::new();
        let mut exhausted_all = true;

        for (idx, credential) in self.credentials.iter().enumerate() {
            let request_id = uuid::Uuid::new_v4().to_string();
            let result = self
                .guard
                .run(|| async {
                    let raw = self
                        .transport
                        .post_json(path, body, credential.secret(), &request_id)
                        .await?;
                    if raw.is_success() {
                        parse(&raw)
                    } else {
                        debug!(
                            service = %self.service,
                            status = raw.status,
                            upstream_request_id = raw.upstream_request_id.as_deref().unwrap_or("-"),
                            "non-success response"
                        );
                        Err(error_from_response(&self.service, credential.label(), &raw))
                    }
                })
                .await;

            let err = match result {
                Ok(value) => {
                    if idx > 0 {
                        info!(
                            service = %self.service,
                            credential = credential.label(),
                            fingerprint = %credential.fingerprint(),
                            "succeeded on backup credential"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_credential_scoped() {
                return Err(err);
            }
            if !matches!(err, Error::QuotaExhausted { .. }) {
                exhausted_all = false;
            }

            attempts.push(format!("{}: {}", credential.label(), err));
            let has_backup = idx + 1 < total;
            if !has_backup {
                if exhausted_all || total > 1 {
                    break;
                }
                return Err(err);
            }

            warn!(
                service = %self.service,
                credential = credential.label(),
                fingerprint = %credential.fingerprint(),
                error = %err,
                "rotating to next credential"
            );
            tokio::time::sleep(self.config.rotation_delay()).await;
        }

        Err(Error::AllCredentialsExhausted {
            service: self.service.clone(),
            attempts,
        })
    }
}

#[async_trait]
impl ExtractionService for CredentialRotatingClient {
    fn name(&self) -> &str {
        &self.service
    }

    async fn call(
        &self,
        content: &RequestContent,
        instructions: &str,
        options: &CallOptions,
    ) -> Result<ServiceResponse> {
        let body = Self::request_body(content, instructions, options);
        let service = self.service.clone();
        self.send_with(&self.config.extract_path, &body, move |raw| {
            parse_service_response(&service, &raw.body)
        })
        .await
    }

    async fn probe(&self) -> Result<()> {
        let body = json!({ "probe": true, "document": { "text": "ping" } });
        self.send_with(&self.config.probe_path, &body, |_| Ok(())).await
    }
}
