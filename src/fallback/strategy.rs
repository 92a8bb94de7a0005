//! Service-backed extraction strategies.

use crate::client::{CallOptions, ExtractionService, RequestContent};
use crate::types::{DocumentRef, ExtractedFields, ExtractionMethod};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const TRANSCRIBE_INSTRUCTIONS: &str = "Transcribe all text in this document.";

/// Raw output of one tier, before confidence decay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierOutput {
    pub fields: ExtractedFields,
    pub raw_confidence: f64,
    pub cost: f64,
}

/// One tier of the fallback chain.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn method(&self) -> ExtractionMethod;

    /// Names of the dependencies that must be usable for this tier to run.
    fn dependencies(&self) -> Vec<String>;

    async fn extract(&self, doc: &DocumentRef, instructions: &str) -> Result<TierOutput>;
}

fn require_fields(service: &str, fields: ExtractedFields) -> Result<ExtractedFields> {
    if fields.is_empty() {
        return Err(Error::MalformedResponse {
            service: service.to_string(),
            reason: "no fields extracted".to_string(),
            snippet: String::new(),
        });
    }
    Ok(fields)
}

/// OCR followed by AI structuring of the recognised text.
///
/// Confidence is the weaker of the two stages; cost is their sum.
pub struct HybridStrategy {
    ocr: Arc<dyn ExtractionService>,
    structurer: Arc<dyn ExtractionService>,
}

impl HybridStrategy {
    pub fn new(ocr: Arc<dyn ExtractionService>, structurer: Arc<dyn ExtractionService>) -> Self {
        Self { ocr, structurer }
    }
}

#[async_trait]
impl ExtractionStrategy for HybridStrategy {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Primary
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.ocr.name().to_string(), self.structurer.name().to_string()]
    }

    async fn extract(&self, doc: &DocumentRef, instructions: &str) -> Result<TierOutput> {
        let options = CallOptions::with_hints(doc.classification.clone());
        let recognised = self
            .ocr
            .call(
                &RequestContent::Url(doc.file_ref.clone()),
                TRANSCRIBE_INSTRUCTIONS,
                &options,
            )
            .await?;
        let text = recognised.text.clone().filter(|t| !t.trim().is_empty()).ok_or_else(|| {
            Error::MalformedResponse {
                service: self.ocr.name().to_string(),
                reason: "OCR returned no text".to_string(),
                snippet: String::new(),
            }
        })?;
        debug!(document_id = %doc.document_id, chars = text.len(), "ocr stage done");

        let structured = self
            .structurer
            .call(&RequestContent::Text(text), instructions, &options)
            .await?;
        let fields = require_fields(self.structurer.name(), structured.fields)?;

        Ok(TierOutput {
            fields,
            raw_confidence: recognised.confidence.min(structured.confidence),
            cost: recognised.cost.total + structured.cost.total,
        })
    }
}

/// Direct extraction by one service.
pub struct SingleServiceStrategy {
    service: Arc<dyn ExtractionService>,
}

impl SingleServiceStrategy {
    pub fn new(service: Arc<dyn ExtractionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ExtractionStrategy for SingleServiceStrategy {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Fallback1
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.service.name().to_string()]
    }

    async fn extract(&self, doc: &DocumentRef, instructions: &str) -> Result<TierOutput> {
        let response = self
            .service
            .call(
                &RequestContent::Url(doc.file_ref.clone()),
                instructions,
                &CallOptions::with_hints(doc.classification.clone()),
            )
            .await?;
        Ok(TierOutput {
            fields: require_fields(self.service.name(), response.fields)?,
            raw_confidence: response.confidence,
            cost: response.cost.total,
        })
    }
}
