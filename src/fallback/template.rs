//! Template-based synthesis from prior extractions of similar documents.
//!
//! Documents are "similar" when their normalized file names match, they share a classification,
//! and the prior extraction scored at least `min_confidence`. Each field takes its most frequent
//! value across the matched set.

use super::strategy::{ExtractionStrategy, TierOutput};
use crate::config::TemplateConfig;
use crate::types::{ClassificationHints, DocumentRef, ExtractedFields, ExtractionMethod};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]+").expect("static regex"));
static SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s\-_.()\[\]]+").expect("static regex"));

/// Structural pattern of a file name: `"Invoice-2024-03.PDF"` becomes `"invoice_#_#"`.
pub fn normalize_file_name(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let stem = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };
    let lowered = stem.to_lowercase();
    let digits = DIGITS.replace_all(&lowered, "#");
    let joined = SEPARATORS.replace_all(&digits, "_");
    joined.trim_matches('_').to_string()
}

/// One successful extraction kept for future template synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub document_id: String,
    pub file_pattern: String,
    pub classification: ClassificationHints,
    pub method: ExtractionMethod,
    pub confidence: f64,
    pub fields: ExtractedFields,
    pub extracted_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExtractionHistory: Send + Sync {
    async fn record(&self, entry: HistoryEntry) -> Result<()>;

    /// Matches for `pattern` and `classification` scoring at least `min_confidence`,
    /// most recent first, at most `limit`.
    async fn find_similar(
        &self,
        pattern: &str,
        classification: &ClassificationHints,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>>;
}

#[derive(Default)]
pub struct MemoryExtractionHistory {
    entries: RwLock<Vec<HistoryEntry>>,
}

impl MemoryExtractionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExtractionHistory for MemoryExtractionHistory {
    async fn record(&self, entry: HistoryEntry) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        // a re-applied completion replaces rather than duplicates
        entries.retain(|e| e.document_id != entry.document_id);
        entries.push(entry);
        Ok(())
    }

    async fn find_similar(
        &self,
        pattern: &str,
        classification: &ClassificationHints,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let mut matched: Vec<HistoryEntry> = entries
            .iter()
            .filter(|e| {
                e.file_pattern == pattern
                    && &e.classification == classification
                    && e.confidence >= min_confidence
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.extracted_at.cmp(&a.extracted_at));
        matched.truncate(limit);
        Ok(matched)
    }
}

struct Candidate {
    value: Value,
    key: String,
    count: usize,
    latest: DateTime<Utc>,
}

/// Most frequent value per field. Ties go to the value seen most recently, then to the
/// shortest (then lexically smallest) JSON encoding.
pub fn synthesize_fields(samples: &[HistoryEntry]) -> ExtractedFields {
    let names: BTreeSet<&String> = samples.iter().flat_map(|s| s.fields.keys()).collect();
    let mut out = ExtractedFields::new();

    for name in names {
        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        for sample in samples {
            let Some(value) = sample.fields.get(name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let key = value.to_string();
            let c = candidates.entry(key.clone()).or_insert_with(|| Candidate {
                value: value.clone(),
                key,
                count: 0,
                latest: sample.extracted_at,
            });
            c.count += 1;
            if sample.extracted_at > c.latest {
                c.latest = sample.extracted_at;
            }
        }
        let winner = candidates.into_values().max_by(|a, b| {
            a.count
                .cmp(&b.count)
                .then(a.latest.cmp(&b.latest))
                .then_with(|| b.key.len().cmp(&a.key.len()))
                .then_with(|| b.key.cmp(&a.key))
        });
        if let Some(w) = winner {
            out.insert(name.clone(), w.value);
        }
    }
    out
}

/// Fallback tier with no external dependency and no cost.
pub struct TemplateStrategy {
    history: Arc<dyn ExtractionHistory>,
    config: TemplateConfig,
}

impl TemplateStrategy {
    pub fn new(history: Arc<dyn ExtractionHistory>, config: TemplateConfig) -> Self {
        Self { history, config }
    }
}

#[async_trait]
impl ExtractionStrategy for TemplateStrategy {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Fallback2
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn extract(&self, doc: &DocumentRef, _instructions: &str) -> Result<TierOutput> {
        let pattern = normalize_file_name(&doc.file_name);
        let samples = self
            .history
            .find_similar(
                &pattern,
                &doc.classification,
                self.config.min_confidence,
                self.config.max_samples,
            )
            .await?;
        if samples.is_empty() {
            return Err(Error::validation_with_context(
                "no similar documents in extraction history",
                ErrorContext::new()
                    .with_details(format!("pattern '{}'", pattern))
                    .with_source("template"),
            ));
        }
        let fields = synthesize_fields(&samples);
        if fields.is_empty() {
            return Err(Error::validation_with_context(
                "similar documents carry no usable fields",
                ErrorContext::new().with_source("template"),
            ));
        }
        let raw_confidence =
            samples.iter().map(|s| s.confidence).sum::<f64>() / samples.len() as f64;
        Ok(TierOutput {
            fields,
            raw_confidence,
            cost: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry(id: &str, conf: f64, fields: Value, minutes_ago: i64) -> HistoryEntry {
        HistoryEntry {
            document_id: id.into(),
            file_pattern: "invoice_#_#".into(),
            classification: ClassificationHints::new(Some("company"), Some("invoice")),
            method: ExtractionMethod::Primary,
            confidence: conf,
            fields: fields.as_object().cloned().unwrap_or_default(),
            extracted_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn test_normalize_file_name() {
        assert_eq!(normalize_file_name("Invoice-2024-03.PDF"), "invoice_#_#");
        assert_eq!(normalize_file_name("invoice_2023_11.pdf"), "invoice_#_#");
        assert_eq!(normalize_file_name("uploads/Tax Return (2022).pdf"), "tax_return_#");
        assert_eq!(normalize_file_name(".hidden"), "hidden");
        assert_eq!(normalize_file_name("receipt"), "receipt");
    }

    #[test]
    fn test_most_frequent_value_wins() {
        let samples = vec![
            entry("a", 0.9, json!({"issuer": "ACME", "currency": "EUR"}), 3),
            entry("b", 0.9, json!({"issuer": "ACME", "currency": "USD"}), 2),
            entry("c", 0.9, json!({"issuer": "Other", "currency": "EUR"}), 1),
        ];
        let fields = synthesize_fields(&samples);
        assert_eq!(fields["issuer"], json!("ACME"));
        assert_eq!(fields["currency"], json!("EUR"));
    }

    #[test]
    fn test_tie_goes_to_most_recent() {
        let samples = vec![
            entry("a", 0.9, json!({"vat": "19%"}), 10),
            entry("b", 0.9, json!({"vat": "7%"}), 1),
        ];
        assert_eq!(synthesize_fields(&samples)["vat"], json!("7%"));
    }

    #[tokio::test]
    async fn test_template_filters_by_confidence_and_classification() {
        let history = Arc::new(MemoryExtractionHistory::new());
        history
            .record(entry("low", 0.5, json!({"issuer": "Low"}), 1))
            .await
            .unwrap();
        let mut other = entry("other", 0.95, json!({"issuer": "Elsewhere"}), 1);
        other.classification = ClassificationHints::new(Some("person"), Some("invoice"));
        history.record(other).await.unwrap();
        history
            .record(entry("good", 0.9, json!({"issuer": "ACME"}), 5))
            .await
            .unwrap();

        let strategy = TemplateStrategy::new(history, TemplateConfig::default());
        let doc = DocumentRef {
            document_id: "new".into(),
            file_ref: "s3://bucket/new".into(),
            file_name: "INVOICE_2025_01.pdf".into(),
            classification: ClassificationHints::new(Some("company"), Some("invoice")),
        };
        let out = strategy.extract(&doc, "").await.unwrap();
        assert_eq!(out.fields["issuer"], json!("ACME"));
        assert_eq!(out.raw_confidence, 0.9);
        assert_eq!(out.cost, 0.0);
    }

    #[tokio::test]
    async fn test_template_without_history_fails() {
        let strategy = TemplateStrategy::new(
            Arc::new(MemoryExtractionHistory::new()),
            TemplateConfig::default(),
        );
        let doc = DocumentRef {
            document_id: "d".into(),
            file_ref: "f".into(),
            file_name: "scan.pdf".into(),
            classification: ClassificationHints::default(),
        };
        assert!(strategy.extract(&doc, "").await.is_err());
    }
}
