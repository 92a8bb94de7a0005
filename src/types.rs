//! Core domain types shared by the fallback chain, the job queue and the stores.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Extracted field name → value.
pub type ExtractedFields = Map<String, Value>;

/// Classification hints supplied at upload time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassificationHints {
    /// Client category the document belongs to (e.g. "sole_proprietor").
    #[serde(default)]
    pub client_type: Option<String>,
    /// Document type (e.g. "tax_return", "invoice").
    #[serde(default)]
    pub document_type: Option<String>,
}

impl ClassificationHints {
    pub fn new(client_type: Option<&str>, document_type: Option<&str>) -> Self {
        Self {
            client_type: client_type.map(str::to_string),
            document_type: document_type.map(str::to_string),
        }
    }

    pub fn document_type_or_default(&self) -> &str {
        self.document_type.as_deref().unwrap_or("document")
    }
}

/// Queue priority; higher is dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("Unknown priority: {}", other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        })
    }
}

/// Reference to an uploaded document whose bytes live in external storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub document_id: String,
    /// Fetchable URL or storage key of the file bytes.
    pub file_ref: String,
    pub file_name: String,
    #[serde(default)]
    pub classification: ClassificationHints,
}

/// Fallback chain tier identifier, ordered from most to least capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Primary,
    #[serde(rename = "fallback_1")]
    Fallback1,
    #[serde(rename = "fallback_2")]
    Fallback2,
    ManualReview,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Primary => "primary",
            ExtractionMethod::Fallback1 => "fallback_1",
            ExtractionMethod::Fallback2 => "fallback_2",
            ExtractionMethod::ManualReview => "manual_review",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one fallback-chain tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionAttemptResult {
    pub success: bool,
    pub method: ExtractionMethod,
    /// 0..=1, already decayed for the tier.
    pub confidence: f64,
    /// Monetary estimate of the calls made by this tier.
    pub cost: f64,
    pub processing_time_ms: u64,
    /// Failure messages of the tiers tried before this one, in order.
    pub errors: Vec<String>,
    #[serde(default)]
    pub data: Option<ExtractedFields>,
}

impl ExtractionAttemptResult {
    /// Terminal human-review result: always successful, no confidence, no cost.
    pub fn manual_review(errors: Vec<String>, processing_time_ms: u64) -> Self {
        Self {
            success: true,
            method: ExtractionMethod::ManualReview,
            confidence: 0.0,
            cost: 0.0,
            processing_time_ms,
            errors,
            data: None,
        }
    }

    pub fn is_manual_review(&self) -> bool {
        self.method == ExtractionMethod::ManualReview
    }
}
