//! Defensive parsing of extraction service responses.
//!
//! Services (LLM-backed ones in particular) do not reliably return bare JSON. The parser tries,
//! in order: the body as JSON (unwrapping a text envelope such as `{"content": "..."}`), a
//! ```` ```json ```` fenced block, any fenced block, and finally the outermost `{...}` span.

use crate::types::ExtractedFields;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const SNIPPET_CHARS: usize = 200;

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)\s*(.*?)```").expect("static regex"));
static ANY_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*(.*?)```").expect("static regex"));

const ENVELOPE_KEYS: &[&str] = &["content", "output", "result", "completion"];
const FIELD_KEYS: &[&str] = &["fields", "extracted_fields", "extracted_data", "data"];
const RESERVED_KEYS: &[&str] = &[
    "confidence",
    "cost",
    "cost_breakdown",
    "text",
    "usage",
    "model",
    "id",
];

/// Monetary cost reported by a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub total: f64,
    #[serde(default)]
    pub items: BTreeMap<String, f64>,
}

impl CostBreakdown {
    fn from_value(v: &Value) -> Self {
        match v {
            Value::Number(n) => Self {
                total: n.as_f64().unwrap_or(0.0),
                items: BTreeMap::new(),
            },
            Value::Object(obj) => {
                let items: BTreeMap<String, f64> = obj
                    .iter()
                    .filter(|(k, _)| k.as_str() != "total")
                    .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                    .collect();
                let total = obj
                    .get("total")
                    .and_then(Value::as_f64)
                    .unwrap_or_else(|| items.values().sum());
                Self { total, items }
            }
            _ => Self::default(),
        }
    }
}

/// Parsed extraction response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceResponse {
    pub fields: ExtractedFields,
    /// Reported confidence in 0..=1; unscored responses are treated as 0.
    pub confidence: f64,
    pub cost: CostBreakdown,
    /// Plain text payload (OCR output), when present.
    pub text: Option<String>,
}

fn snippet(raw: &str) -> String {
    raw.chars().take(SNIPPET_CHARS).collect()
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

/// Find a JSON object inside free text.
fn extract_object_from_text(text: &str) -> Option<Map<String, Value>> {
    if let Some(obj) = parse_object(text) {
        return Some(obj);
    }
    for re in [&*JSON_FENCE, &*ANY_FENCE] {
        for caps in re.captures_iter(text) {
            if let Some(obj) = caps.get(1).and_then(|m| parse_object(m.as_str())) {
                return Some(obj);
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        parse_object(&text[start..=end])
    } else {
        None
    }
}

fn unwrap_envelope(mut outer: Map<String, Value>) -> Map<String, Value> {
    if FIELD_KEYS.iter().any(|k| outer.get(*k).map_or(false, Value::is_object)) {
        return outer;
    }
    for key in ENVELOPE_KEYS {
        let inner = match outer.get(*key) {
            Some(Value::String(s)) => extract_object_from_text(s),
            _ => None,
        };
        if let Some(mut inner) = inner {
            // envelope-level metadata fills what the payload omits
            for meta in ["confidence", "cost", "cost_breakdown"] {
                if !inner.contains_key(meta) {
                    if let Some(v) = outer.remove(meta) {
                        inner.insert(meta.to_string(), v);
                    }
                }
            }
            return inner;
        }
    }
    outer
}

fn into_response(mut obj: Map<String, Value>) -> ServiceResponse {
    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(0.0);
    let cost = obj
        .get("cost_breakdown")
        .or_else(|| obj.get("cost"))
        .map(CostBreakdown::from_value)
        .unwrap_or_default();
    let text = obj.get("text").and_then(Value::as_str).map(str::to_string);

    let nested = FIELD_KEYS.iter().find_map(|k| match obj.get(*k) {
        Some(Value::Object(m)) => Some(m.clone()),
        _ => None,
    });
    let fields = match nested {
        Some(m) => m,
        None => {
            for key in RESERVED_KEYS {
                obj.remove(*key);
            }
            obj
        }
    };

    ServiceResponse {
        fields,
        confidence,
        cost,
        text,
    }
}

/// Parse a 2xx body from `service`.
pub fn parse_service_response(service: &str, body: &str) -> Result<ServiceResponse> {
    let malformed = |reason: &str| Error::MalformedResponse {
        service: service.to_string(),
        reason: reason.to_string(),
        snippet: snippet(body),
    };

    if body.trim().is_empty() {
        return Err(malformed("empty body"));
    }
    let obj = match parse_object(body) {
        Some(outer) => unwrap_envelope(outer),
        None => extract_object_from_text(body).ok_or_else(|| malformed("no JSON object found"))?,
    };
    let response = into_response(obj);
    if response.fields.is_empty() && response.text.is_none() {
        return Err(malformed("response carries neither fields nor text"));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_json_with_nested_fields() {
        let body = r#"{"fields":{"total":"1200","issuer":"ACME"},"confidence":0.93,"cost":{"ocr":0.002,"llm":0.01}}"#;
        let r = parse_service_response("ai", body).unwrap();
        assert_eq!(r.fields["issuer"], json!("ACME"));
        assert_eq!(r.confidence, 0.93);
        assert!((r.cost.total - 0.012).abs() < 1e-9);
        assert_eq!(r.cost.items.len(), 2);
    }

    #[test]
    fn test_flat_json_drops_reserved_keys() {
        let body = r#"{"issuer":"ACME","confidence":0.5,"cost":0.01,"usage":{"tokens":12}}"#;
        let r = parse_service_response("ai", body).unwrap();
        assert_eq!(r.fields.len(), 1);
        assert_eq!(r.cost.total, 0.01);
    }

    #[test]
    fn test_fenced_block_in_text() {
        let body = "Here you go:\n```json\n{\"issuer\": \"ACME\", \"confidence\": 0.8}\n```\nThanks";
        let r = parse_service_response("ai", body).unwrap();
        assert_eq!(r.fields["issuer"], json!("ACME"));
        assert_eq!(r.confidence, 0.8);
    }

    #[test]
    fn test_envelope_with_fenced_content_keeps_outer_cost() {
        let body = json!({
            "content": "```\n{\"amount\": 10}\n```",
            "cost": 0.004,
            "confidence": 0.7
        })
        .to_string();
        let r = parse_service_response("ai", &body).unwrap();
        assert_eq!(r.fields["amount"], json!(10));
        assert_eq!(r.cost.total, 0.004);
        assert_eq!(r.confidence, 0.7);
    }

    #[test]
    fn test_ocr_text_response() {
        let body = r#"{"text":"INVOICE 42","confidence":0.99,"cost":0.001}"#;
        let r = parse_service_response("ocr", body).unwrap();
        assert_eq!(r.text.as_deref(), Some("INVOICE 42"));
        assert!(r.fields.is_empty());
    }

    #[test]
    fn test_brace_span_fallback() {
        let body = "result => {\"issuer\": \"ACME\"} <= end";
        let r = parse_service_response("ai", body).unwrap();
        assert_eq!(r.fields["issuer"], json!("ACME"));
    }

    #[test]
    fn test_malformed_includes_first_200_chars() {
        let body = "x".repeat(500);
        let err = parse_service_response("ai", &body).unwrap_err();
        match err {
            Error::MalformedResponse { snippet, service, .. } => {
                assert_eq!(service, "ai");
                assert_eq!(snippet.chars().count(), 200);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_confidence_is_clamped() {
        let r = parse_service_response("ai", r#"{"a":1,"confidence":7}"#).unwrap();
        assert_eq!(r.confidence, 1.0);
    }
}
