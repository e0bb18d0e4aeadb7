//! Abstract external analysis function (§6.4).
//!
//! The concrete LLM provider is explicitly out of scope (§1 Non-goals); this
//! module only defines the contract every CIL engine calls through:
//! `analyze(template, context) -> Option<AnalysisResult>`. A `None` means
//! "no result this cycle, try later" and covers both provider failure and a
//! malformed response — callers never distinguish the two per §7's "Analysis
//! function failure" handling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Which prompt template a call is invoking. Kept as a string tag rather than
/// a closed enum since new engines register new templates without touching
/// this module (mirrors the capability-map pattern of spec §9).
pub type PromptTemplateId = String;

/// Structured result returned by a successful analysis call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub template_id: String,
    pub narrative: String,
    pub fields: Value,
    pub confidence: f64,
}

/// The abstract analysis function contract (§6.4).
#[async_trait]
pub trait AnalysisFunction: Send + Sync {
    /// Deterministic on a given (template, context). May fail or time out;
    /// callers must treat `Ok(None)` and `Err(_)` identically as "no result".
    async fn analyze(
        &self,
        template_id: &str,
        context: &Value,
    ) -> anyhow::Result<Option<AnalysisResult>>;
}

/// A provider wrapper that enforces the per-call timeout described in §5
/// ("Long-running analysis-function calls carry their own timeout").
pub struct TimeoutAnalysisFunction<F> {
    inner: F,
    timeout: Duration,
}

impl<F: AnalysisFunction> TimeoutAnalysisFunction<F> {
    pub fn new(inner: F, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<F: AnalysisFunction> AnalysisFunction for TimeoutAnalysisFunction<F> {
    async fn analyze(
        &self,
        template_id: &str,
        context: &Value,
    ) -> anyhow::Result<Option<AnalysisResult>> {
        match tokio::time::timeout(self.timeout, self.inner.analyze(template_id, context)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(template_id, "analysis function call timed out");
                Ok(None)
            }
        }
    }
}

/// Validates a raw provider response against the strict schema an
/// implementer must define per spec §9's open question on mechanism-
/// hypothesis JSON. Malformed responses are rejected as "no result" rather
/// than partially trusted.
pub fn parse_strict(raw: &Value, template_id: &str) -> Option<AnalysisResult> {
    let narrative = raw.get("narrative")?.as_str()?.to_string();
    let confidence = raw.get("confidence")?.as_f64()?;
    if !(0.0..=1.0).contains(&confidence) {
        return None;
    }
    let fields = raw.get("fields").cloned().unwrap_or(Value::Null);
    Some(AnalysisResult {
        template_id: template_id.to_string(),
        narrative,
        fields,
        confidence,
    })
}

/// Test/dev stand-in: never calls a network provider, always returns `None`
/// unless a canned response table is configured. Mirrors the teacher's
/// pattern of a disabled/offline feed stub (e.g. `BinancePriceFeed::disabled`).
pub struct NullAnalysisFunction {
    pub canned: parking_lot::Mutex<std::collections::HashMap<String, AnalysisResult>>,
}

impl NullAnalysisFunction {
    pub fn new() -> Self {
        Self {
            canned: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn with_canned(self, key: impl Into<String>, result: AnalysisResult) -> Self {
        self.canned.lock().insert(key.into(), result);
        self
    }
}

impl Default for NullAnalysisFunction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalysisFunction for NullAnalysisFunction {
    async fn analyze(
        &self,
        template_id: &str,
        _context: &Value,
    ) -> anyhow::Result<Option<AnalysisResult>> {
        Ok(self.canned.lock().get(template_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_out_of_range_confidence() {
        let raw = json!({"narrative": "x", "confidence": 1.5});
        assert!(parse_strict(&raw, "t").is_none());
    }

    #[test]
    fn rejects_missing_narrative() {
        let raw = json!({"confidence": 0.5});
        assert!(parse_strict(&raw, "t").is_none());
    }

    #[tokio::test]
    async fn null_function_returns_canned() {
        let f = NullAnalysisFunction::new().with_canned(
            "lesson_synthesis",
            AnalysisResult {
                template_id: "lesson_synthesis".into(),
                narrative: "members agree".into(),
                fields: json!({}),
                confidence: 0.9,
            },
        );
        let out = f.analyze("lesson_synthesis", &json!({})).await.unwrap();
        assert!(out.is_some());
        assert!(f.analyze("other", &json!({})).await.unwrap().is_none());
    }
}
