//! Capability gap assessment.
//!
//! One reasoning-service call decides whether the host's current actions
//! cover the request. The reply is untrusted input: anything that does not
//! parse degrades to a conservative default instead of failing the request,
//! so a flaky provider can slow synthesis down but never wedge it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::llm::LlmProvider;
use crate::prompt::{FilePromptStore, PromptManager};
use crate::types::{CapabilityAssessment, CapabilityRequest, Complexity};

const ASSESSMENT_FALLBACK_PROMPT: &str = r#"You are the capability assessor of a desktop assistant. Decide whether the
assistant's current actions can satisfy the user's request, and if not, name
the missing capability.

Current actions: {available_actions}

User request: {request}

Respond ONLY with a JSON object:
{
  "can_handle": true or false,
  "confidence": 0.0 to 1.0,
  "missing_capability": "<short name of what is missing, empty if nothing>",
  "required_operations": ["<operation>", "..."],
  "complexity": "low" | "medium" | "high",
  "estimated_lines": <integer>
}
"#;

/// Loosely-typed mirror of the expected reply. Every field is optional so a
/// partially well-formed reply still contributes what it has.
#[derive(Debug, Deserialize)]
struct RawAssessment {
    can_handle: Option<bool>,
    confidence: Option<f64>,
    missing_capability: Option<String>,
    required_operations: Option<Vec<String>>,
    complexity: Option<String>,
    estimated_lines: Option<u32>,
}

/// Result of an assessment, with a marker for the degraded path.
#[derive(Debug, Clone)]
pub struct AssessmentOutcome {
    pub assessment: CapabilityAssessment,
    /// True when the reply was malformed and the conservative default was
    /// substituted.
    pub degraded: bool,
}

pub struct GapAssessor {
    provider: Arc<dyn LlmProvider>,
    prompts: PromptManager<FilePromptStore>,
}

impl GapAssessor {
    pub fn new(provider: Arc<dyn LlmProvider>, prompts: PromptManager<FilePromptStore>) -> Self {
        Self { provider, prompts }
    }

    /// Assess the gap for `request`. Provider errors and malformed replies
    /// both degrade to the conservative default; this never errors.
    pub async fn assess(&self, request: &CapabilityRequest) -> AssessmentOutcome {
        let mut vars = HashMap::new();
        vars.insert("request".to_string(), request.text.clone());
        vars.insert(
            "available_actions".to_string(),
            if request.available_actions.is_empty() {
                "(none)".to_string()
            } else {
                request.available_actions.join(", ")
            },
        );
        let prompt = self
            .prompts
            .render_or("gap_assessment", &vars, ASSESSMENT_FALLBACK_PROMPT);

        let reply = match self.provider.generate(&prompt).await {
            Ok(completion) => {
                tracing::debug!(
                    prompt_hash = %completion.prompt_hash,
                    response_hash = %completion.response_hash,
                    latency_ms = completion.latency_ms,
                    "assessment completion received"
                );
                completion.content
            }
            Err(e) => {
                tracing::warn!(error = %e, "assessment call failed, degrading to conservative default");
                return AssessmentOutcome {
                    assessment: CapabilityAssessment::conservative(derive_capability_name(
                        &request.text,
                    )),
                    degraded: true,
                };
            }
        };

        match parse_assessment(&reply) {
            Some(assessment) => AssessmentOutcome {
                assessment: assessment.clamped(),
                degraded: false,
            },
            None => {
                tracing::warn!(
                    reply_len = reply.len(),
                    "assessment reply unparseable, degrading to conservative default"
                );
                AssessmentOutcome {
                    assessment: CapabilityAssessment::conservative(derive_capability_name(
                        &request.text,
                    )),
                    degraded: true,
                }
            }
        }
    }
}

/// Extract and parse the assessment JSON from a free-form reply. Handles
/// fenced blocks and surrounding prose; returns None when no usable object
/// is present or the mandatory verdict is missing.
fn parse_assessment(reply: &str) -> Option<CapabilityAssessment> {
    let candidate = extract_json_object(reply)?;
    let raw: RawAssessment = serde_json::from_str(candidate).ok()?;
    // can_handle is the one field without a sane default; a reply that
    // omits it tells us nothing.
    let can_handle = raw.can_handle?;
    Some(CapabilityAssessment {
        can_handle,
        confidence: raw.confidence.unwrap_or(0.5),
        missing_capability: raw.missing_capability.unwrap_or_default(),
        required_operations: raw.required_operations.unwrap_or_default(),
        complexity: parse_complexity(raw.complexity.as_deref()),
        estimated_lines: raw.estimated_lines.unwrap_or(0),
    })
}

fn parse_complexity(value: Option<&str>) -> Complexity {
    match value.map(|v| v.trim().to_lowercase()).as_deref() {
        Some("low") => Complexity::Low,
        Some("high") => Complexity::High,
        _ => Complexity::Medium,
    }
}

/// Locate the JSON object in a reply that may wrap it in markdown fences or
/// prose: prefer the fenced block, then fall back to the outermost braces.
fn extract_json_object(reply: &str) -> Option<&str> {
    let body = if reply.contains("```json") {
        reply
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(reply)
    } else if reply.contains("```") {
        reply.split("```").nth(1).unwrap_or(reply)
    } else {
        reply
    };
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&body[start..=end])
}

/// Heuristic capability name for the degraded path: the leading words of
/// the request, normalized.
pub(crate) fn derive_capability_name(request_text: &str) -> String {
    let mut name: String = request_text
        .split_whitespace()
        .take(6)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    name.retain(|c| c.is_alphanumeric() || c.is_whitespace() || c == '-');
    if name.is_empty() {
        "unspecified capability".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_plain_json() {
        let reply = r#"{"can_handle": false, "confidence": 0.9, "missing_capability": "csv analysis", "required_operations": ["sum_column"], "complexity": "low", "estimated_lines": 30}"#;
        let a = parse_assessment(reply).unwrap();
        assert!(!a.can_handle);
        assert_eq!(a.missing_capability, "csv analysis");
        assert_eq!(a.complexity, Complexity::Low);
    }

    #[test]
    fn test_parse_fenced_json_with_prose() {
        let reply = "Sure, here is my verdict:\n```json\n{\"can_handle\": true, \"confidence\": 1.2}\n```\nHope this helps!";
        let a = parse_assessment(reply).unwrap().clamped();
        assert!(a.can_handle);
        assert_eq!(a.confidence, 1.0);
        assert_eq!(a.complexity, Complexity::Medium);
    }

    #[test]
    fn test_garbage_reply_is_unparseable() {
        assert!(parse_assessment("I cannot answer that.").is_none());
        assert!(parse_assessment("").is_none());
        // Object present but no verdict field.
        assert!(parse_assessment(r#"{"confidence": 0.4}"#).is_none());
    }

    #[test]
    fn test_derive_capability_name() {
        assert_eq!(
            derive_capability_name("Sum the value column of expenses.csv please!"),
            "sum the value column of expensescsv"
        );
        assert_eq!(derive_capability_name("   "), "unspecified capability");
    }

    #[tokio::test]
    async fn test_degrades_on_malformed_reply() {
        use crate::llm::ScriptedLlmProvider;
        let provider = Arc::new(ScriptedLlmProvider::new(["not json at all"]));
        let assessor = GapAssessor::new(provider, PromptManager::embedded_only("v1"));
        let request = CapabilityRequest::new("organize my downloads folder", vec![]);
        let outcome = assessor.assess(&request).await;
        assert!(outcome.degraded);
        assert!(!outcome.assessment.can_handle);
        assert_eq!(outcome.assessment.confidence, 0.1);
        assert!(outcome
            .assessment
            .missing_capability
            .contains("organize my downloads"));
    }
}
