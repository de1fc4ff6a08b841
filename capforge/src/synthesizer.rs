//! Tool synthesis.
//!
//! Builds category-specific prompts, carries failure history from earlier
//! iterations verbatim, and extracts a Python module from the reply. A reply
//! with no recognizable module is a synthesis failure, which the controller
//! counts against the iteration budget without running the harness.

use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::LlmProvider;
use crate::prompt::{FilePromptStore, PromptManager};
use crate::types::{CapabilityAssessment, CapabilityRequest, Category, GeneratedModule};

/// Rules every generated module must follow, shared by all categories and
/// mirrored by the harness's calling conventions.
const MODULE_CONTRACT: &str = r#"
Rules for the module:
- Define exactly one top-level class; its constructor takes no arguments.
- Expose one method per required operation, named exactly as listed.
- Methods that work on a file or directory take its path as the first
  positional argument. Spreadsheet column operations take (csv_path,
  column_name).
- Raise ValueError for invalid or missing input instead of crashing.
- Plain Python standard library only. No subprocess, eval, exec, pickle,
  ctypes or network access.
- Only read and write paths inside the working directory.

Respond with a single ```python code block containing the full module and
nothing else.
"#;

/// A prior failed iteration, carried into the next prompt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// 1-based iteration that failed.
    pub iteration: u32,
    /// The failed module source; `None` when synthesis produced no module.
    pub code: Option<String>,
    /// Diagnostics, verbatim.
    pub error: String,
    /// Targeted fix guidance from the failure classifier.
    pub guidance: Option<String>,
}

/// Input for one synthesis attempt.
#[derive(Debug, Clone)]
pub struct SynthesisContext<'a> {
    pub request: &'a CapabilityRequest,
    pub assessment: &'a CapabilityAssessment,
    pub category: Category,
    /// 1-based iteration this attempt belongs to.
    pub iteration: u32,
    pub prior_attempts: &'a [AttemptContext],
}

#[derive(Debug, Clone)]
pub enum SynthesisOutcome {
    Module(GeneratedModule),
    /// Provider error or output with no recognizable module.
    Failed { reason: String },
}

pub struct ToolSynthesizer {
    provider: Arc<dyn LlmProvider>,
    prompts: PromptManager<FilePromptStore>,
}

impl ToolSynthesizer {
    pub fn new(provider: Arc<dyn LlmProvider>, prompts: PromptManager<FilePromptStore>) -> Self {
        Self { provider, prompts }
    }

    /// Run one synthesis attempt. Infallible like the assessor: provider
    /// faults become `SynthesisOutcome::Failed`.
    pub async fn synthesize(&self, ctx: &SynthesisContext<'_>) -> SynthesisOutcome {
        let prompt = self.build_prompt(ctx);
        let reply = match self.provider.generate(&prompt).await {
            Ok(completion) => {
                tracing::debug!(
                    iteration = ctx.iteration,
                    prompt_hash = %completion.prompt_hash,
                    response_hash = %completion.response_hash,
                    latency_ms = completion.latency_ms,
                    "synthesis completion received"
                );
                completion.content
            }
            Err(e) => {
                return SynthesisOutcome::Failed {
                    reason: format!("provider call failed: {}", e),
                }
            }
        };

        match extract_module_source(&reply) {
            Some(source_code) => SynthesisOutcome::Module(GeneratedModule {
                module_name: module_name(&ctx.assessment.missing_capability),
                source_code,
                category: ctx.category,
                iteration: ctx.iteration,
            }),
            None => SynthesisOutcome::Failed {
                reason: if reply.trim().is_empty() {
                    "provider returned empty output".to_string()
                } else {
                    "reply contained no Python class definition".to_string()
                },
            },
        }
    }

    fn build_prompt(&self, ctx: &SynthesisContext<'_>) -> String {
        let operations = if ctx.assessment.required_operations.is_empty() {
            default_operations(ctx.category).join(", ")
        } else {
            ctx.assessment.required_operations.join(", ")
        };

        let mut vars = HashMap::new();
        vars.insert("request".to_string(), ctx.request.text.clone());
        vars.insert(
            "capability".to_string(),
            ctx.assessment.missing_capability.clone(),
        );
        vars.insert("operations".to_string(), operations);

        let fallback = format!("{}\n{}", category_intro(ctx.category), MODULE_CONTRACT);
        let mut prompt = self
            .prompts
            .render_or(prompt_id(ctx.category), &vars, &fallback);

        if !ctx.prior_attempts.is_empty() {
            prompt.push_str(
                "\nYou previously attempted this task and failed. Review the failure \
                 history, fix the problems, and produce a corrected module.\n\n\
                 **Failure History**:\n",
            );
            for attempt in ctx.prior_attempts {
                prompt.push_str(&format!("\n--- Attempt #{} ---\n", attempt.iteration));
                match &attempt.code {
                    Some(code) => {
                        prompt.push_str(&format!("**Failed Code**:\n```python\n{}\n```\n", code));
                    }
                    None => prompt.push_str("**Failed Code**: (no module was produced)\n"),
                }
                prompt.push_str(&format!("**Error**:\n{}\n", attempt.error));
                if let Some(guidance) = &attempt.guidance {
                    prompt.push_str(&format!("**Fix guidance**: {}\n", guidance));
                }
            }
            prompt.push_str(
                "\n**Goal**: Analyze why the previous attempts failed and generate a \
                 corrected module that passes.\n",
            );
        }

        prompt
    }
}

fn prompt_id(category: Category) -> &'static str {
    match category {
        Category::Spreadsheet => "tool_spreadsheet",
        Category::FileManagement => "tool_file_management",
        Category::TextProcessing => "tool_text_processing",
        Category::Custom => "tool_custom",
    }
}

fn category_intro(category: Category) -> String {
    let domain = match category {
        Category::Spreadsheet => {
            "CSV/spreadsheet analysis. Use the csv module; treat the first row as headers."
        }
        Category::FileManagement => {
            "file and directory management. Use os/pathlib; never touch paths outside the working directory."
        }
        Category::TextProcessing => {
            "text processing. Read input files as UTF-8 text."
        }
        Category::Custom => "a small self-contained automation task.",
    };
    format!(
        "Generate a Python tool module for {}\n\n\
         **Capability to provide**: {{capability}}\n\
         **User request**: {{request}}\n\
         **Required operations**: {{operations}}\n",
        domain
    )
}

/// Operations assumed when the assessment named none.
pub(crate) fn default_operations(category: Category) -> Vec<String> {
    let ops: &[&str] = match category {
        Category::Spreadsheet => &["sum_column", "average_column", "count_rows"],
        Category::FileManagement => &["organize_by_extension", "list_files"],
        Category::TextProcessing => &["summarize", "word_count"],
        Category::Custom => &["run"],
    };
    ops.iter().map(|s| s.to_string()).collect()
}

/// Pull the module source out of a reply that may wrap it in markdown
/// fences or prose. Returns None when nothing that looks like a Python
/// class survives.
fn extract_module_source(reply: &str) -> Option<String> {
    let body = if reply.contains("```python") {
        reply
            .split("```python")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(reply)
    } else if reply.contains("```") {
        let inner = reply.split("```").nth(1).unwrap_or(reply);
        // A bare fence may open with a language tag line.
        match inner.split_once('\n') {
            Some((first, rest)) if matches!(first.trim(), "python" | "py") => rest,
            _ => inner,
        }
    } else {
        reply
    };
    let code = body.trim();
    if code.is_empty() || !code.contains("class ") {
        return None;
    }
    Some(code.to_string())
}

/// Stable module identifier: slug of the capability name plus a short
/// content hash, e.g. `spreadsheet_analysis_1a2b3c4d`.
pub(crate) fn module_name(capability: &str) -> String {
    let slug = slugify(capability);
    format!("{}_{:08x}", slug, fnv1a64(capability) as u32)
}

/// Lowercased identifier-safe slug, collapsed and truncated.
pub(crate) fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut slug = String::new();
    let mut last_was_sep = true;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    let trimmed: String = slug.trim_matches('_').chars().take(40).collect();
    let trimmed = trimmed.trim_end_matches('_').to_string();
    if trimmed.is_empty() {
        "capability".to_string()
    } else {
        trimmed
    }
}

pub(crate) fn fnv1a64(s: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for b in s.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmProvider;
    use crate::types::Complexity;

    fn assessment(capability: &str, ops: &[&str]) -> CapabilityAssessment {
        CapabilityAssessment {
            can_handle: false,
            confidence: 0.9,
            missing_capability: capability.to_string(),
            required_operations: ops.iter().map(|s| s.to_string()).collect(),
            complexity: Complexity::Low,
            estimated_lines: 30,
        }
    }

    fn synthesizer(responses: &[&str]) -> ToolSynthesizer {
        ToolSynthesizer::new(
            Arc::new(ScriptedLlmProvider::new(responses.iter().copied())),
            PromptManager::embedded_only("v1"),
        )
    }

    #[test]
    fn test_extract_fenced_module() {
        let reply = "Here you go:\n```python\nclass Foo:\n    pass\n```\nEnjoy.";
        assert_eq!(
            extract_module_source(reply).unwrap(),
            "class Foo:\n    pass"
        );
    }

    #[test]
    fn test_extract_bare_fence_with_language_tag() {
        let reply = "```\npython\nclass Foo:\n    pass\n```";
        let code = extract_module_source(reply).unwrap();
        assert!(code.starts_with("class Foo"));
    }

    #[test]
    fn test_extract_rejects_empty_and_prose() {
        assert!(extract_module_source("").is_none());
        assert!(extract_module_source("I am unable to help with that.").is_none());
        assert!(extract_module_source("```python\n\n```").is_none());
    }

    #[test]
    fn test_module_name_is_slug_plus_hash() {
        let name = module_name("Spreadsheet Analysis!");
        assert!(name.starts_with("spreadsheet_analysis_"));
        let suffix = name.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
        // Stable for the same capability.
        assert_eq!(name, module_name("Spreadsheet Analysis!"));
    }

    #[tokio::test]
    async fn test_empty_reply_is_synthesis_failure() {
        let synth = synthesizer(&[""]);
        let request = CapabilityRequest::new("sum csv", vec![]);
        let a = assessment("spreadsheet analysis", &["sum_column"]);
        let ctx = SynthesisContext {
            request: &request,
            assessment: &a,
            category: Category::Spreadsheet,
            iteration: 1,
            prior_attempts: &[],
        };
        match synth.synthesize(&ctx).await {
            SynthesisOutcome::Failed { reason } => {
                assert!(reason.contains("empty output"));
            }
            SynthesisOutcome::Module(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_prompt_carries_failure_history() {
        let synth = synthesizer(&["```python\nclass Foo:\n    pass\n```"]);
        let request = CapabilityRequest::new("sum csv", vec![]);
        let a = assessment("spreadsheet analysis", &["sum_column"]);
        let attempts = vec![AttemptContext {
            iteration: 1,
            code: Some("class Broken:\n    pass".to_string()),
            error: "- smoke: AttributeError: no sum_column".to_string(),
            guidance: Some("Expose one method per required operation.".to_string()),
        }];
        let ctx = SynthesisContext {
            request: &request,
            assessment: &a,
            category: Category::Spreadsheet,
            iteration: 2,
            prior_attempts: &attempts,
        };
        let prompt = synth.build_prompt(&ctx);
        assert!(prompt.contains("--- Attempt #1 ---"));
        assert!(prompt.contains("class Broken"));
        assert!(prompt.contains("AttributeError: no sum_column"));
        assert!(prompt.contains("**Fix guidance**"));
        assert!(prompt.contains("sum_column"));
    }

    #[tokio::test]
    async fn test_successful_extraction_builds_module() {
        let synth = synthesizer(&["```python\nclass Tool:\n    def sum_column(self, p, c):\n        return 0\n```"]);
        let request = CapabilityRequest::new("sum csv", vec![]);
        let a = assessment("spreadsheet analysis", &["sum_column"]);
        let ctx = SynthesisContext {
            request: &request,
            assessment: &a,
            category: Category::Spreadsheet,
            iteration: 1,
            prior_attempts: &[],
        };
        match synth.synthesize(&ctx).await {
            SynthesisOutcome::Module(module) => {
                assert!(module.module_name.starts_with("spreadsheet_analysis_"));
                assert!(module.source_code.contains("def sum_column"));
                assert_eq!(module.iteration, 1);
            }
            SynthesisOutcome::Failed { reason } => panic!("unexpected failure: {}", reason),
        }
    }
}
