//! Deterministic providers: a keyword-driven stub for offline runs and a
//! scripted provider for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{sha256_hex, LlmCompletion, LlmProvider, LlmProviderConfig, LlmProviderInfo};
use crate::error::{EngineError, EngineResult};

const STUB_SPREADSHEET_MODULE: &str = r#"Here is the module:

```python
import csv


class SpreadsheetTools:
    """Small CSV analysis helper."""

    def sum_column(self, csv_path, column):
        total = 0.0
        with open(csv_path, newline="") as handle:
            reader = csv.DictReader(handle)
            if reader.fieldnames is None or column not in reader.fieldnames:
                raise ValueError("unknown column: %s" % column)
            for row in reader:
                value = row.get(column)
                if value is None or value == "":
                    continue
                total += float(value)
        return total

    def average_column(self, csv_path, column):
        total = 0.0
        count = 0
        with open(csv_path, newline="") as handle:
            reader = csv.DictReader(handle)
            if reader.fieldnames is None or column not in reader.fieldnames:
                raise ValueError("unknown column: %s" % column)
            for row in reader:
                value = row.get(column)
                if value is None or value == "":
                    continue
                total += float(value)
                count += 1
        if count == 0:
            raise ValueError("no numeric rows in column: %s" % column)
        return total / count

    def count_rows(self, csv_path):
        with open(csv_path, newline="") as handle:
            reader = csv.reader(handle)
            rows = sum(1 for _ in reader)
        return max(rows - 1, 0)
```
"#;

const STUB_FILE_MODULE: &str = r#"```python
import os


class FileOrganizer:
    """Groups directory entries by extension."""

    def organize_by_extension(self, directory):
        if not os.path.isdir(directory):
            raise ValueError("not a directory: %s" % directory)
        groups = {}
        for name in sorted(os.listdir(directory)):
            path = os.path.join(directory, name)
            if not os.path.isfile(path):
                continue
            ext = os.path.splitext(name)[1].lstrip(".").lower() or "none"
            groups.setdefault(ext, []).append(name)
        return groups

    def list_files(self, directory):
        if not os.path.isdir(directory):
            raise ValueError("not a directory: %s" % directory)
        return sorted(
            name
            for name in os.listdir(directory)
            if os.path.isfile(os.path.join(directory, name))
        )
```
"#;

const STUB_TEXT_MODULE: &str = r#"```python
class TextSummarizer:
    """Trims text down to its leading sentences."""

    def summarize(self, text_path, max_sentences=3):
        with open(text_path) as handle:
            text = handle.read()
        sentences = [s.strip() for s in text.replace("\n", " ").split(".") if s.strip()]
        return ". ".join(sentences[:max_sentences])

    def word_count(self, text_path):
        with open(text_path) as handle:
            return len(handle.read().split())
```
"#;

const STUB_CUSTOM_MODULE: &str = r#"```python
class TaskRunner:
    """Fallback capability: echoes a structured acknowledgment."""

    def run(self, task_text):
        if not isinstance(task_text, str):
            raise ValueError("task text must be a string")
        return {"task": task_text, "status": "acknowledged"}
```
"#;

/// Keyword-deterministic provider. Lets the whole pipeline run offline:
/// assessment prompts get a plausible JSON verdict, synthesis prompts get a
/// canned module for the matching category.
pub struct StubLlmProvider {
    config: LlmProviderConfig,
}

impl StubLlmProvider {
    pub fn new(config: LlmProviderConfig) -> Self {
        Self { config }
    }

    fn respond(&self, prompt: &str) -> String {
        let lower = prompt.to_lowercase();
        if prompt.contains("\"can_handle\"") {
            return Self::stub_assessment(&lower);
        }
        Self::stub_module(&lower).to_string()
    }

    fn stub_assessment(lower_prompt: &str) -> String {
        let (capability, operations) = if lower_prompt.contains("spreadsheet")
            || lower_prompt.contains("csv")
        {
            (
                "spreadsheet analysis",
                r#"["sum_column", "average_column", "count_rows"]"#,
            )
        } else if lower_prompt.contains("file") || lower_prompt.contains("folder") {
            (
                "file organization",
                r#"["organize_by_extension", "list_files"]"#,
            )
        } else if lower_prompt.contains("summar") || lower_prompt.contains("text") {
            ("text summarization", r#"["summarize", "word_count"]"#)
        } else {
            ("custom automation", r#"["run"]"#)
        };
        format!(
            r#"{{
  "can_handle": false,
  "confidence": 0.85,
  "missing_capability": "{}",
  "required_operations": {},
  "complexity": "low",
  "estimated_lines": 40
}}"#,
            capability, operations
        )
    }

    fn stub_module(lower_prompt: &str) -> &'static str {
        if lower_prompt.contains("spreadsheet") || lower_prompt.contains("csv") {
            STUB_SPREADSHEET_MODULE
        } else if lower_prompt.contains("file") || lower_prompt.contains("folder") {
            STUB_FILE_MODULE
        } else if lower_prompt.contains("summar") || lower_prompt.contains("text") {
            STUB_TEXT_MODULE
        } else {
            STUB_CUSTOM_MODULE
        }
    }
}

#[async_trait]
impl LlmProvider for StubLlmProvider {
    async fn generate(&self, prompt: &str) -> EngineResult<LlmCompletion> {
        let content = self.respond(prompt);
        Ok(LlmCompletion {
            prompt_hash: sha256_hex(prompt.as_bytes()),
            response_hash: sha256_hex(content.as_bytes()),
            content,
            prompt_tokens: None,
            completion_tokens: None,
            latency_ms: 0,
        })
    }

    fn get_info(&self) -> LlmProviderInfo {
        LlmProviderInfo {
            name: "stub".to_string(),
            model: self.config.model.clone(),
        }
    }
}

/// Replays a fixed sequence of responses and records every prompt it saw.
/// Only meaningful in tests; lives here so integration tests can use it.
pub struct ScriptedLlmProvider {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmProvider {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts submitted so far, in order.
    pub fn seen_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlmProvider {
    async fn generate(&self, prompt: &str) -> EngineResult<LlmCompletion> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        match next {
            Some(content) => Ok(LlmCompletion {
                prompt_hash: sha256_hex(prompt.as_bytes()),
                response_hash: sha256_hex(content.as_bytes()),
                content,
                prompt_tokens: None,
                completion_tokens: None,
                latency_ms: 0,
            }),
            None => Err(EngineError::Provider(
                "scripted provider exhausted".to_string(),
            )),
        }
    }

    fn get_info(&self) -> LlmProviderInfo {
        LlmProviderInfo {
            name: "scripted".to_string(),
            model: "scripted".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::llm::LlmProviderType;

    fn stub() -> StubLlmProvider {
        StubLlmProvider::new(LlmProviderConfig {
            provider_type: LlmProviderType::Stub,
            model: "stub-model".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            timeout_seconds: None,
            retry: RetryConfig::default(),
        })
    }

    #[tokio::test]
    async fn test_stub_assessment_shape() {
        let provider = stub();
        let reply = provider
            .generate_text("Assess the gap. Respond with JSON: {\"can_handle\": ...} Request: sum a csv column")
            .await
            .unwrap();
        assert!(reply.contains("\"can_handle\": false"));
        assert!(reply.contains("spreadsheet analysis"));
    }

    #[tokio::test]
    async fn test_stub_module_matches_keywords() {
        let provider = stub();
        let reply = provider
            .generate_text("Generate a Python module for: organize files by extension")
            .await
            .unwrap();
        assert!(reply.contains("class FileOrganizer"));
    }

    #[tokio::test]
    async fn test_scripted_provider_replays_and_records() {
        let provider = ScriptedLlmProvider::new(["first", "second"]);
        assert_eq!(provider.generate_text("a").await.unwrap(), "first");
        assert_eq!(provider.generate_text("b").await.unwrap(), "second");
        assert!(provider.generate_text("c").await.is_err());
        assert_eq!(provider.seen_prompts(), vec!["a", "b", "c"]);
    }
}
