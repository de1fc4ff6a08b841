//! Core data model for the capability synthesis pipeline.
//!
//! Everything that flows between the assessor, synthesizer, sandbox harness,
//! security gate and registry is defined here so the stage boundaries stay
//! serializable and auditable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user request the host assistant could not satisfy with its current
/// action set. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub id: Uuid,
    /// The raw request text, verbatim.
    pub text: String,
    /// Identifiers of actions the host already exposes, in the order the
    /// host advertises them.
    #[serde(default)]
    pub available_actions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl CapabilityRequest {
    pub fn new(text: impl Into<String>, available_actions: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            available_actions,
            created_at: Utc::now(),
        }
    }
}

/// Estimated implementation complexity reported by the assessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Default for Complexity {
    fn default() -> Self {
        Complexity::Medium
    }
}

/// Outcome of the capability gap assessment.
///
/// Produced once per request and read-only afterwards. When the reasoning
/// service returns something unparseable the engine degrades to
/// [`CapabilityAssessment::conservative`] instead of failing the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityAssessment {
    /// True when the existing action set already covers the request.
    pub can_handle: bool,
    /// Assessor confidence, clamped to [0, 1].
    pub confidence: f64,
    /// Short name of the capability that is missing (empty when none).
    pub missing_capability: String,
    /// Operations the synthesized module must expose.
    #[serde(default)]
    pub required_operations: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    /// Rough size estimate for the generated module.
    #[serde(default)]
    pub estimated_lines: u32,
}

impl CapabilityAssessment {
    /// Fallback assessment used when the assessor reply is malformed:
    /// assume a gap exists but with low confidence, so the pipeline proceeds
    /// rather than silently claiming the request is already handled.
    pub fn conservative(missing_capability: impl Into<String>) -> Self {
        Self {
            can_handle: false,
            confidence: 0.1,
            missing_capability: missing_capability.into(),
            required_operations: Vec::new(),
            complexity: Complexity::Medium,
            estimated_lines: 0,
        }
    }

    pub fn clamped(mut self) -> Self {
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// Functional category of a synthesized module. Drives prompt selection and
/// the edge cases the test harness generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Spreadsheet,
    FileManagement,
    TextProcessing,
    Custom,
}

impl Category {
    /// Infer a category from free text (capability name plus operations).
    /// Keyword-based on purpose; anything unrecognized lands in `Custom`.
    pub fn infer(text: &str) -> Self {
        let lower = text.to_lowercase();
        const SPREADSHEET: &[&str] = &[
            "spreadsheet",
            "csv",
            "excel",
            "xlsx",
            "worksheet",
            "cell",
            "column",
            "row",
            "tabular",
        ];
        const FILES: &[&str] = &[
            "file",
            "folder",
            "directory",
            "organize",
            "rename",
            "archive",
            "cleanup",
            "dedupl",
        ];
        const TEXT: &[&str] = &[
            "text",
            "parse",
            "extract",
            "summar",
            "markdown",
            "regex",
            "format",
            "translat",
        ];
        if SPREADSHEET.iter().any(|k| lower.contains(k)) {
            Category::Spreadsheet
        } else if FILES.iter().any(|k| lower.contains(k)) {
            Category::FileManagement
        } else if TEXT.iter().any(|k| lower.contains(k)) {
            Category::TextProcessing
        } else {
            Category::Custom
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Spreadsheet => "spreadsheet",
            Category::FileManagement => "file_management",
            Category::TextProcessing => "text_processing",
            Category::Custom => "custom",
        }
    }

    /// Inverse of [`Category::as_str`], for CLI arguments.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "spreadsheet" => Some(Category::Spreadsheet),
            "file_management" => Some(Category::FileManagement),
            "text_processing" => Some(Category::TextProcessing),
            "custom" => Some(Category::Custom),
            _ => None,
        }
    }
}

/// A Python tool module produced by one synthesis iteration.
///
/// Owned by the iteration that created it; acceptance moves a copy into the
/// registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedModule {
    /// Stable module identifier, e.g. `spreadsheet_analyzer_1a2b3c4d`.
    pub module_name: String,
    /// Full Python source text.
    pub source_code: String,
    pub category: Category,
    /// 1-based iteration that produced this module.
    pub iteration: u32,
}

/// What the harness requires of a test call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// The call must return without raising.
    Completes,
    /// The call may raise a normal exception but must not hang, exit the
    /// interpreter or crash the driver.
    HandlesGracefully,
}

/// A single synthetic test the harness runs against a generated module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub description: String,
    /// Method invoked on the capability class.
    pub operation: String,
    /// Positional arguments, JSON-encoded for the driver.
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    /// Keyword arguments, JSON-encoded for the driver.
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub expectation: Expectation,
    /// Critical tests must pass for the suite to succeed regardless of the
    /// acceptance threshold. The smoke test is always critical.
    pub critical: bool,
    /// True for harness-generated tests (currently all of them).
    #[serde(default)]
    pub autogenerated: bool,
}

/// Outcome of one test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub case_name: String,
    pub critical: bool,
    pub passed: bool,
    /// Captured stdout plus the returned value rendering, if any.
    pub output: String,
    /// Error text when the test failed (exception trace, timeout note).
    pub error: String,
    pub duration_ms: u64,
}

/// Aggregated outcome of a full test suite run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// True iff the pass rate met the acceptance threshold AND every
    /// critical test passed. Functional verdict only; security flags are
    /// judged separately and override this.
    pub overall_success: bool,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    pub fn from_results(results: Vec<TestResult>, acceptance_threshold: f64) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = total - passed;
        let criticals_ok = results.iter().filter(|r| r.critical).all(|r| r.passed);
        let rate = if total == 0 {
            0.0
        } else {
            passed as f64 / total as f64
        };
        let overall_success = total > 0 && rate >= acceptance_threshold && criticals_ok;
        Self {
            total,
            passed,
            failed,
            overall_success,
            results,
        }
    }

    /// A suite that never ran its tests because the module could not be
    /// loaded or instantiated. Counts as a single failed critical result.
    pub fn failed_probe(phase: &str, error: impl Into<String>) -> Self {
        let result = TestResult {
            case_name: format!("module_{}", phase),
            critical: true,
            passed: false,
            output: String::new(),
            error: error.into(),
            duration_ms: 0,
        };
        Self {
            total: 1,
            passed: 0,
            failed: 1,
            overall_success: false,
            results: vec![result],
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }

    /// Compact failure summary fed back into the next synthesis prompt.
    pub fn failure_digest(&self) -> String {
        let mut lines = Vec::new();
        for r in self.results.iter().filter(|r| !r.passed) {
            let error = if r.error.is_empty() {
                "failed without error output"
            } else {
                r.error.as_str()
            };
            lines.push(format!("- {}: {}", r.case_name, error));
        }
        lines.join("\n")
    }
}

/// Verdict of one security gate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum SecurityVerdict {
    Clean,
    Flagged(String),
}

impl SecurityVerdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, SecurityVerdict::Clean)
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            SecurityVerdict::Clean => None,
            SecurityVerdict::Flagged(detail) => Some(detail),
        }
    }
}

/// Taxonomy of pipeline failures. Each variant maps to a distinct handling
/// path in the iteration controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Assessor reply was unparseable; the engine degraded to a
    /// conservative default and continued.
    AssessmentMalformed,
    /// Provider error or output with no recognizable module. The harness is
    /// skipped; the attempt still consumes an iteration.
    SynthesisFailed,
    /// Module text did not compile or import inside the sandbox.
    LoadFailure,
    /// Module loaded but the capability class could not be constructed.
    InstantiationFailure,
    /// Suite ran and did not meet the acceptance criteria.
    TestFailure,
    /// A security check flagged the module. Overrides any test outcome.
    SecurityFlagged,
    /// The iteration bound was exhausted without an accepted module.
    IterationExhausted,
    /// The caller cancelled the request mid-flight.
    Cancelled,
    /// Engine-side fault outside the module's control, e.g. the sandbox
    /// could not start or the registry could not persist an accepted module.
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::AssessmentMalformed => "assessment_malformed",
            FailureKind::SynthesisFailed => "synthesis_failed",
            FailureKind::LoadFailure => "load_failure",
            FailureKind::InstantiationFailure => "instantiation_failure",
            FailureKind::TestFailure => "test_failure",
            FailureKind::SecurityFlagged => "security_flagged",
            FailureKind::IterationExhausted => "iteration_exhausted",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that happened in one pass of the synthesis loop. Records are
/// append-only: the controller pushes one per iteration and never edits
/// earlier entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based, strictly increasing, never exceeds the configured bound.
    pub index: u32,
    /// Assessment snapshot the iteration worked from.
    pub assessment: CapabilityAssessment,
    /// Missing when synthesis itself failed.
    pub module: Option<GeneratedModule>,
    pub precheck: Option<SecurityVerdict>,
    pub suite: Option<TestSuiteResult>,
    pub postcheck: Option<SecurityVerdict>,
    pub accepted: bool,
    pub failure: Option<FailureKind>,
    /// Diagnostics carried verbatim into the next iteration's prompt.
    pub feedback: String,
}

/// Final outcome of a capability request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The host's existing actions already cover the request.
    AlreadyCapable,
    /// A previously registered capability matched; no synthesis ran.
    Reused { capability: String },
    /// A new capability passed tests and both security checks.
    Integrated {
        capability: String,
        iterations_used: u32,
    },
    /// No acceptable capability was produced.
    Failed {
        #[serde(rename = "failure")]
        kind: FailureKind,
        detail: String,
    },
}

/// Structured response returned for every request. The engine never
/// propagates internal errors past this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub request_id: Uuid,
    pub outcome: Outcome,
    /// Natural-language summary suitable for showing the user.
    pub message: String,
    pub assessment: Option<CapabilityAssessment>,
    pub iterations: Vec<IterationRecord>,
}

impl EngineResponse {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.outcome,
            Outcome::AlreadyCapable | Outcome::Reused { .. } | Outcome::Integrated { .. }
        )
    }
}

/// An accepted capability as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    /// Registry key: the normalized missing-capability name.
    pub name: String,
    pub module: GeneratedModule,
    /// The request text that led to this capability.
    pub request_text: String,
    /// Iterations the synthesis loop needed before acceptance.
    pub iterations_used: u32,
    pub registered_at: DateTime<Utc>,
    /// sha-256 of the module source, hex-encoded. Provenance anchor for the
    /// audit trail.
    pub content_hash: String,
}
