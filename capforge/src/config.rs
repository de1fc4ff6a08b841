//! Engine configuration.
//!
//! One aggregate [`EngineConfig`] is built explicitly (TOML file or code) and
//! handed to [`crate::engine::SynthesisEngine::new`]. Components receive the
//! sections they need from their constructors; nothing reads configuration
//! from global state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::llm::LlmProviderType;

/// Top-level configuration for the synthesis engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    pub synthesis: SynthesisConfig,
    pub sandbox: SandboxConfig,
    pub security: SecurityPolicyConfig,
    pub registry: RegistryConfig,
    pub audit: AuditConfig,
    pub prompts: PromptConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file. Missing sections and fields fall
    /// back to their defaults, so a partial file is fine.
    pub fn from_toml_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }
}

/// Reasoning-service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider type (stub, openai, anthropic).
    pub provider_type: LlmProviderType,
    /// Model name/identifier.
    pub model: String,
    /// Environment variable holding the API key. The key itself is never
    /// written into config files.
    pub api_key_env: Option<String>,
    /// Base URL override (OpenAI-compatible gateways, self-hosted endpoints).
    pub base_url: Option<String>,
    /// Maximum tokens per completion.
    pub max_tokens: Option<u32>,
    /// Temperature for generation (0.0 = deterministic).
    pub temperature: Option<f64>,
    /// Per-request HTTP timeout in seconds.
    pub timeout_seconds: Option<u64>,
    /// Transient-failure retry configuration.
    pub retry: RetryConfig,
}

/// Retry configuration for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    /// Backoff between attempts, doubled each retry.
    pub backoff_ms: u64,
}

/// Synthesis loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Hard bound on synthesis iterations per request.
    pub max_iterations: u32,
    /// Fraction of tests that must pass, in [0, 1]. Critical tests must
    /// pass regardless of this value.
    pub acceptance_threshold: f64,
    /// Wall-clock timeout for a single test case.
    pub per_test_timeout_ms: u64,
    /// Deadline for the whole suite; tests not started by then are failed
    /// as timed out.
    pub suite_timeout_ms: u64,
}

/// How sandbox processes are isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Use bubblewrap when it is on PATH, fall back to a plain process in
    /// its own session otherwise.
    Auto,
    /// Require bubblewrap; fail sandbox construction when missing.
    Bubblewrap,
    /// Plain subprocess only. Weaker isolation; relies on the effect audit.
    Process,
}

/// Sandbox runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub isolation: IsolationMode,
    /// Interpreter used to run generated modules.
    pub python_bin: String,
    /// RSS limit applied to the sandboxed process.
    pub memory_mb: u64,
    /// CPU-seconds limit applied to the sandboxed process.
    pub cpu_seconds: u64,
    /// Process-count limit inside the sandbox.
    pub max_processes: u64,
    /// Whether the sandbox gets network access. Off by default.
    pub network_enabled: bool,
    /// Cap on bytes collected per output file.
    pub max_output_bytes: u64,
}

/// Security gate policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicyConfig {
    /// Regex patterns whose presence in module source flags it pre-execution.
    pub blocked_patterns: Vec<String>,
    /// Directory roots the module may write under (sandbox paths).
    pub allowed_write_roots: Vec<String>,
    /// External commands the module may invoke. Empty means none.
    pub allowed_commands: Vec<String>,
    /// Hosts the module may connect to. Empty means no network effects pass.
    pub allowed_hosts: Vec<String>,
    /// Capability-name vocabulary that refuses synthesis outright.
    pub high_risk_terms: Vec<String>,
}

/// Capability registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding one subdirectory per registered capability.
    pub root_dir: PathBuf,
}

/// Audit ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// SQLite database path. `None` keeps the ledger purely in memory.
    pub db_path: Option<PathBuf>,
}

/// Prompt asset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Prompt asset directory. `None` uses the embedded defaults only.
    pub dir: Option<PathBuf>,
    /// Prompt version subdirectory to load.
    pub version: String,
}

pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    r"subprocess\.",
    r"os\.system\(",
    r"os\.popen\(",
    r"os\.exec",
    r"\bexec\(",
    r"\beval\(",
    r"__import__\(",
    r"pickle\.loads?",
    r"\bctypes\b",
    r"shutil\.rmtree\(",
    r"importlib\.",
];

pub const DEFAULT_HIGH_RISK_TERMS: &[&str] = &[
    "password",
    "credential",
    "keylog",
    "payment",
    "bank transfer",
    "sudo",
    "privilege",
    "escalat",
];

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider_type: LlmProviderType::Stub,
            model: "stub-model".to_string(),
            api_key_env: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            timeout_seconds: Some(60),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 500,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            acceptance_threshold: 1.0,
            per_test_timeout_ms: 10_000,
            suite_timeout_ms: 60_000,
        }
    }
}

impl Default for IsolationMode {
    fn default() -> Self {
        IsolationMode::Auto
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::Auto,
            python_bin: "python3".to_string(),
            memory_mb: 512,
            cpu_seconds: 30,
            max_processes: 16,
            network_enabled: false,
            max_output_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for SecurityPolicyConfig {
    fn default() -> Self {
        Self {
            blocked_patterns: DEFAULT_BLOCKED_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_write_roots: vec!["/workspace".to_string()],
            allowed_commands: Vec::new(),
            allowed_hosts: Vec::new(),
            high_risk_terms: DEFAULT_HIGH_RISK_TERMS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("capability_registry"),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { db_path: None }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from("assets/prompts")),
            version: "v1".to_string(),
        }
    }
}
