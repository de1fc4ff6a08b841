// Capforge
// Self-extension engine for a desktop assistant: assesses capability gaps,
// synthesizes Python tool modules, tests them in an isolated sandbox, gates
// them for safety and registers the survivors for reuse.

pub mod assessor;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod progress;
pub mod prompt;
pub mod registry;
pub mod sandbox;
pub mod security;
pub mod synthesizer;
pub mod types;

// Re-export the request-to-response surface
pub use crate::config::EngineConfig;
pub use crate::engine::{engine_from_config, CancellationToken, SynthesisEngine};
pub use crate::error::{EngineError, EngineResult};
pub use crate::types::{CapabilityRequest, EngineResponse, FailureKind, Outcome};
