//! Engine-internal error type.
//!
//! `EngineError` is used between components; it never crosses the public
//! [`crate::engine::SynthesisEngine::handle_request`] boundary, which maps
//! every fault into a structured [`crate::types::EngineResponse`].

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Reasoning-service call failed (transport, auth, malformed payload).
    #[error("llm provider error: {0}")]
    Provider(String),

    /// Prompt asset could not be loaded or rendered.
    #[error("prompt error: {0}")]
    Prompt(String),

    /// The sandbox runtime itself broke (spawn failure, missing interpreter).
    /// Failures of the code under test are reported in results, not here.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Capability registry persistence failed.
    #[error("registry error: {0}")]
    Registry(String),

    /// Audit ledger append or verification failed.
    #[error("audit log error: {0}")]
    Audit(String),

    /// Bad or unloadable configuration.
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
