//! Progress reporting for long-running synthesis.
//!
//! The engine emits one event per stage transition; sinks decide what to do
//! with them. The default sink writes tracing logs, the memory sink records
//! events for assertions in tests.

use std::sync::Mutex;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Assessed,
    ReuseFound,
    IterationStarted,
    ModuleSynthesized,
    PrecheckComplete,
    SuiteComplete,
    PostcheckComplete,
    IterationFailed,
    Integrated,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Assessed => "assessed",
            Stage::ReuseFound => "reuse_found",
            Stage::IterationStarted => "iteration_started",
            Stage::ModuleSynthesized => "module_synthesized",
            Stage::PrecheckComplete => "precheck_complete",
            Stage::SuiteComplete => "suite_complete",
            Stage::PostcheckComplete => "postcheck_complete",
            Stage::IterationFailed => "iteration_failed",
            Stage::Integrated => "integrated",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub request_id: Uuid,
    pub stage: Stage,
    /// Short human-readable line.
    pub summary: String,
    /// Extra context, e.g. a failure digest.
    pub detail: Option<String>,
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Sink that forwards every event to the tracing subscriber.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_event(&self, event: &ProgressEvent) {
        match &event.detail {
            Some(detail) => tracing::info!(
                request_id = %event.request_id,
                stage = event.stage.as_str(),
                detail = %detail,
                "{}",
                event.summary
            ),
            None => tracing::info!(
                request_id = %event.request_id,
                stage = event.stage.as_str(),
                "{}",
                event.summary
            ),
        }
    }
}

/// Sink that drops everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Sink that keeps events in memory, for tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.events.lock().unwrap().iter().map(|e| e.stage).collect()
    }
}

impl ProgressSink for MemorySink {
    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        let request_id = Uuid::new_v4();
        for (stage, summary) in [
            (Stage::Received, "request received"),
            (Stage::Assessed, "gap found"),
            (Stage::Integrated, "capability registered"),
        ] {
            sink.on_event(&ProgressEvent {
                request_id,
                stage,
                summary: summary.to_string(),
                detail: None,
            });
        }
        assert_eq!(
            sink.stages(),
            vec![Stage::Received, Stage::Assessed, Stage::Integrated]
        );
        assert_eq!(sink.events()[1].summary, "gap found");
    }
}
