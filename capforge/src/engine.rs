//! The synthesis engine: assessment, bounded synthesize/test/gate loop,
//! and integration into the registry.
//!
//! `handle_request` is the single entry point and never propagates an
//! internal error; every path ends in a structured [`EngineResponse`].
//! Security verdicts override test outcomes, each failed attempt's
//! diagnostics feed the next prompt, and every stage transition lands in
//! the audit trail and on the progress sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{error, warn};

use crate::assessor::{derive_capability_name, GapAssessor};
use crate::audit::{AuditLog, AuditStage};
use crate::config::{EngineConfig, PromptConfig};
use crate::error::EngineResult;
use crate::llm::{sha256_hex, LlmProvider, LlmProviderConfig, LlmProviderFactory};
use crate::progress::{NullSink, ProgressEvent, ProgressSink, Stage};
use crate::prompt::{FilePromptStore, PromptManager};
use crate::registry::CapabilityRegistry;
use crate::sandbox::{
    classify_failure, ProcessSandbox, SandboxRuntime, SandboxTestHarness,
};
use crate::security::SecurityGate;
use crate::synthesizer::{
    default_operations, AttemptContext, SynthesisContext, SynthesisOutcome, ToolSynthesizer,
};
use crate::types::{
    CapabilityAssessment, CapabilityRecord, CapabilityRequest, Category, EngineResponse,
    FailureKind, GeneratedModule, IterationRecord, Outcome, SecurityVerdict, TestSuiteResult,
};

/// Cooperative cancellation flag, checked at stage boundaries.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct SynthesisEngine {
    config: EngineConfig,
    assessor: GapAssessor,
    synthesizer: ToolSynthesizer,
    harness: SandboxTestHarness,
    gate: SecurityGate,
    registry: Arc<CapabilityRegistry>,
    audit: Mutex<AuditLog>,
    sink: Arc<dyn ProgressSink>,
}

impl SynthesisEngine {
    /// Wire an engine from explicit parts. Tests inject scripted doubles
    /// here; `from_config` is the production path.
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn LlmProvider>,
        runtime: Arc<dyn SandboxRuntime>,
        registry: Arc<CapabilityRegistry>,
        audit: AuditLog,
        sink: Arc<dyn ProgressSink>,
    ) -> EngineResult<Self> {
        let gate = SecurityGate::new(&config.security, config.sandbox.network_enabled)?;
        let assessor = GapAssessor::new(provider.clone(), prompt_manager(&config.prompts));
        let synthesizer = ToolSynthesizer::new(provider, prompt_manager(&config.prompts));
        let harness = SandboxTestHarness::new(runtime, config.synthesis.clone());
        Ok(Self {
            config,
            assessor,
            synthesizer,
            harness,
            gate,
            registry,
            audit: Mutex::new(audit),
            sink,
        })
    }

    /// Build a production engine: provider from the config, bubblewrap-backed
    /// sandbox, persistent registry and audit trail.
    pub fn from_config(config: EngineConfig, sink: Arc<dyn ProgressSink>) -> EngineResult<Self> {
        let provider: Arc<dyn LlmProvider> =
            Arc::from(LlmProviderFactory::create(LlmProviderConfig::resolve(
                &config.llm,
            ))?);
        let runtime: Arc<dyn SandboxRuntime> =
            Arc::new(ProcessSandbox::new(config.sandbox.clone())?);
        let registry = Arc::new(CapabilityRegistry::open(config.registry.root_dir.clone())?);
        let audit = match &config.audit.db_path {
            Some(path) => AuditLog::open_db(path)?,
            None => AuditLog::new(),
        };
        Self::new(config, provider, runtime, registry, audit, sink)
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn audit_log(&self) -> &Mutex<AuditLog> {
        &self.audit
    }

    /// Handle one capability request to completion.
    pub async fn handle_request(&self, request: CapabilityRequest) -> EngineResponse {
        self.handle_request_with_cancel(request, CancellationToken::new())
            .await
    }

    pub async fn handle_request_with_cancel(
        &self,
        request: CapabilityRequest,
        cancel: CancellationToken,
    ) -> EngineResponse {
        let request_id = request.id;
        self.record_audit(
            &request,
            AuditStage::Received,
            None,
            request.text.clone(),
        );
        self.emit(&request, Stage::Received, "capability request received", None);

        // High-risk asks are refused before any model call.
        if let Some(detail) = self.gate.screen_request(&request.text) {
            self.record_audit(&request, AuditStage::Screened, None, detail.clone());
            self.emit(&request, Stage::Failed, "request declined by security screen", Some(detail.clone()));
            return EngineResponse {
                request_id,
                outcome: Outcome::Failed {
                    kind: FailureKind::SecurityFlagged,
                    detail: detail.clone(),
                },
                message: format!("request declined: {}", detail),
                assessment: None,
                iterations: Vec::new(),
            };
        }
        self.record_audit(&request, AuditStage::Screened, None, "clean".to_string());

        let assessed = self.assessor.assess(&request).await;
        let assessment = assessed.assessment;
        let audit_detail = if assessed.degraded {
            format!(
                "degraded to conservative default ({}): {}",
                FailureKind::AssessmentMalformed,
                assessment.missing_capability
            )
        } else {
            format!(
                "gap: {} (confidence {:.2})",
                assessment.missing_capability, assessment.confidence
            )
        };
        self.record_audit(&request, AuditStage::Assessed, None, audit_detail);
        self.emit(
            &request,
            Stage::Assessed,
            format!("assessment: missing '{}'", assessment.missing_capability),
            None,
        );

        if assessment.can_handle {
            return EngineResponse {
                request_id,
                outcome: Outcome::AlreadyCapable,
                message: "existing capabilities already cover this request".to_string(),
                assessment: Some(assessment),
                iterations: Vec::new(),
            };
        }

        let capability_name = derive_capability_name(&assessment.missing_capability);
        if let Some(existing) = self.registry.find(&capability_name) {
            self.record_audit(
                &request,
                AuditStage::Reused,
                None,
                format!("registered capability '{}' matched", existing.name),
            );
            self.emit(
                &request,
                Stage::ReuseFound,
                format!("reusing registered capability '{}'", existing.name),
                None,
            );
            return EngineResponse {
                request_id,
                outcome: Outcome::Reused {
                    capability: existing.name.clone(),
                },
                message: format!("reusing registered capability '{}'", existing.name),
                assessment: Some(assessment),
                iterations: Vec::new(),
            };
        }

        self.run_loop(&request, assessment, capability_name, cancel)
            .await
    }

    async fn run_loop(
        &self,
        request: &CapabilityRequest,
        assessment: CapabilityAssessment,
        capability_name: String,
        cancel: CancellationToken,
    ) -> EngineResponse {
        let category = Category::infer(&format!(
            "{} {}",
            assessment.missing_capability, request.text
        ));
        let operations = if assessment.required_operations.is_empty() {
            default_operations(category)
        } else {
            assessment.required_operations.clone()
        };
        let max_iterations = self.config.synthesis.max_iterations.max(1);

        let mut iterations: Vec<IterationRecord> = Vec::new();
        let mut attempts: Vec<AttemptContext> = Vec::new();

        for index in 1..=max_iterations {
            if cancel.is_cancelled() {
                return self.cancelled(request, assessment, iterations);
            }

            self.emit(
                request,
                Stage::IterationStarted,
                format!("iteration {} of {}", index, max_iterations),
                None,
            );

            let mut record = IterationRecord {
                index,
                assessment: assessment.clone(),
                module: None,
                precheck: None,
                suite: None,
                postcheck: None,
                accepted: false,
                failure: None,
                feedback: String::new(),
            };

            let ctx = SynthesisContext {
                request,
                assessment: &assessment,
                category,
                iteration: index,
                prior_attempts: &attempts,
            };
            let module = match self.synthesizer.synthesize(&ctx).await {
                SynthesisOutcome::Module(module) => module,
                SynthesisOutcome::Failed { reason } => {
                    self.record_audit(
                        request,
                        AuditStage::SynthesisAttempt,
                        Some(index),
                        format!("no module produced: {}", reason),
                    );
                    record.failure = Some(FailureKind::SynthesisFailed);
                    record.feedback = reason.clone();
                    attempts.push(AttemptContext {
                        iteration: index,
                        code: None,
                        error: reason.clone(),
                        guidance: None,
                    });
                    self.emit(
                        request,
                        Stage::IterationFailed,
                        format!("iteration {} failed: synthesis produced no module", index),
                        Some(reason),
                    );
                    iterations.push(record);
                    continue;
                }
            };
            self.record_audit(
                request,
                AuditStage::SynthesisAttempt,
                Some(index),
                format!("module '{}' generated", module.module_name),
            );
            self.emit(
                request,
                Stage::ModuleSynthesized,
                format!("module '{}' generated", module.module_name),
                None,
            );
            record.module = Some(module.clone());

            let precheck = self.gate.precheck(&module);
            self.record_audit(
                request,
                AuditStage::Precheck,
                Some(index),
                verdict_detail(&precheck),
            );
            self.emit(
                request,
                Stage::PrecheckComplete,
                format!("pre-exec check: {}", verdict_detail(&precheck)),
                None,
            );
            record.precheck = Some(precheck.clone());
            if let Some(detail) = precheck.detail() {
                let feedback = format!("security pre-exec check flagged the module: {}", detail);
                record.failure = Some(FailureKind::SecurityFlagged);
                record.feedback = feedback.clone();
                attempts.push(AttemptContext {
                    iteration: index,
                    code: Some(module.source_code.clone()),
                    error: feedback.clone(),
                    guidance: Some(
                        "Remove the flagged construct entirely. Use plain standard \
                         library file and text operations; no processes, no dynamic \
                         code execution, no network."
                            .to_string(),
                    ),
                });
                self.emit(
                    request,
                    Stage::IterationFailed,
                    format!("iteration {} failed: flagged before execution", index),
                    Some(feedback),
                );
                iterations.push(record);
                continue;
            }

            if cancel.is_cancelled() {
                iterations.push(record);
                return self.cancelled(request, assessment, iterations);
            }

            let run = match self
                .harness
                .run_module(&module, &operations, &request.text)
                .await
            {
                Ok(run) => run,
                Err(e) => {
                    // Not the module's fault; retrying burns iterations on
                    // the same broken substrate.
                    let detail = format!("sandbox unavailable: {}", e);
                    error!(request_id = %request.id, "{}", detail);
                    record.failure = Some(FailureKind::Internal);
                    record.feedback = detail.clone();
                    iterations.push(record);
                    self.record_audit(request, AuditStage::Failed, Some(index), detail.clone());
                    self.emit(request, Stage::Failed, "sandbox unavailable", Some(detail.clone()));
                    return EngineResponse {
                        request_id: request.id,
                        outcome: Outcome::Failed {
                            kind: FailureKind::Internal,
                            detail,
                        },
                        message: "the test sandbox could not be started".to_string(),
                        assessment: Some(assessment),
                        iterations,
                    };
                }
            };
            self.record_audit(
                request,
                AuditStage::TestsRun,
                Some(index),
                format!(
                    "{}/{} tests passed (overall success: {})",
                    run.suite.passed, run.suite.total, run.suite.overall_success
                ),
            );
            self.emit(
                request,
                Stage::SuiteComplete,
                format!("tests: {}/{} passed", run.suite.passed, run.suite.total),
                None,
            );
            record.suite = Some(run.suite.clone());

            let postcheck = self.gate.postcheck(&run.effects);
            self.record_audit(
                request,
                AuditStage::Postcheck,
                Some(index),
                verdict_detail(&postcheck),
            );
            self.emit(
                request,
                Stage::PostcheckComplete,
                format!("post-exec check: {}", verdict_detail(&postcheck)),
                None,
            );
            record.postcheck = Some(postcheck.clone());

            if run.suite.overall_success && postcheck.is_clean() {
                record.accepted = true;
                iterations.push(record);
                return self
                    .integrate(request, assessment, capability_name, module, index, iterations)
                    .await;
            }

            // A security flag defeats a passing suite.
            let (kind, feedback) = if let Some(detail) = postcheck.detail() {
                (
                    FailureKind::SecurityFlagged,
                    format!("security post-exec check flagged the run: {}", detail),
                )
            } else {
                let kind = suite_failure_kind(&run.suite);
                let mut feedback = run.suite.failure_digest();
                if feedback.is_empty() {
                    feedback = "suite failed without per-test diagnostics".to_string();
                }
                if !run.stderr.trim().is_empty() {
                    feedback.push_str("\nstderr:\n");
                    feedback.push_str(run.stderr.trim());
                }
                (kind, feedback)
            };
            let guidance = match kind {
                FailureKind::SecurityFlagged => Some(
                    "Only read the given input paths and write inside the working \
                     directory; never run commands or open connections."
                        .to_string(),
                ),
                _ => classify_failure(&feedback).guidance,
            };
            record.failure = Some(kind);
            record.feedback = feedback.clone();
            attempts.push(AttemptContext {
                iteration: index,
                code: Some(module.source_code.clone()),
                error: feedback.clone(),
                guidance,
            });
            self.emit(
                request,
                Stage::IterationFailed,
                format!("iteration {} failed: {}", index, kind),
                Some(feedback),
            );
            iterations.push(record);
        }

        let last_detail = iterations
            .last()
            .map(|r| r.feedback.clone())
            .unwrap_or_default();
        let detail = format!(
            "no acceptable module after {} iterations; last failure: {}",
            max_iterations,
            if last_detail.is_empty() {
                "(none recorded)"
            } else {
                last_detail.as_str()
            }
        );
        self.record_audit(request, AuditStage::Failed, None, detail.clone());
        self.emit(request, Stage::Failed, "iteration budget exhausted", Some(detail.clone()));
        EngineResponse {
            request_id: request.id,
            outcome: Outcome::Failed {
                kind: FailureKind::IterationExhausted,
                detail,
            },
            message: format!(
                "could not synthesize an acceptable module within {} iterations",
                max_iterations
            ),
            assessment: Some(assessment),
            iterations,
        }
    }

    async fn integrate(
        &self,
        request: &CapabilityRequest,
        assessment: CapabilityAssessment,
        capability_name: String,
        module: GeneratedModule,
        iterations_used: u32,
        iterations: Vec<IterationRecord>,
    ) -> EngineResponse {
        let record = CapabilityRecord {
            name: capability_name.clone(),
            module: module.clone(),
            request_text: request.text.clone(),
            iterations_used,
            registered_at: Utc::now(),
            content_hash: sha256_hex(module.source_code.as_bytes()),
        };
        match self.registry.register(record) {
            Ok(replaced) => {
                let detail = if replaced {
                    format!("capability '{}' registered (replaced earlier entry)", capability_name)
                } else {
                    format!("capability '{}' registered", capability_name)
                };
                self.record_audit(request, AuditStage::Integrated, Some(iterations_used), detail);
                self.emit(
                    request,
                    Stage::Integrated,
                    format!("capability '{}' integrated", capability_name),
                    None,
                );
                EngineResponse {
                    request_id: request.id,
                    outcome: Outcome::Integrated {
                        capability: capability_name.clone(),
                        iterations_used,
                    },
                    message: format!(
                        "capability '{}' synthesized and registered after {} iteration(s)",
                        capability_name, iterations_used
                    ),
                    assessment: Some(assessment),
                    iterations,
                }
            }
            Err(e) => {
                let detail = format!("registry write failed: {}", e);
                error!(request_id = %request.id, "{}", detail);
                self.record_audit(request, AuditStage::Failed, Some(iterations_used), detail.clone());
                self.emit(request, Stage::Failed, "registry write failed", Some(detail.clone()));
                EngineResponse {
                    request_id: request.id,
                    outcome: Outcome::Failed {
                        kind: FailureKind::Internal,
                        detail,
                    },
                    message: "the module passed all checks but could not be persisted".to_string(),
                    assessment: Some(assessment),
                    iterations,
                }
            }
        }
    }

    fn cancelled(
        &self,
        request: &CapabilityRequest,
        assessment: CapabilityAssessment,
        iterations: Vec<IterationRecord>,
    ) -> EngineResponse {
        self.record_audit(request, AuditStage::Failed, None, "cancelled".to_string());
        self.emit(request, Stage::Cancelled, "request cancelled", None);
        EngineResponse {
            request_id: request.id,
            outcome: Outcome::Failed {
                kind: FailureKind::Cancelled,
                detail: "request cancelled before completion".to_string(),
            },
            message: "request cancelled".to_string(),
            assessment: Some(assessment),
            iterations,
        }
    }

    fn record_audit(
        &self,
        request: &CapabilityRequest,
        stage: AuditStage,
        iteration: Option<u32>,
        detail: String,
    ) {
        match self.audit.lock() {
            Ok(mut log) => {
                if let Err(e) = log.append(&request.id.to_string(), stage, iteration, detail) {
                    warn!(error = %e, stage = %stage, "audit append failed");
                }
            }
            Err(_) => warn!("audit log lock poisoned"),
        }
    }

    fn emit(
        &self,
        request: &CapabilityRequest,
        stage: Stage,
        summary: impl Into<String>,
        detail: Option<String>,
    ) {
        self.sink.on_event(&ProgressEvent {
            request_id: request.id,
            stage,
            summary: summary.into(),
            detail,
        });
    }
}

/// Map a failed suite to a failure kind: probe failures name the phase
/// that died, everything else is a plain test failure.
fn suite_failure_kind(suite: &TestSuiteResult) -> FailureKind {
    for result in suite.results.iter().filter(|r| !r.passed) {
        match result.case_name.as_str() {
            "module_load" => return FailureKind::LoadFailure,
            "module_instantiate" => return FailureKind::InstantiationFailure,
            _ => {}
        }
    }
    FailureKind::TestFailure
}

fn verdict_detail(verdict: &SecurityVerdict) -> String {
    match verdict.detail() {
        Some(detail) => format!("flagged: {}", detail),
        None => "clean".to_string(),
    }
}

fn prompt_manager(config: &PromptConfig) -> PromptManager<FilePromptStore> {
    match &config.dir {
        Some(dir) if dir.exists() => {
            PromptManager::new(FilePromptStore::new(dir), config.version.clone())
        }
        _ => PromptManager::embedded_only(config.version.clone()),
    }
}

/// Engine with a null progress sink, for embedding.
pub fn engine_from_config(config: EngineConfig) -> EngineResult<SynthesisEngine> {
    SynthesisEngine::from_config(config, Arc::new(NullSink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TestResult;

    #[test]
    fn probe_failures_map_to_their_phase() {
        let load = TestSuiteResult::failed_probe("load", "SyntaxError: invalid syntax");
        assert_eq!(suite_failure_kind(&load), FailureKind::LoadFailure);
        let init = TestSuiteResult::failed_probe("instantiate", "TypeError: missing arg");
        assert_eq!(suite_failure_kind(&init), FailureKind::InstantiationFailure);
    }

    #[test]
    fn ordinary_failures_are_test_failures() {
        let results = vec![TestResult {
            case_name: "smoke_sum_column".to_string(),
            critical: true,
            passed: false,
            output: String::new(),
            error: "KeyError: 'value'".to_string(),
            duration_ms: 3,
        }];
        let suite = TestSuiteResult::from_results(results, 1.0);
        assert_eq!(suite_failure_kind(&suite), FailureKind::TestFailure);
    }

    #[test]
    fn cancellation_is_visible_through_clones() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.clone().cancel();
        assert!(token.is_cancelled());
    }
}
