//! Test harness for candidate modules.
//!
//! Derives a suite from the module's category and required operations,
//! stages matching fixture files, runs everything in one driver process and
//! folds what came back into a [`TestSuiteResult`]. Load and instantiation
//! failures become a single failed critical probe, so a module that never
//! ran scores zero instead of erroring the engine.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SynthesisConfig;
use crate::error::EngineResult;
use crate::sandbox::driver::{self, DriverCaseResult};
use crate::sandbox::{EffectsJournal, Fixture, SandboxJob, SandboxRuntime};
use crate::types::{Category, Expectation, GeneratedModule, TestCase, TestResult, TestSuiteResult};

/// Everything one harness pass produced.
#[derive(Debug, Clone)]
pub struct HarnessRun {
    pub suite: TestSuiteResult,
    /// Side effects observed during execution, for the post-exec gate.
    pub effects: EffectsJournal,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

pub struct SandboxTestHarness {
    runtime: Arc<dyn SandboxRuntime>,
    config: SynthesisConfig,
}

impl SandboxTestHarness {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SynthesisConfig) -> Self {
        Self { runtime, config }
    }

    /// Run the full suite for one candidate module.
    pub async fn run_module(
        &self,
        module: &GeneratedModule,
        operations: &[String],
        request_text: &str,
    ) -> EngineResult<HarnessRun> {
        let cases = self.build_suite(module.category, operations, request_text);
        let payload =
            driver::build_payload(&module.module_name, &cases, self.config.per_test_timeout_ms)?;
        let job = SandboxJob {
            module_name: module.module_name.clone(),
            source_code: module.source_code.clone(),
            payload,
            fixtures: fixtures_for(module.category),
            timeout_ms: self.config.suite_timeout_ms,
            network_enabled: false,
        };

        let output = self.runtime.run(&job).await?;
        let suite = self.interpret(&cases, &output);
        Ok(HarnessRun {
            suite,
            effects: output.effects,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: output.duration_ms,
        })
    }

    /// Smoke test per operation plus a bounded set of edge cases against
    /// the primary operation.
    pub fn build_suite(
        &self,
        category: Category,
        operations: &[String],
        request_text: &str,
    ) -> Vec<TestCase> {
        let mut cases = Vec::new();
        for operation in operations {
            cases.push(TestCase {
                name: format!("smoke_{}", operation),
                description: format!("{} succeeds on well-formed input", operation),
                operation: operation.clone(),
                args: smoke_args(category, operation, request_text),
                kwargs: serde_json::Map::new(),
                expectation: Expectation::Completes,
                critical: true,
                autogenerated: true,
            });
        }
        if let Some(primary) = operations.first() {
            cases.extend(edge_cases(category, primary, request_text));
        }
        cases
    }

    fn interpret(&self, cases: &[TestCase], output: &crate::sandbox::RunOutput) -> TestSuiteResult {
        let threshold = self.config.acceptance_threshold;

        if output.timed_out {
            return self.salvage(cases, &output.progress, "suite deadline exceeded");
        }

        let report = match driver::parse_report(&output.stdout) {
            Some(report) => report,
            None => {
                // Process died before the driver could report. Keep whatever
                // per-case progress reached the workspace.
                if output.progress.is_empty() {
                    let detail = if output.stderr.trim().is_empty() {
                        format!(
                            "sandbox process exited with {:?} before reporting",
                            output.exit_code
                        )
                    } else {
                        output.stderr.trim().to_string()
                    };
                    return TestSuiteResult::failed_probe("load", detail);
                }
                return self.salvage(cases, &output.progress, "sandbox process exited early");
            }
        };

        if !report.ok {
            let detail = report
                .error
                .unwrap_or_else(|| "module could not be prepared".to_string());
            return TestSuiteResult::failed_probe(&report.phase, detail);
        }

        let by_name: HashMap<&str, &DriverCaseResult> = report
            .results
            .iter()
            .map(|r| (r.name.as_str(), r))
            .collect();
        let results = cases
            .iter()
            .map(|case| match by_name.get(case.name.as_str()) {
                Some(run) => to_result(case, run),
                None => missing_result(case, "no result reported for this test"),
            })
            .collect();
        TestSuiteResult::from_results(results, threshold)
    }

    /// Build a suite result from partial progress, failing every case the
    /// driver never got to.
    fn salvage(
        &self,
        cases: &[TestCase],
        progress: &[DriverCaseResult],
        reason: &str,
    ) -> TestSuiteResult {
        let by_name: HashMap<&str, &DriverCaseResult> =
            progress.iter().map(|r| (r.name.as_str(), r)).collect();
        let results = cases
            .iter()
            .map(|case| match by_name.get(case.name.as_str()) {
                Some(run) => to_result(case, run),
                None => missing_result(case, reason),
            })
            .collect();
        TestSuiteResult::from_results(results, self.config.acceptance_threshold)
    }
}

fn to_result(case: &TestCase, run: &DriverCaseResult) -> TestResult {
    TestResult {
        case_name: case.name.clone(),
        critical: case.critical,
        passed: run.passed,
        output: run.output.clone().unwrap_or_default(),
        error: run.error.clone().unwrap_or_default(),
        duration_ms: run.duration_ms,
    }
}

fn missing_result(case: &TestCase, reason: &str) -> TestResult {
    TestResult {
        case_name: case.name.clone(),
        critical: case.critical,
        passed: false,
        output: String::new(),
        error: reason.to_string(),
        duration_ms: 0,
    }
}

/// Positional arguments for a smoke test, following the module contract:
/// file-based operations take a workspace-relative path first, spreadsheet
/// column operations take (csv_path, column_name).
fn smoke_args(
    category: Category,
    operation: &str,
    request_text: &str,
) -> Vec<serde_json::Value> {
    match category {
        Category::Spreadsheet => {
            if operation.contains("column") {
                vec![
                    serde_json::json!("input/sample.csv"),
                    serde_json::json!("value"),
                ]
            } else {
                vec![serde_json::json!("input/sample.csv")]
            }
        }
        Category::FileManagement => vec![serde_json::json!("input/docs")],
        Category::TextProcessing => vec![serde_json::json!("input/sample.txt")],
        Category::Custom => vec![serde_json::json!(request_text)],
    }
}

fn edge_cases(category: Category, operation: &str, request_text: &str) -> Vec<TestCase> {
    let mut cases = Vec::new();
    let mut push = |name: String, description: &str, args: Vec<serde_json::Value>, expectation| {
        cases.push(TestCase {
            name,
            description: description.to_string(),
            operation: operation.to_string(),
            args,
            kwargs: serde_json::Map::new(),
            expectation,
            critical: false,
            autogenerated: true,
        });
    };

    match category {
        Category::Spreadsheet => {
            let empty_args = |path: &str| {
                if operation.contains("column") {
                    vec![serde_json::json!(path), serde_json::json!("value")]
                } else {
                    vec![serde_json::json!(path)]
                }
            };
            push(
                format!("edge_empty_input_{}", operation),
                "survives a header-only file",
                empty_args("input/empty.csv"),
                Expectation::HandlesGracefully,
            );
            push(
                format!("edge_missing_target_{}", operation),
                "rejects a nonexistent file",
                empty_args("input/missing.csv"),
                Expectation::HandlesGracefully,
            );
            if operation.contains("column") {
                push(
                    format!("edge_unknown_column_{}", operation),
                    "rejects an unknown column",
                    vec![
                        serde_json::json!("input/sample.csv"),
                        serde_json::json!("no_such_column"),
                    ],
                    Expectation::HandlesGracefully,
                );
            }
            push(
                format!("edge_large_input_{}", operation),
                "finishes on a large file",
                empty_args("input/large.csv"),
                Expectation::Completes,
            );
        }
        Category::FileManagement => {
            push(
                format!("edge_missing_target_{}", operation),
                "rejects a nonexistent directory",
                vec![serde_json::json!("input/does_not_exist")],
                Expectation::HandlesGracefully,
            );
        }
        Category::TextProcessing => {
            push(
                format!("edge_empty_input_{}", operation),
                "survives an empty file",
                vec![serde_json::json!("input/empty.txt")],
                Expectation::HandlesGracefully,
            );
            push(
                format!("edge_missing_target_{}", operation),
                "rejects a nonexistent file",
                vec![serde_json::json!("input/missing.txt")],
                Expectation::HandlesGracefully,
            );
            push(
                format!("edge_large_input_{}", operation),
                "finishes on a large file",
                vec![serde_json::json!("input/large.txt")],
                Expectation::Completes,
            );
        }
        Category::Custom => {
            push(
                format!("edge_empty_input_{}", operation),
                "survives empty task text",
                vec![serde_json::json!("")],
                Expectation::HandlesGracefully,
            );
            push(
                format!("edge_wrong_type_{}", operation),
                "rejects non-text task input",
                vec![serde_json::json!(12345)],
                Expectation::HandlesGracefully,
            );
            let _ = request_text;
        }
    }
    cases
}

/// Fixture files staged into the workspace for each category.
pub fn fixtures_for(category: Category) -> Vec<Fixture> {
    let fixture = |path: &str, contents: String| Fixture {
        path: path.to_string(),
        contents,
    };
    match category {
        Category::Spreadsheet => {
            let mut large = String::from("name,value\n");
            for i in 0..500 {
                large.push_str(&format!("row{},{}\n", i, i % 97));
            }
            vec![
                fixture(
                    "input/sample.csv",
                    "name,value\nwidget,10\ngadget,20\ndoohickey,12\n".to_string(),
                ),
                fixture("input/empty.csv", "name,value\n".to_string()),
                fixture("input/large.csv", large),
            ]
        }
        Category::FileManagement => vec![
            fixture("input/docs/report.txt", "quarterly report\n".to_string()),
            fixture("input/docs/notes.md", "# notes\n".to_string()),
            fixture("input/docs/data.csv", "a,b\n1,2\n".to_string()),
        ],
        Category::TextProcessing => {
            let mut large = String::new();
            for i in 0..400 {
                large.push_str(&format!("Sentence number {} fills the file. ", i));
            }
            vec![
                fixture(
                    "input/sample.txt",
                    "The quick brown fox jumps over the lazy dog. \
                     It then naps in the sun. The dog does not mind at all.\n"
                        .to_string(),
                ),
                fixture("input/empty.txt", String::new()),
                fixture("input/large.txt", large),
            ]
        }
        Category::Custom => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SynthesisConfig;
    use crate::sandbox::{RunOutput, ScriptedRun, ScriptedSandbox};

    fn harness(runtime: Arc<dyn SandboxRuntime>) -> SandboxTestHarness {
        SandboxTestHarness::new(runtime, SynthesisConfig::default())
    }

    fn module(category: Category) -> GeneratedModule {
        GeneratedModule {
            module_name: "tool_test".to_string(),
            source_code: "class T:\n    pass\n".to_string(),
            category,
            iteration: 1,
        }
    }

    fn ops(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn report_stdout(body: &str) -> String {
        format!(
            "{}\n{}\n{}\n",
            driver::REPORT_BEGIN,
            body,
            driver::REPORT_END
        )
    }

    #[test]
    fn test_suite_has_smoke_per_operation_and_edges() {
        let h = harness(Arc::new(ScriptedSandbox::new(vec![])));
        let suite = h.build_suite(
            Category::Spreadsheet,
            &ops(&["sum_column", "count_rows"]),
            "sum the value column",
        );
        let names: Vec<&str> = suite.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"smoke_sum_column"));
        assert!(names.contains(&"smoke_count_rows"));
        assert!(names.contains(&"edge_unknown_column_sum_column"));
        assert!(names.contains(&"edge_missing_target_sum_column"));
        let smoke = suite.iter().find(|c| c.name == "smoke_sum_column").unwrap();
        assert!(smoke.critical);
        assert_eq!(smoke.args[0], serde_json::json!("input/sample.csv"));
        assert_eq!(smoke.args[1], serde_json::json!("value"));
    }

    #[tokio::test]
    async fn test_load_failure_becomes_failed_probe() {
        let stdout = report_stdout(
            r#"{"ok": false, "phase": "load", "error": "SyntaxError: invalid syntax", "results": []}"#,
        );
        let runtime = Arc::new(ScriptedSandbox::new(vec![ScriptedRun::output(RunOutput {
            exit_code: Some(0),
            stdout,
            ..RunOutput::default()
        })]));
        let h = harness(runtime);
        let run = h
            .run_module(&module(Category::Spreadsheet), &ops(&["sum_column"]), "req")
            .await
            .unwrap();
        assert!(!run.suite.overall_success);
        assert_eq!(run.suite.total, 1);
        assert_eq!(run.suite.results[0].case_name, "module_load");
        assert!(run.suite.results[0].critical);
        assert!(run.suite.results[0].error.contains("SyntaxError"));
    }

    #[tokio::test]
    async fn test_full_pass_is_overall_success() {
        let h0 = harness(Arc::new(ScriptedSandbox::new(vec![])));
        let cases = h0.build_suite(Category::Custom, &ops(&["run"]), "do the thing");
        let results: Vec<String> = cases
            .iter()
            .map(|c| {
                format!(
                    r#"{{"name": "{}", "passed": true, "duration_ms": 3}}"#,
                    c.name
                )
            })
            .collect();
        let stdout = report_stdout(&format!(
            r#"{{"ok": true, "phase": "suite", "results": [{}]}}"#,
            results.join(",")
        ));
        let runtime = Arc::new(ScriptedSandbox::new(vec![ScriptedRun::output(RunOutput {
            exit_code: Some(0),
            stdout,
            ..RunOutput::default()
        })]));
        let h = harness(runtime);
        let run = h
            .run_module(&module(Category::Custom), &ops(&["run"]), "do the thing")
            .await
            .unwrap();
        assert!(run.suite.overall_success);
        assert_eq!(run.suite.failed, 0);
    }

    #[tokio::test]
    async fn test_suite_timeout_fails_unstarted_cases() {
        let progress = vec![DriverCaseResult {
            name: "smoke_run".to_string(),
            passed: true,
            error: None,
            output: None,
            duration_ms: 5,
        }];
        let runtime = Arc::new(ScriptedSandbox::new(vec![ScriptedRun::output(RunOutput {
            exit_code: None,
            timed_out: true,
            progress,
            ..RunOutput::default()
        })]));
        let h = harness(runtime);
        let run = h
            .run_module(&module(Category::Custom), &ops(&["run"]), "req")
            .await
            .unwrap();
        assert!(!run.suite.overall_success);
        let smoke = run
            .suite
            .results
            .iter()
            .find(|r| r.case_name == "smoke_run")
            .unwrap();
        assert!(smoke.passed);
        let unstarted = run
            .suite
            .results
            .iter()
            .find(|r| r.case_name == "edge_empty_input_run")
            .unwrap();
        assert!(!unstarted.passed);
        assert!(unstarted.error.contains("deadline"));
    }

    #[test]
    fn test_fixtures_match_smoke_paths() {
        let fixtures = fixtures_for(Category::Spreadsheet);
        let paths: Vec<&str> = fixtures.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"input/sample.csv"));
        assert!(paths.contains(&"input/empty.csv"));
        assert!(paths.contains(&"input/large.csv"));
        assert!(fixtures_for(Category::Custom).is_empty());
    }
}
