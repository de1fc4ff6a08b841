//! End-to-end sandbox runs against a real interpreter.
//!
//! These run the embedded driver under the host's python3 with plain process
//! isolation, so they hold on machines without bubblewrap. Each test returns
//! early when python3 is missing.

use std::sync::Arc;

use capforge::config::{IsolationMode, SandboxConfig, SynthesisConfig};
use capforge::sandbox::{ProcessSandbox, SandboxRuntime, SandboxTestHarness};
use capforge::types::{Category, GeneratedModule};

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn harness() -> SandboxTestHarness {
    let config = SandboxConfig {
        isolation: IsolationMode::Process,
        ..SandboxConfig::default()
    };
    let runtime: Arc<dyn SandboxRuntime> = Arc::new(ProcessSandbox::new(config).unwrap());
    SandboxTestHarness::new(runtime, SynthesisConfig::default())
}

fn module(name: &str, source: &str, category: Category) -> GeneratedModule {
    GeneratedModule {
        module_name: name.to_string(),
        source_code: source.to_string(),
        category,
        iteration: 1,
    }
}

fn ops(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

const LINE_COUNTER: &str = r#"
class LineCounter:
    def count_lines(self, text_path):
        with open(text_path) as handle:
            return sum(1 for _ in handle)
"#;

const BROKEN_MODULE: &str = r#"
class Broken
    def nope(self):
        return 1
"#;

const NOTE_SAVER: &str = r#"
class NoteSaver:
    def run(self, task_text):
        with open("notes_out.txt", "w") as handle:
            handle.write(str(task_text))
        return "saved"
"#;

#[tokio::test]
async fn test_working_module_passes_the_generated_suite() {
    if !python_available() {
        println!("Skipping test: python3 not available in this environment");
        return;
    }
    let run = harness()
        .run_module(
            &module("tool_lines", LINE_COUNTER, Category::TextProcessing),
            &ops(&["count_lines"]),
            "count the lines in my notes file",
        )
        .await
        .unwrap();
    assert!(
        run.suite.overall_success,
        "suite failed; stderr: {}",
        run.stderr
    );
    assert_eq!(run.suite.failed, 0);
    let smoke = run
        .suite
        .results
        .iter()
        .find(|r| r.case_name == "smoke_count_lines")
        .unwrap();
    assert!(smoke.passed);
    assert!(smoke.critical);
}

#[tokio::test]
async fn test_syntax_error_surfaces_as_load_failure() {
    if !python_available() {
        println!("Skipping test: python3 not available in this environment");
        return;
    }
    let run = harness()
        .run_module(
            &module("tool_broken", BROKEN_MODULE, Category::Custom),
            &ops(&["nope"]),
            "anything",
        )
        .await
        .unwrap();
    assert!(!run.suite.overall_success);
    assert_eq!(run.suite.results.len(), 1);
    assert_eq!(run.suite.results[0].case_name, "module_load");
    assert!(run.suite.results[0].error.contains("SyntaxError"));
}

#[tokio::test]
async fn test_workspace_writes_land_in_the_effects_journal() {
    if !python_available() {
        println!("Skipping test: python3 not available in this environment");
        return;
    }
    let run = harness()
        .run_module(
            &module("tool_notes", NOTE_SAVER, Category::Custom),
            &ops(&["run"]),
            "save this note for me",
        )
        .await
        .unwrap();
    assert!(
        run.suite.overall_success,
        "suite failed; stderr: {}",
        run.stderr
    );
    assert!(
        run.effects
            .writes
            .iter()
            .any(|path| path == "/workspace/notes_out.txt"),
        "writes journal: {:?}",
        run.effects.writes
    );
    assert!(run.effects.commands.is_empty());
    assert!(run.effects.connections.is_empty());
}
