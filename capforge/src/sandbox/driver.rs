//! The Python driver that runs inside the sandbox.
//!
//! The driver loads the candidate module from a file, instantiates its
//! class, runs the requested test cases and prints a JSON report between
//! sentinel lines. Load and instantiation problems are reported, not
//! crashed on, so the controller can tell "module is broken" from "sandbox
//! is broken". After every test it also rewrites `.progress.json` and
//! `.effects.json` in the workspace, which survive a killed process.

use serde::Deserialize;

use crate::error::EngineResult;
use crate::types::TestCase;

pub const REPORT_BEGIN: &str = "CAPFORGE_REPORT_BEGIN";
pub const REPORT_END: &str = "CAPFORGE_REPORT_END";

/// File names the driver expects inside the workspace.
pub const JOB_FILE: &str = "job.json";
pub const DRIVER_FILE: &str = "driver.py";
pub const EFFECTS_FILE: &str = ".effects.json";
pub const PROGRESS_FILE: &str = ".progress.json";

/// Final driver report. `ok == false` means the module never reached the
/// test phase; `phase` then names where it died ("load" or "instantiate").
#[derive(Debug, Clone, Deserialize)]
pub struct DriverReport {
    pub ok: bool,
    pub phase: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub results: Vec<DriverCaseResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverCaseResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DriverProgress {
    #[serde(default)]
    pub results: Vec<DriverCaseResult>,
}

/// Build the `job.json` payload for one suite run.
pub fn build_payload(
    module_name: &str,
    tests: &[TestCase],
    per_test_timeout_ms: u64,
) -> EngineResult<String> {
    let payload = serde_json::json!({
        "module_name": module_name,
        "per_test_timeout_ms": per_test_timeout_ms,
        "tests": tests,
    });
    Ok(serde_json::to_string(&payload)?)
}

/// Extract the last sentinel-delimited report from driver stdout. The
/// module under test may print arbitrary text around it.
pub fn parse_report(stdout: &str) -> Option<DriverReport> {
    let begin = stdout.rfind(REPORT_BEGIN)?;
    let after = &stdout[begin + REPORT_BEGIN.len()..];
    let end = after.find(REPORT_END)?;
    serde_json::from_str(after[..end].trim()).ok()
}

pub const DRIVER_SOURCE: &str = r##"
import builtins
import json
import os
import signal
import socket
import sys
import time
import traceback

REPORT_BEGIN = "CAPFORGE_REPORT_BEGIN"
REPORT_END = "CAPFORGE_REPORT_END"
EFFECTS_PATH = ".effects.json"
PROGRESS_PATH = ".progress.json"
WORKSPACE_ROOT = os.getcwd()

_real_open = builtins.open
_real_system = os.system
_real_connect = socket.socket.connect

effects = {"writes": [], "commands": [], "connections": []}


def _flush(path, payload):
    try:
        with _real_open(path, "w") as fh:
            json.dump(payload, fh)
    except Exception:
        pass


def _flush_effects():
    _flush(EFFECTS_PATH, effects)


def _normalize(path):
    # Report workspace paths under the canonical /workspace prefix so the
    # write allowlist reads the same with or without the mount namespace.
    full = os.path.abspath(str(path))
    if full == WORKSPACE_ROOT:
        return "/workspace"
    if full.startswith(WORKSPACE_ROOT + os.sep):
        return "/workspace/" + os.path.relpath(full, WORKSPACE_ROOT)
    return full


def _recording_open(file, mode="r", *args, **kwargs):
    if any(flag in str(mode) for flag in ("w", "a", "x", "+")):
        effects["writes"].append(_normalize(file))
        _flush_effects()
    return _real_open(file, mode, *args, **kwargs)


def _recording_system(command):
    effects["commands"].append(str(command))
    _flush_effects()
    return _real_system(command)


def _recording_connect(self, address):
    effects["connections"].append(repr(address))
    _flush_effects()
    return _real_connect(self, address)


class CallTimeout(Exception):
    pass


def _on_alarm(signum, frame):
    raise CallTimeout()


def emit(report):
    _flush_effects()
    sys.stdout.write("\n" + REPORT_BEGIN + "\n")
    sys.stdout.write(json.dumps(report))
    sys.stdout.write("\n" + REPORT_END + "\n")
    sys.stdout.flush()


def load_tool(module_name):
    source_path = module_name + ".py"
    try:
        with _real_open(source_path) as fh:
            source = fh.read()
        code = compile(source, source_path, "exec")
        namespace = {"__name__": module_name}
        exec(code, namespace)
    except BaseException:
        return None, ("load", traceback.format_exc(limit=8))
    classes = [
        value
        for value in namespace.values()
        if isinstance(value, type) and getattr(value, "__module__", "") == module_name
    ]
    if not classes:
        return None, ("load", "module defines no class")
    try:
        return classes[0](), None
    except BaseException:
        return None, ("instantiate", traceback.format_exc(limit=8))


def run_case(tool, test, timeout_s):
    name = test.get("name", "unnamed")
    operation = test.get("operation", "")
    expectation = test.get("expectation", "completes")
    args = test.get("args", [])
    kwargs = test.get("kwargs", {})
    started = time.monotonic()
    passed = False
    error = None
    output = None

    method = getattr(tool, operation, None)
    if not callable(method):
        error = "operation '%s' is not defined on the tool class" % operation
    else:
        signal.alarm(timeout_s)
        try:
            value = method(*args, **kwargs)
            passed = True
            if value is not None:
                output = repr(value)[:2000]
        except CallTimeout:
            error = "call exceeded the %ds per-test timeout" % timeout_s
        except Exception as exc:
            if expectation == "handles_gracefully":
                passed = True
                output = "raised %s: %s" % (type(exc).__name__, exc)
            else:
                error = traceback.format_exc(limit=8)
        finally:
            signal.alarm(0)

    return {
        "name": name,
        "passed": passed,
        "error": error,
        "output": output,
        "duration_ms": int((time.monotonic() - started) * 1000),
    }


def main():
    with _real_open("job.json") as fh:
        job = json.load(fh)

    tool, failure = load_tool(job["module_name"])
    if failure is not None:
        phase, error = failure
        emit({"ok": False, "phase": phase, "error": error, "results": []})
        return

    builtins.open = _recording_open
    os.system = _recording_system
    socket.socket.connect = _recording_connect
    signal.signal(signal.SIGALRM, _on_alarm)

    timeout_s = max(1, int(job.get("per_test_timeout_ms", 10000) // 1000))
    results = []
    for test in job.get("tests", []):
        results.append(run_case(tool, test, timeout_s))
        _flush(PROGRESS_PATH, {"results": results})

    emit({"ok": True, "phase": "suite", "results": results})


if __name__ == "__main__":
    main()
"##;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Expectation;

    #[test]
    fn test_parse_report_between_sentinels() {
        let stdout = format!(
            "module noise\n{}\n{}\n{}\n",
            REPORT_BEGIN,
            r#"{"ok": true, "phase": "suite", "results": [{"name": "smoke", "passed": true, "duration_ms": 4}]}"#,
            REPORT_END
        );
        let report = parse_report(&stdout).unwrap();
        assert!(report.ok);
        assert_eq!(report.phase, "suite");
        assert_eq!(report.results.len(), 1);
        assert!(report.results[0].passed);
    }

    #[test]
    fn test_parse_report_takes_last_block() {
        let stdout = format!(
            "{b}\n{{\"ok\": false, \"phase\": \"load\"}}\n{e}\n{b}\n{{\"ok\": true, \"phase\": \"suite\"}}\n{e}\n",
            b = REPORT_BEGIN,
            e = REPORT_END
        );
        let report = parse_report(&stdout).unwrap();
        assert!(report.ok);
    }

    #[test]
    fn test_parse_report_missing_sentinels() {
        assert!(parse_report("no report here").is_none());
        assert!(parse_report(REPORT_BEGIN).is_none());
    }

    #[test]
    fn test_payload_round_trips_test_fields() {
        let case = TestCase {
            name: "smoke_sum_column".to_string(),
            description: "sum a numeric column".to_string(),
            operation: "sum_column".to_string(),
            args: vec![
                serde_json::json!("input/sample.csv"),
                serde_json::json!("value"),
            ],
            kwargs: serde_json::Map::new(),
            expectation: Expectation::Completes,
            critical: true,
            autogenerated: true,
        };
        let payload = build_payload("tool_abc", &[case], 5000).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["module_name"], "tool_abc");
        assert_eq!(value["per_test_timeout_ms"], 5000);
        assert_eq!(value["tests"][0]["operation"], "sum_column");
        assert_eq!(value["tests"][0]["expectation"], "completes");
    }

    #[test]
    fn test_driver_source_mentions_project_sentinels() {
        assert!(DRIVER_SOURCE.contains(REPORT_BEGIN));
        assert!(DRIVER_SOURCE.contains(REPORT_END));
        assert!(DRIVER_SOURCE.contains(PROGRESS_FILE));
        assert!(DRIVER_SOURCE.contains(EFFECTS_FILE));
    }
}
