//! Failure classification for the retry loop.
//!
//! Parses harness diagnostics and maps them to a failure class with fix
//! guidance. The guidance ends up in the next synthesis prompt, so it is
//! phrased as an instruction to the model, tuned to the module contract.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Classification of a failed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FailureClass {
    /// No diagnostics to classify.
    None,
    Syntax,
    /// A required operation or attribute is missing from the class.
    MissingOperation(String),
    /// Import of something outside the standard library.
    MissingDependency(String),
    /// The module touched the network.
    Network(String),
    FileAccess(String),
    Timeout,
    /// Generic Python exception, by type name.
    Runtime(String),
    Unknown,
}

/// A classified failure with guidance for the next attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedFailure {
    pub class: FailureClass,
    pub message: String,
    pub guidance: Option<String>,
}

static MODULE_NOT_FOUND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ModuleNotFoundError: No module named '([^']+)'").unwrap());
static SYNTAX_ERROR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"SyntaxError: (.+)").unwrap());
static MISSING_OPERATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"operation '([^']+)' is not defined").unwrap());
static ATTRIBUTE_ERROR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"AttributeError: .*has no attribute '([^']+)'").unwrap());
static FILE_ERROR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(FileNotFoundError|PermissionError|IsADirectoryError): (.+)").unwrap());
static GENERIC_EXCEPTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\w+Error): (.+)").unwrap());

const NETWORK_PATTERNS: &[&str] = &[
    "Temporary failure in name resolution",
    "Name or service not known",
    "socket.gaierror",
    "ConnectionRefusedError",
    "ConnectionError",
    "urllib.error.URLError",
    "Network is unreachable",
    "No route to host",
    "Connection timed out",
];

/// Classify combined diagnostics (failure digest plus stderr) from one
/// failed iteration.
pub fn classify_failure(diagnostics: &str) -> ClassifiedFailure {
    if diagnostics.trim().is_empty() {
        return ClassifiedFailure {
            class: FailureClass::None,
            message: String::new(),
            guidance: None,
        };
    }

    for pattern in NETWORK_PATTERNS {
        if diagnostics.contains(pattern) {
            return ClassifiedFailure {
                class: FailureClass::Network((*pattern).to_string()),
                message: format!("network failure: {}", pattern),
                guidance: Some(
                    "The sandbox has no network access. Work only on local files passed \
                     as arguments; remove every import and call that reaches the network."
                        .to_string(),
                ),
            };
        }
    }

    if let Some(caps) = MODULE_NOT_FOUND_RE.captures(diagnostics) {
        let module = caps.get(1).map_or("", |m| m.as_str()).to_string();
        return ClassifiedFailure {
            class: FailureClass::MissingDependency(module.clone()),
            message: format!("module not found: {}", module),
            guidance: Some(format!(
                "'{}' is not installed. Use only the Python standard library.",
                module
            )),
        };
    }

    if let Some(caps) = SYNTAX_ERROR_RE.captures(diagnostics) {
        let details = caps.get(1).map_or("", |m| m.as_str()).to_string();
        return ClassifiedFailure {
            class: FailureClass::Syntax,
            message: format!("syntax error: {}", details),
            guidance: Some(
                "The module failed to parse. Check indentation and balance of quotes \
                 and brackets, and emit plain Python with no markdown inside the code."
                    .to_string(),
            ),
        };
    }

    if let Some(caps) = MISSING_OPERATION_RE
        .captures(diagnostics)
        .or_else(|| ATTRIBUTE_ERROR_RE.captures(diagnostics))
    {
        let name = caps.get(1).map_or("", |m| m.as_str()).to_string();
        return ClassifiedFailure {
            class: FailureClass::MissingOperation(name.clone()),
            message: format!("missing operation: {}", name),
            guidance: Some(format!(
                "Define a method named exactly '{}' on the tool class, one method per \
                 required operation.",
                name
            )),
        };
    }

    if diagnostics.contains("per-test timeout") || diagnostics.contains("timed out") {
        return ClassifiedFailure {
            class: FailureClass::Timeout,
            message: "execution timed out".to_string(),
            guidance: Some(
                "A call ran past its timeout. Avoid unbounded loops and avoid reading \
                 whole files into memory; process input line by line and return early \
                 on empty input."
                    .to_string(),
            ),
        };
    }

    if let Some(caps) = FILE_ERROR_RE.captures(diagnostics) {
        let detail = caps.get(2).map_or("", |m| m.as_str()).to_string();
        return ClassifiedFailure {
            class: FailureClass::FileAccess(detail.clone()),
            message: format!("file access error: {}", detail),
            guidance: Some(
                "Operate on the exact path passed as the first positional argument, \
                 relative to the working directory, and raise ValueError when it does \
                 not exist instead of letting the OS error escape."
                    .to_string(),
            ),
        };
    }

    for line in diagnostics.lines().rev() {
        if let Some(caps) = GENERIC_EXCEPTION_RE.captures(line) {
            let error_type = caps.get(1).map_or("", |m| m.as_str()).to_string();
            let message = caps.get(2).map_or("", |m| m.as_str()).to_string();
            let guidance = match error_type.as_str() {
                "TypeError" => Some(
                    "A call signature did not match. Methods take the documented \
                     positional arguments, path first, and no extra required parameters."
                        .to_string(),
                ),
                "KeyError" => Some(
                    "Look fields up by name and raise ValueError with a clear message \
                     when one is missing instead of letting KeyError escape."
                        .to_string(),
                ),
                "ZeroDivisionError" => Some(
                    "Guard divisions against empty input before computing averages or \
                     rates."
                        .to_string(),
                ),
                _ => None,
            };
            return ClassifiedFailure {
                class: FailureClass::Runtime(error_type.clone()),
                message: format!("{}: {}", error_type, message),
                guidance,
            };
        }
    }

    ClassifiedFailure {
        class: FailureClass::Unknown,
        message: "execution failed without a recognizable Python error".to_string(),
        guidance: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_module_not_found() {
        let diagnostics = "Traceback (most recent call last):\n  File \"tool.py\", line 1, in <module>\n    import pandas\nModuleNotFoundError: No module named 'pandas'";
        let classified = classify_failure(diagnostics);
        assert!(
            matches!(classified.class, FailureClass::MissingDependency(ref m) if m == "pandas")
        );
        assert!(classified.guidance.unwrap().contains("standard library"));
    }

    #[test]
    fn test_classify_syntax_error() {
        let diagnostics = "  File \"tool.py\", line 3\n    def sum_column(self\n                      ^\nSyntaxError: unexpected EOF while parsing";
        assert_eq!(classify_failure(diagnostics).class, FailureClass::Syntax);
    }

    #[test]
    fn test_classify_missing_operation_from_driver_message() {
        let diagnostics = "- smoke_sum_column: operation 'sum_column' is not defined on the tool class";
        let classified = classify_failure(diagnostics);
        assert!(
            matches!(classified.class, FailureClass::MissingOperation(ref op) if op == "sum_column")
        );
        assert!(classified.guidance.unwrap().contains("sum_column"));
    }

    #[test]
    fn test_classify_timeout() {
        let diagnostics = "- large_input: call exceeded the 10s per-test timeout";
        assert_eq!(classify_failure(diagnostics).class, FailureClass::Timeout);
    }

    #[test]
    fn test_classify_runtime_error_with_guidance() {
        let diagnostics = "Traceback (most recent call last):\n  ...\nZeroDivisionError: division by zero";
        let classified = classify_failure(diagnostics);
        assert!(
            matches!(classified.class, FailureClass::Runtime(ref e) if e == "ZeroDivisionError")
        );
        assert!(classified.guidance.is_some());
    }

    #[test]
    fn test_classify_network_failure() {
        let diagnostics = "urllib.error.URLError: <urlopen error [Errno -3] Temporary failure in name resolution>";
        let classified = classify_failure(diagnostics);
        assert!(matches!(classified.class, FailureClass::Network(_)));
    }

    #[test]
    fn test_empty_diagnostics() {
        assert_eq!(classify_failure("  \n ").class, FailureClass::None);
    }
}
