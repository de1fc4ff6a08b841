//! Security gate applied before and after sandbox execution.
//!
//! The pre-exec check scans generated source for blocked constructs, the
//! post-exec check compares observed side effects against the policy
//! allowlists, and the request screen rejects high-risk asks before any
//! synthesis happens. A flagged verdict always wins over passing tests.

use std::path::Path;

use regex::Regex;

use crate::config::SecurityPolicyConfig;
use crate::error::{EngineError, EngineResult};
use crate::sandbox::EffectsJournal;
use crate::types::{GeneratedModule, SecurityVerdict};

/// Imports that reach the network, screened statically when the sandbox
/// runs with networking disabled.
const NETWORK_IMPORT_PATTERN: &str =
    r"(?m)^\s*(import|from)\s+(socket|urllib|http\.client|requests|ftplib|smtplib|telnetlib)\b";

pub struct SecurityGate {
    blocked: Vec<Regex>,
    network_imports: Option<Regex>,
    policy: SecurityPolicyConfig,
}

impl SecurityGate {
    /// Compile the policy. Invalid patterns are a startup error, not a
    /// silently skipped rule.
    pub fn new(policy: &SecurityPolicyConfig, network_enabled: bool) -> EngineResult<Self> {
        let mut blocked = Vec::with_capacity(policy.blocked_patterns.len());
        for pattern in &policy.blocked_patterns {
            let regex = Regex::new(pattern).map_err(|e| {
                EngineError::Config(format!("invalid blocked pattern '{}': {}", pattern, e))
            })?;
            blocked.push(regex);
        }
        let network_imports = if network_enabled {
            None
        } else {
            Some(Regex::new(NETWORK_IMPORT_PATTERN).map_err(|e| {
                EngineError::Config(format!("invalid network import pattern: {}", e))
            })?)
        };
        Ok(Self {
            blocked,
            network_imports,
            policy: policy.clone(),
        })
    }

    /// Static scan of generated source before it is allowed to run.
    pub fn precheck(&self, module: &GeneratedModule) -> SecurityVerdict {
        for pattern in &self.blocked {
            if pattern.is_match(&module.source_code) {
                return SecurityVerdict::Flagged(format!(
                    "blocked pattern '{}' in generated source",
                    pattern.as_str()
                ));
            }
        }
        if let Some(network) = &self.network_imports {
            if let Some(found) = network.find(&module.source_code) {
                return SecurityVerdict::Flagged(format!(
                    "network import '{}' while networking is disabled",
                    found.as_str().trim()
                ));
            }
        }
        SecurityVerdict::Clean
    }

    /// Compare observed side effects against the allowlists.
    pub fn postcheck(&self, effects: &EffectsJournal) -> SecurityVerdict {
        for write in &effects.writes {
            if !self.write_allowed(write) {
                return SecurityVerdict::Flagged(format!(
                    "wrote outside allowed roots: {}",
                    write
                ));
            }
        }
        for command in &effects.commands {
            if !self.command_allowed(command) {
                return SecurityVerdict::Flagged(format!("spawned command: {}", command));
            }
        }
        for connection in &effects.connections {
            if !self.connection_allowed(connection) {
                return SecurityVerdict::Flagged(format!(
                    "connected to unapproved endpoint: {}",
                    connection
                ));
            }
        }
        SecurityVerdict::Clean
    }

    /// Screen the raw request before any synthesis. Returns the refusal
    /// detail when a high-risk term matches.
    pub fn screen_request(&self, text: &str) -> Option<String> {
        let lowered = text.to_lowercase();
        for term in &self.policy.high_risk_terms {
            if lowered.contains(&term.to_lowercase()) {
                return Some(format!(
                    "request touches a high-risk area ('{}') and will not be automated",
                    term
                ));
            }
        }
        None
    }

    fn write_allowed(&self, write: &str) -> bool {
        let path = Path::new(write);
        self.policy
            .allowed_write_roots
            .iter()
            .any(|root| path.starts_with(root))
    }

    fn command_allowed(&self, command: &str) -> bool {
        let program = command.split_whitespace().next().unwrap_or(command);
        self.policy
            .allowed_commands
            .iter()
            .any(|allowed| allowed == program)
    }

    fn connection_allowed(&self, connection: &str) -> bool {
        self.policy
            .allowed_hosts
            .iter()
            .any(|host| connection.contains(host.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;

    fn gate() -> SecurityGate {
        SecurityGate::new(&SecurityPolicyConfig::default(), false).unwrap()
    }

    fn module(source: &str) -> GeneratedModule {
        GeneratedModule {
            module_name: "tool_x".to_string(),
            source_code: source.to_string(),
            category: Category::Custom,
            iteration: 1,
        }
    }

    #[test]
    fn test_precheck_flags_blocked_patterns() {
        let verdict = gate().precheck(&module(
            "import subprocess\nclass T:\n    def run(self, t):\n        subprocess.run(t)\n",
        ));
        assert!(!verdict.is_clean());
        assert!(verdict.detail().unwrap().contains("subprocess"));
    }

    #[test]
    fn test_precheck_flags_network_import_when_offline() {
        let verdict = gate().precheck(&module("import socket\nclass T:\n    pass\n"));
        assert!(!verdict.is_clean());
        assert!(verdict.detail().unwrap().contains("socket"));
    }

    #[test]
    fn test_precheck_allows_network_import_when_enabled() {
        let gate = SecurityGate::new(&SecurityPolicyConfig::default(), true).unwrap();
        let verdict = gate.precheck(&module("import urllib.request\nclass T:\n    pass\n"));
        assert!(verdict.is_clean());
    }

    #[test]
    fn test_precheck_clean_module() {
        let verdict = gate().precheck(&module(
            "import csv\nclass T:\n    def sum_column(self, p, c):\n        return 0\n",
        ));
        assert!(verdict.is_clean());
    }

    #[test]
    fn test_postcheck_flags_write_outside_roots() {
        let effects = EffectsJournal {
            writes: vec!["/home/user/.bashrc".to_string()],
            ..EffectsJournal::default()
        };
        let verdict = gate().postcheck(&effects);
        assert!(verdict.detail().unwrap().contains("/home/user/.bashrc"));
    }

    #[test]
    fn test_postcheck_allows_workspace_writes_only() {
        let inside = EffectsJournal {
            writes: vec!["/workspace/output/report.csv".to_string()],
            ..EffectsJournal::default()
        };
        assert!(gate().postcheck(&inside).is_clean());

        // Prefix tricks do not count as being under the root.
        let lookalike = EffectsJournal {
            writes: vec!["/workspace_evil/x".to_string()],
            ..EffectsJournal::default()
        };
        assert!(!gate().postcheck(&lookalike).is_clean());
    }

    #[test]
    fn test_postcheck_flags_commands_and_connections() {
        let commands = EffectsJournal {
            commands: vec!["rm -rf /tmp/x".to_string()],
            ..EffectsJournal::default()
        };
        assert!(!gate().postcheck(&commands).is_clean());

        let connections = EffectsJournal {
            connections: vec!["('203.0.113.9', 443)".to_string()],
            ..EffectsJournal::default()
        };
        assert!(!gate().postcheck(&connections).is_clean());
    }

    #[test]
    fn test_postcheck_respects_allowlists() {
        let mut policy = SecurityPolicyConfig::default();
        policy.allowed_commands = vec!["ls".to_string()];
        policy.allowed_hosts = vec!["api.example.com".to_string()];
        let gate = SecurityGate::new(&policy, true).unwrap();

        let effects = EffectsJournal {
            commands: vec!["ls -la".to_string()],
            connections: vec!["('api.example.com', 443)".to_string()],
            ..EffectsJournal::default()
        };
        assert!(gate.postcheck(&effects).is_clean());
    }

    #[test]
    fn test_screen_request_flags_high_risk_terms() {
        let detail = gate().screen_request("save my bank password to a file");
        assert!(detail.unwrap().contains("password"));
        assert!(gate().screen_request("sum a csv column").is_none());
    }

    #[test]
    fn test_invalid_pattern_is_startup_error() {
        let mut policy = SecurityPolicyConfig::default();
        policy.blocked_patterns.push("(unclosed".to_string());
        assert!(SecurityGate::new(&policy, false).is_err());
    }
}
