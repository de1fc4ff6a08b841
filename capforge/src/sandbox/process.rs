//! Process-based sandbox runtime.
//!
//! Uses bubblewrap (bwrap) for filesystem and namespace isolation on Linux,
//! with rlimits applied to the child either way. When bubblewrap is not
//! available and the isolation mode allows it, execution falls back to a
//! resource-limited plain process in a throwaway workspace.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::config::{IsolationMode, SandboxConfig};
use crate::error::{EngineError, EngineResult};
use crate::sandbox::driver::{self, DriverProgress};
use crate::sandbox::{EffectsJournal, RunOutput, SandboxJob, SandboxRuntime};

const NAMESPACE_HINT: &str = "\n\nbwrap could not create a user namespace. \
    Raise user.max_user_namespaces via sysctl, or set isolation = \"process\" \
    in the sandbox config to run without the mount jail.";

pub struct ProcessSandbox {
    config: SandboxConfig,
    use_bubblewrap: bool,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> EngineResult<Self> {
        let use_bubblewrap = match config.isolation {
            IsolationMode::Bubblewrap => {
                if !Self::is_bwrap_available() {
                    return Err(EngineError::Sandbox(
                        "bubblewrap not found. Install with: sudo apt install bubblewrap"
                            .to_string(),
                    ));
                }
                true
            }
            IsolationMode::Auto => {
                let available = Self::is_bwrap_available();
                if !available {
                    warn!("bwrap not found; candidate modules will run without a mount jail");
                }
                available
            }
            IsolationMode::Process => false,
        };
        Ok(Self {
            config,
            use_bubblewrap,
        })
    }

    fn is_bwrap_available() -> bool {
        std::process::Command::new("which")
            .arg("bwrap")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn stage_workspace(&self, workspace: &Path, job: &SandboxJob) -> EngineResult<()> {
        fs::create_dir_all(workspace).await?;
        fs::write(
            workspace.join(format!("{}.py", job.module_name)),
            &job.source_code,
        )
        .await?;
        fs::write(workspace.join(driver::DRIVER_FILE), driver::DRIVER_SOURCE).await?;
        fs::write(workspace.join(driver::JOB_FILE), &job.payload).await?;
        for fixture in &job.fixtures {
            let dest = workspace.join(&fixture.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&dest, &fixture.contents).await?;
        }
        Ok(())
    }

    fn jailed_command(&self, workspace: &Path, network: bool) -> Command {
        let mut cmd = Command::new("bwrap");

        cmd.arg("--unshare-all");
        cmd.arg("--die-with-parent");
        cmd.arg("--new-session");
        if network {
            cmd.arg("--share-net");
        }

        cmd.arg("--ro-bind").arg("/usr").arg("/usr");
        for dir in ["/lib", "/lib64", "/bin", "/sbin"] {
            if Path::new(dir).exists() {
                cmd.arg("--ro-bind").arg(dir).arg(dir);
            }
        }
        if network {
            for path in ["/etc/ssl/certs", "/etc/resolv.conf"] {
                if Path::new(path).exists() {
                    cmd.arg("--ro-bind").arg(path).arg(path);
                }
            }
        }

        cmd.arg("--proc").arg("/proc");
        cmd.arg("--dev").arg("/dev");
        cmd.arg("--tmpfs").arg("/tmp");
        cmd.arg("--bind").arg(workspace).arg("/workspace");
        cmd.arg("--chdir").arg("/workspace");

        cmd.arg(&self.config.python_bin);
        cmd.arg(driver::DRIVER_FILE);
        cmd
    }

    fn unjailed_command(&self, workspace: &Path) -> Command {
        let mut cmd = Command::new(&self.config.python_bin);
        cmd.arg(driver::DRIVER_FILE);
        cmd.current_dir(workspace);
        cmd
    }

    fn apply_limits(&self, cmd: &mut Command) {
        let mem_limit = self.config.memory_mb * 1024 * 1024;
        let cpu_limit = self.config.cpu_seconds;
        let nproc_limit = self.config.max_processes;

        unsafe {
            cmd.pre_exec(move || {
                if mem_limit > 0 {
                    let rlimit = libc::rlimit {
                        rlim_cur: mem_limit as libc::rlim_t,
                        rlim_max: mem_limit as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_RSS, &rlimit) != 0 {}
                }
                if cpu_limit > 0 {
                    let rlimit = libc::rlimit {
                        rlim_cur: cpu_limit as libc::rlim_t,
                        rlim_max: cpu_limit as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {}
                }
                if nproc_limit > 0 {
                    let rlimit = libc::rlimit {
                        rlim_cur: nproc_limit as libc::rlim_t,
                        rlim_max: nproc_limit as libc::rlim_t,
                    };
                    libc::setrlimit(libc::RLIMIT_NPROC, &rlimit);
                }
                Ok(())
            });
        }
    }

    async fn collect(
        &self,
        mut child: Child,
        workspace: &Path,
        timeout_ms: u64,
    ) -> EngineResult<RunOutput> {
        let mut stdout_handle = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Sandbox("failed to capture stdout".to_string()))?;
        let mut stderr_handle = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Sandbox("failed to capture stderr".to_string()))?;

        let started = Instant::now();
        let wait_result = timeout(Duration::from_millis(timeout_ms), child.wait()).await;

        let (exit_code, timed_out) = match wait_result {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => {
                return Err(EngineError::Sandbox(format!("process error: {}", e)));
            }
            Err(_) => {
                let _ = child.kill().await;
                (None, true)
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        stdout_handle.read_to_end(&mut stdout_buf).await?;
        stderr_handle.read_to_end(&mut stderr_buf).await?;

        let stdout = self.truncate(String::from_utf8_lossy(&stdout_buf).to_string());
        let mut stderr = self.truncate(String::from_utf8_lossy(&stderr_buf).to_string());

        if exit_code.map_or(false, |c| c != 0)
            && (stderr.contains("Creating new namespace failed")
                || stderr.contains("Resource temporarily unavailable"))
        {
            stderr.push_str(NAMESPACE_HINT);
        }

        let effects = read_json_file::<EffectsJournal>(&workspace.join(driver::EFFECTS_FILE)).await;
        let progress = read_json_file::<DriverProgress>(&workspace.join(driver::PROGRESS_FILE))
            .await
            .results;

        Ok(RunOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
            duration_ms,
            effects,
            progress,
        })
    }

    fn truncate(&self, mut text: String) -> String {
        let cap = self.config.max_output_bytes as usize;
        if cap > 0 && text.len() > cap {
            let mut cut = cap;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("\n[output truncated]");
        }
        text
    }
}

async fn read_json_file<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => T::default(),
    }
}

#[async_trait]
impl SandboxRuntime for ProcessSandbox {
    async fn run(&self, job: &SandboxJob) -> EngineResult<RunOutput> {
        let work_dir = tempfile::Builder::new()
            .prefix("capforge-sbx-")
            .tempdir()
            .map_err(|e| EngineError::Sandbox(format!("failed to create temp dir: {}", e)))?;
        let workspace = work_dir.path().join("workspace");
        self.stage_workspace(&workspace, job).await?;

        let network = job.network_enabled && self.config.network_enabled;
        let mut cmd = if self.use_bubblewrap {
            self.jailed_command(&workspace, network)
        } else {
            self.unjailed_command(&workspace)
        };
        self.apply_limits(&mut cmd);
        cmd.env("PYTHONDONTWRITEBYTECODE", "1");
        cmd.env("PYTHONUNBUFFERED", "1");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| EngineError::Sandbox(format!("failed to spawn sandbox: {}", e)))?;

        self.collect(child, &workspace, job.timeout_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(isolation: IsolationMode) -> ProcessSandbox {
        let config = SandboxConfig {
            isolation,
            ..SandboxConfig::default()
        };
        ProcessSandbox::new(config).unwrap()
    }

    #[test]
    fn test_jailed_command_binds_workspace() {
        let sbx = ProcessSandbox {
            config: SandboxConfig::default(),
            use_bubblewrap: true,
        };
        let cmd = sbx.jailed_command(Path::new("/tmp/ws"), false);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"--unshare-all".to_string()));
        assert!(args.contains(&"--die-with-parent".to_string()));
        assert!(args.contains(&"/workspace".to_string()));
        assert!(!args.contains(&"--share-net".to_string()));
        assert!(args.contains(&driver::DRIVER_FILE.to_string()));
    }

    #[test]
    fn test_jailed_command_network_flag() {
        let sbx = ProcessSandbox {
            config: SandboxConfig::default(),
            use_bubblewrap: true,
        };
        let cmd = sbx.jailed_command(Path::new("/tmp/ws"), true);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"--share-net".to_string()));
    }

    #[test]
    fn test_truncate_caps_output() {
        let sbx = sandbox(IsolationMode::Process);
        let mut config = sbx.config.clone();
        config.max_output_bytes = 8;
        let sbx = ProcessSandbox {
            config,
            use_bubblewrap: false,
        };
        let out = sbx.truncate("0123456789abcdef".to_string());
        assert!(out.starts_with("01234567"));
        assert!(out.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn test_stage_workspace_writes_fixtures() {
        let sbx = sandbox(IsolationMode::Process);
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        let job = SandboxJob {
            module_name: "tool_x".to_string(),
            source_code: "class T:\n    pass\n".to_string(),
            payload: "{}".to_string(),
            fixtures: vec![crate::sandbox::Fixture {
                path: "input/sample.csv".to_string(),
                contents: "name,value\na,1\n".to_string(),
            }],
            timeout_ms: 1000,
            network_enabled: false,
        };
        sbx.stage_workspace(&workspace, &job).await.unwrap();
        assert!(workspace.join("tool_x.py").exists());
        assert!(workspace.join(driver::DRIVER_FILE).exists());
        assert!(workspace.join(driver::JOB_FILE).exists());
        let csv = std::fs::read_to_string(workspace.join("input/sample.csv")).unwrap();
        assert!(csv.contains("name,value"));
    }
}
