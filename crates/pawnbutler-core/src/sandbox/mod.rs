// Pawnbutler Core — Container Sandbox
// Runs shell commands inside a locked-down Docker container: no network,
// capped memory/cpu/pids, read-only rootfs, no new privileges. Uses
// bollard (Docker API client); the daemon is probed once per instance and
// the answer memoised.
//
//   network_guard.rs — config validation + escape-pattern detection

pub mod network_guard;

use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::atoms::constants::{
    EXIT_BLOCKED, EXIT_TIMEOUT, MAX_COMMAND_OUTPUT, SANDBOX_DEFAULT_TIMEOUT_SECS,
    SANDBOX_PIDS_LIMIT,
};
use crate::atoms::error::EngineResult;
use crate::atoms::types::truncate_utf8;

use network_guard::NetworkGuard;

// ── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    None,
    Bridge,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
        }
    }
}

/// Sandbox container settings. Secure by default: no network, read-only
/// mounts, modest resource caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub image: String,
    pub network_mode: NetworkMode,
    /// Memory cap in bytes.
    pub memory_limit: i64,
    /// CPU cap in cores (1.0 = one core).
    pub cpu_limit: f64,
    /// Default per-command timeout in seconds.
    pub timeout_secs: u64,
    /// Host paths bind-mounted into the container at the same path.
    pub mount_paths: Vec<String>,
    /// Mounts are read-only unless this is set.
    pub allow_write_mount: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            image: "alpine:latest".to_string(),
            network_mode: NetworkMode::None,
            memory_limit: 256 * 1024 * 1024, // 256 MB
            cpu_limit: 1.0,
            timeout_secs: SANDBOX_DEFAULT_TIMEOUT_SECS,
            mount_paths: Vec::new(),
            allow_write_mount: false,
        }
    }
}

/// Result of one sandboxed command. `sandboxed` is true on every outcome
/// from this path, including refusals that never reached a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub sandboxed: bool,
    pub timed_out: bool,
}

/// Per-call overrides for `exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub workdir: Option<String>,
}

// ── Sandbox ────────────────────────────────────────────────────────────

pub struct Sandbox {
    config: SandboxConfig,
    guard: NetworkGuard,
    /// One-shot daemon probe, memoised per instance.
    availability: tokio::sync::OnceCell<bool>,
    /// At most one container at a time; exec serialises on this lock.
    container_id: tokio::sync::Mutex<Option<String>>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Sandbox {
            config,
            guard: NetworkGuard::new(),
            availability: tokio::sync::OnceCell::new(),
            container_id: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn guard(&self) -> &NetworkGuard {
        &self.guard
    }

    /// Whether a Docker daemon answers. Probed once; later calls return
    /// the memoised answer.
    pub async fn is_available(&self) -> bool {
        *self
            .availability
            .get_or_init(|| async {
                match Docker::connect_with_local_defaults() {
                    Ok(docker) => match docker.ping().await {
                        Ok(_) => {
                            info!("[sandbox] Docker daemon is available");
                            true
                        }
                        Err(e) => {
                            warn!("[sandbox] Docker ping failed: {}", e);
                            false
                        }
                    },
                    Err(e) => {
                        warn!("[sandbox] Cannot connect to Docker: {}", e);
                        false
                    }
                }
            })
            .await
    }

    /// Execute a command inside the sandbox container.
    ///
    /// Order of defence:
    ///   1. Escape-pattern scan: a hit returns exit 126 and the command
    ///      is never dispatched anywhere.
    ///   2. Daemon availability (memoised probe).
    ///   3. Container creation (network-guard-validated config) + exec.
    ///
    /// Timeouts return exit 124; command failures return the runtime's
    /// own exit code.
    pub async fn exec(&self, command: &str, options: ExecOptions) -> EngineResult<SandboxExecResult> {
        // 1. Escape check happens before anything touches Docker.
        let threats = self.guard.scan_command(command);
        if !threats.is_empty() {
            let descriptions: Vec<String> =
                threats.iter().map(|t| t.description.clone()).collect();
            return Ok(SandboxExecResult {
                exit_code: EXIT_BLOCKED,
                stdout: String::new(),
                stderr: format!("escape attempt detected: {}", descriptions.join("; ")),
                sandboxed: true,
                timed_out: false,
            });
        }

        // 2. Daemon probe.
        if !self.is_available().await {
            return Err("sandbox unavailable: no container runtime".into());
        }
        let docker = Docker::connect_with_local_defaults()?;

        // 3. Serialise on the single container.
        let mut container_guard = self.container_id.lock().await;
        let container_id = match container_guard.as_ref() {
            Some(id) => id.clone(),
            None => {
                let id = self.create_container(&docker).await?;
                *container_guard = Some(id.clone());
                id
            }
        };

        let timeout = options
            .timeout
            .unwrap_or(Duration::from_secs(self.config.timeout_secs));

        let exec = docker
            .create_exec(
                &container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: options.workdir.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        let collect = async {
            match docker.start_exec(&exec.id, None).await? {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(chunk) = output.next().await {
                        match chunk {
                            Ok(bollard::container::LogOutput::StdOut { message }) => {
                                stdout.push_str(&String::from_utf8_lossy(&message));
                            }
                            Ok(bollard::container::LogOutput::StdErr { message }) => {
                                stderr.push_str(&String::from_utf8_lossy(&message));
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("[sandbox] Error reading exec output: {}", e);
                                break;
                            }
                        }
                    }
                }
                StartExecResults::Detached => {}
            }
            Ok::<(), crate::atoms::error::EngineError>(())
        };

        let timed_out = tokio::time::timeout(timeout, collect).await.is_err();

        let exit_code = if timed_out {
            warn!(
                "[sandbox] Command timed out after {:?}: {}",
                timeout,
                truncate_utf8(command, 100)
            );
            // The stuck process would poison later execs; scrap the
            // container and start fresh next time.
            let _ = docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions { force: true, ..Default::default() }),
                )
                .await;
            *container_guard = None;
            EXIT_TIMEOUT
        } else {
            docker
                .inspect_exec(&exec.id)
                .await
                .ok()
                .and_then(|i| i.exit_code)
                .unwrap_or(-1)
        };

        cap_output(&mut stdout);
        cap_output(&mut stderr);

        Ok(SandboxExecResult {
            exit_code,
            stdout,
            stderr,
            sandboxed: true,
            timed_out,
        })
    }

    /// Launch the container: `--network none`, memory cap, cpu cap,
    /// pids limit, read-only rootfs, no-new-privileges, optional binds
    /// (`ro` unless writes were explicitly allowed).
    async fn create_container(&self, docker: &Docker) -> EngineResult<String> {
        self.guard.validate_config(&self.config)?;

        let suffix = uuid::Uuid::new_v4().to_string();
        let container_name = format!(
            "pawnbutler-sandbox-{}",
            suffix.split('-').next().unwrap_or("x")
        );

        let binds: Vec<String> = self
            .config
            .mount_paths
            .iter()
            .map(|path| {
                let mode = if self.config.allow_write_mount { "rw" } else { "ro" };
                format!("{}:{}:{}", path, path, mode)
            })
            .collect();

        let host_config = HostConfig {
            memory: Some(self.config.memory_limit),
            nano_cpus: Some((self.config.cpu_limit * 1_000_000_000.0) as i64),
            pids_limit: Some(SANDBOX_PIDS_LIMIT),
            network_mode: Some(self.config.network_mode.as_str().to_string()),
            readonly_rootfs: Some(true),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            binds: if binds.is_empty() { None } else { Some(binds) },
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            // Keep-alive entrypoint; real work arrives via exec.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(false),
            host_config: Some(host_config),
            env: Some(vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ]),
            ..Default::default()
        };

        let created = docker
            .create_container(
                Some(CreateContainerOptions { name: container_name.as_str(), platform: None }),
                container_config,
            )
            .await?;
        let container_id = created.id.clone();

        docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| format!("Failed to start sandbox container: {}", e))?;

        // Trust but verify: the running container must really be offline.
        if let Err(e) = self.guard.verify_isolation(docker, &container_id).await {
            let _ = docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions { force: true, ..Default::default() }),
                )
                .await;
            return Err(e);
        }

        info!(
            "[sandbox] Created container {} (image={})",
            truncate_utf8(&container_id, 12),
            self.config.image
        );
        Ok(container_id)
    }

    /// Remove the container. Idempotent: repeated calls and
    /// already-removed containers are fine.
    pub async fn destroy(&self) -> EngineResult<()> {
        let mut container_guard = self.container_id.lock().await;
        let Some(container_id) = container_guard.take() else {
            return Ok(());
        };
        let docker = Docker::connect_with_local_defaults()?;
        match docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await
        {
            Ok(_) => {
                info!("[sandbox] Removed container {}", truncate_utf8(&container_id, 12));
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                // Already gone; that is the state we wanted.
                Ok(())
            }
            Err(e) => {
                warn!("[sandbox] Failed to remove container: {}", e);
                Err(e.into())
            }
        }
    }
}

/// Truncate command output to keep tool results bounded; the cut is
/// noted, not silent.
fn cap_output(output: &mut String) {
    if output.len() > MAX_COMMAND_OUTPUT {
        let kept = truncate_utf8(output, MAX_COMMAND_OUTPUT).to_string();
        *output = kept;
        output.push_str("\n... [output truncated]");
    }
}

/// Format a sandbox result for inclusion in a tool response.
pub fn format_exec_result(result: &SandboxExecResult) -> String {
    let mut output = String::new();
    if result.timed_out {
        output.push_str("[sandbox: command timed out]\n");
    }
    if !result.stdout.is_empty() {
        output.push_str(&result.stdout);
    }
    if !result.stderr.is_empty() {
        if !output.is_empty() {
            output.push_str("\n--- stderr ---\n");
        }
        output.push_str(&result.stderr);
    }
    if output.is_empty() {
        output.push_str(&format!("(exit code: {})", result.exit_code));
    }
    output
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_secure() {
        let config = SandboxConfig::default();
        assert_eq!(config.network_mode, NetworkMode::None);
        assert!(!config.allow_write_mount);
        assert_eq!(config.memory_limit, 256 * 1024 * 1024);
        assert_eq!(config.timeout_secs, 30);
        assert!(config.mount_paths.is_empty());
    }

    #[tokio::test]
    async fn test_escape_attempt_blocked_without_dispatch() {
        // Works with or without a Docker daemon: the scan runs first.
        let sandbox = Sandbox::new(SandboxConfig::default());
        let result = sandbox
            .exec("nsenter --target 1 --mount", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 126);
        assert!(result.sandboxed);
        assert!(result.stderr.contains("escape attempt"));
    }

    #[tokio::test]
    async fn test_destroy_idempotent_without_container() {
        let sandbox = Sandbox::new(SandboxConfig::default());
        // Never created a container; both calls are clean no-ops.
        // (Requires no daemon: take() short-circuits before connecting.)
        sandbox.destroy().await.unwrap();
        sandbox.destroy().await.unwrap();
    }

    #[test]
    fn test_cap_output_notes_truncation() {
        let mut s = "x".repeat(MAX_COMMAND_OUTPUT + 100);
        cap_output(&mut s);
        assert!(s.len() <= MAX_COMMAND_OUTPUT + 30);
        assert!(s.ends_with("[output truncated]"));
    }

    #[test]
    fn test_format_exec_result() {
        let result = SandboxExecResult {
            exit_code: 0,
            stdout: "out\n".into(),
            stderr: "warn\n".into(),
            sandboxed: true,
            timed_out: false,
        };
        let formatted = format_exec_result(&result);
        assert!(formatted.contains("out"));
        assert!(formatted.contains("--- stderr ---"));

        let timeout = SandboxExecResult {
            exit_code: 124,
            stdout: String::new(),
            stderr: String::new(),
            sandboxed: true,
            timed_out: true,
        };
        let formatted = format_exec_result(&timeout);
        assert!(formatted.contains("timed out"));
    }

    #[test]
    fn test_config_wire_format() {
        let config = SandboxConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"networkMode\":\"none\""));
        assert!(json.contains("\"allowWriteMount\":false"));
        assert!(json.contains("\"mountPaths\":[]"));
    }
}
