// Pawnbutler Core — exec_command tool
// Shell execution, sandbox-first: commands run inside the Docker sandbox
// whenever it is available. Without a sandbox the tool refuses unless the
// caller explicitly opts into host execution.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde_json::{json, Value};

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::SafetyLevel;
use crate::sandbox::{ExecOptions, Sandbox};
use crate::tools::ToolDefinition;

/// Host-execution ceiling; sandbox runs use the sandbox's own timeout.
const HOST_TIMEOUT_MAX_SECS: u64 = 600;

pub fn definition(sandbox: Arc<Sandbox>) -> ToolDefinition {
    ToolDefinition::new(
        "exec_command",
        "Execute a shell command. Runs inside the network-isolated sandbox \
         container when available; set allowUnsandboxed=true to permit host \
         execution as a fallback.",
        SafetyLevel::Dangerous,
        Arc::new(move |params, _ctx| {
            let sandbox = sandbox.clone();
            Box::pin(async move { execute_exec(&params, &sandbox).await })
        }),
    )
    .with_validator(Arc::new(|params| {
        match params.get("command").and_then(Value::as_str) {
            Some(c) if !c.trim().is_empty() => Ok(()),
            _ => Err("missing 'command' argument".to_string()),
        }
    }))
}

async fn execute_exec(params: &Value, sandbox: &Sandbox) -> EngineResult<Value> {
    let command = params
        .get("command")
        .and_then(Value::as_str)
        .ok_or("exec_command: missing 'command' argument")?;
    let timeout_secs = params.get("timeout").and_then(Value::as_u64);
    let workdir = params.get("workdir").and_then(Value::as_str).map(str::to_string);
    let allow_unsandboxed = params
        .get("allowUnsandboxed")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    info!("[tools] exec_command: {}", crate::atoms::types::truncate_utf8(command, 200));

    if sandbox.is_available().await {
        let result = sandbox
            .exec(
                command,
                ExecOptions {
                    timeout: timeout_secs.map(Duration::from_secs),
                    workdir,
                },
            )
            .await?;
        return Ok(json!({
            "exitCode": result.exit_code,
            "stdout": result.stdout,
            "stderr": result.stderr,
            "sandboxed": result.sandboxed,
            "timedOut": result.timed_out,
        }));
    }

    if !allow_unsandboxed {
        return Err(EngineError::tool(
            "exec_command",
            "sandbox unavailable; refusing host execution (pass allowUnsandboxed=true to override)",
        ));
    }

    warn!("[tools] exec_command: sandbox unavailable, running on host (explicitly allowed)");
    host_exec(command, timeout_secs, workdir.as_deref()).await
}

/// Host fallback path. Same result shape, `sandboxed: false`.
async fn host_exec(command: &str, timeout_secs: Option<u64>, workdir: Option<&str>) -> EngineResult<Value> {
    use tokio::process::Command as TokioCommand;

    let timeout = Duration::from_secs(timeout_secs.unwrap_or(120).min(HOST_TIMEOUT_MAX_SECS));

    let mut builder = TokioCommand::new("sh");
    builder
        .args(["-c", command])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        builder.current_dir(dir);
    }

    let child = builder
        .spawn()
        .map_err(|e| EngineError::Process(format!("Failed to spawn process: {}", e)))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            // Child is killed on drop via kill_on_drop(true).
            return Ok(json!({
                "exitCode": 124,
                "stdout": "",
                "stderr": format!("command timed out after {}s", timeout.as_secs()),
                "sandboxed": false,
                "timedOut": true,
            }));
        }
    };

    let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
    cap(&mut stdout);
    cap(&mut stderr);

    Ok(json!({
        "exitCode": output.status.code().unwrap_or(-1),
        "stdout": stdout,
        "stderr": stderr,
        "sandboxed": false,
        "timedOut": false,
    }))
}

fn cap(s: &mut String) {
    use crate::atoms::constants::MAX_COMMAND_OUTPUT;
    if s.len() > MAX_COMMAND_OUTPUT {
        let kept = crate::atoms::types::truncate_utf8(s, MAX_COMMAND_OUTPUT).to_string();
        *s = kept;
        s.push_str("\n... [output truncated]");
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
