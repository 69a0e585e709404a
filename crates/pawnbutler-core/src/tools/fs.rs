// Pawnbutler Core — file tools
// read_file / write_file / edit_file / list_dir, confined to a per-agent
// workspace directory. Paths are always relative to the workspace; any
// attempt to step outside it is refused.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::atoms::error::EngineResult;
use crate::atoms::types::SafetyLevel;
use crate::tools::ToolDefinition;

/// The workspace directory for one agent: `<root>/workspaces/<agent_id>`.
pub fn agent_workspace(root: &Path, agent_id: &str) -> PathBuf {
    root.join("workspaces").join(agent_id)
}

/// Resolve a user-supplied relative path inside the workspace. Rejects
/// absolute paths and any `..` component.
fn resolve(workspace: &Path, raw: &str) -> EngineResult<PathBuf> {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        return Err(format!("path must be relative to the workspace: {}", raw).into());
    }
    for component in candidate.components() {
        if matches!(component, Component::ParentDir) {
            return Err(format!("path traversal ('..') is not allowed: {}", raw).into());
        }
    }
    Ok(workspace.join(candidate))
}

fn path_param(params: &Value) -> EngineResult<&str> {
    params
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing 'path' argument".into())
}

fn path_validator() -> crate::tools::ParamValidator {
    Arc::new(|params| {
        match params.get("path").and_then(Value::as_str) {
            Some(p) if !p.trim().is_empty() => Ok(()),
            _ => Err("missing 'path' argument".to_string()),
        }
    })
}

// ── Definitions ────────────────────────────────────────────────────────

/// The file tools, each confined to the calling agent's own workspace
/// under `root`.
pub fn definitions(root: PathBuf) -> Vec<ToolDefinition> {
    let read_root = root.clone();
    let write_root = root.clone();
    let edit_root = root.clone();
    let list_root = root;

    vec![
        ToolDefinition::new(
            "read_file",
            "Read a file from the agent workspace.",
            SafetyLevel::Safe,
            Arc::new(move |params, ctx| {
                let ws = agent_workspace(&read_root, &ctx.agent_id);
                Box::pin(async move { read_file(&ws, &params) })
            }),
        )
        .with_validator(path_validator()),
        ToolDefinition::new(
            "write_file",
            "Write (create or replace) a file in the agent workspace.",
            SafetyLevel::Moderate,
            Arc::new(move |params, ctx| {
                let ws = agent_workspace(&write_root, &ctx.agent_id);
                Box::pin(async move { write_file(&ws, &params) })
            }),
        )
        .with_validator(path_validator()),
        ToolDefinition::new(
            "edit_file",
            "Replace an exact text fragment in a workspace file.",
            SafetyLevel::Moderate,
            Arc::new(move |params, ctx| {
                let ws = agent_workspace(&edit_root, &ctx.agent_id);
                Box::pin(async move { edit_file(&ws, &params) })
            }),
        )
        .with_validator(path_validator()),
        ToolDefinition::new(
            "list_dir",
            "List entries of a workspace directory.",
            SafetyLevel::Safe,
            Arc::new(move |params, ctx| {
                let ws = agent_workspace(&list_root, &ctx.agent_id);
                Box::pin(async move { list_dir(&ws, &params) })
            }),
        ),
    ]
}

// ── Implementations ────────────────────────────────────────────────────

fn read_file(workspace: &Path, params: &Value) -> EngineResult<Value> {
    let path = resolve(workspace, path_param(params)?)?;
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    Ok(json!({ "path": path_param(params)?, "content": content }))
}

fn write_file(workspace: &Path, params: &Value) -> EngineResult<Value> {
    let path = resolve(workspace, path_param(params)?)?;
    let content = params
        .get("content")
        .and_then(Value::as_str)
        .ok_or("missing 'content' argument")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, content)?;
    Ok(json!({ "path": path_param(params)?, "bytesWritten": content.len() }))
}

fn edit_file(workspace: &Path, params: &Value) -> EngineResult<Value> {
    let path = resolve(workspace, path_param(params)?)?;
    let find = params
        .get("find")
        .and_then(Value::as_str)
        .ok_or("missing 'find' argument")?;
    let replace = params
        .get("replace")
        .and_then(Value::as_str)
        .ok_or("missing 'replace' argument")?;

    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let occurrences = content.matches(find).count();
    if occurrences == 0 {
        return Err(format!("'find' text not present in {}", path.display()).into());
    }
    std::fs::write(&path, content.replace(find, replace))?;
    Ok(json!({ "path": path_param(params)?, "replacements": occurrences }))
}

fn list_dir(workspace: &Path, params: &Value) -> EngineResult<Value> {
    let raw = params.get("path").and_then(Value::as_str).unwrap_or(".");
    let path = resolve(workspace, raw)?;
    let mut entries = Vec::new();
    if path.exists() {
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(json!({ "name": name, "isDir": is_dir }));
        }
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(json!({ "path": raw, "entries": entries }))
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        (dir, ws)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, ws) = workspace();
        write_file(&ws, &json!({"path": "notes/todo.txt", "content": "buy milk"})).unwrap();
        let result = read_file(&ws, &json!({"path": "notes/todo.txt"})).unwrap();
        assert_eq!(result["content"], "buy milk");
    }

    #[test]
    fn test_edit_replaces_all_occurrences() {
        let (_dir, ws) = workspace();
        write_file(&ws, &json!({"path": "a.txt", "content": "foo bar foo"})).unwrap();
        let result = edit_file(&ws, &json!({"path": "a.txt", "find": "foo", "replace": "baz"})).unwrap();
        assert_eq!(result["replacements"], 2);
        let read = read_file(&ws, &json!({"path": "a.txt"})).unwrap();
        assert_eq!(read["content"], "baz bar baz");
    }

    #[test]
    fn test_edit_missing_fragment_errors() {
        let (_dir, ws) = workspace();
        write_file(&ws, &json!({"path": "a.txt", "content": "hello"})).unwrap();
        assert!(edit_file(&ws, &json!({"path": "a.txt", "find": "absent", "replace": "x"})).is_err());
    }

    #[test]
    fn test_traversal_rejected() {
        let (_dir, ws) = workspace();
        assert!(read_file(&ws, &json!({"path": "../outside.txt"})).is_err());
        assert!(write_file(&ws, &json!({"path": "../../etc/passwd", "content": "x"})).is_err());
        assert!(read_file(&ws, &json!({"path": "/etc/passwd"})).is_err());
    }

    #[test]
    fn test_list_dir() {
        let (_dir, ws) = workspace();
        write_file(&ws, &json!({"path": "sub/file.txt", "content": "x"})).unwrap();
        let result = list_dir(&ws, &json!({"path": "."})).unwrap();
        let entries = result["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["name"], "sub");
        assert_eq!(entries[0]["isDir"], true);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let (_dir, ws) = workspace();
        let result = list_dir(&ws, &json!({"path": "nothere"})).unwrap();
        assert!(result["entries"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_agent_workspace_layout() {
        let root = Path::new("/state");
        assert_eq!(
            agent_workspace(root, "butler"),
            PathBuf::from("/state/workspaces/butler")
        );
    }
}
