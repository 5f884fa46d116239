//! Shared helpers for running host tools on behalf of an instance owner.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::process::Command;

use crate::identity::Owner;
use crate::server::error::{ServerError, ServerResult};

/// Tools the daemon shells out to. Missing ones only disable the features using them.
pub const REQUIRED_TOOLS: [&str; 5] = ["screen", "tar", "rsync", "java", "rdiff-backup"];

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resolve a tool through `PATH`.
pub fn resolve_binary(tool: &str) -> ServerResult<PathBuf> {
    which::which(tool).map_err(|e| ServerError::tool(tool, format!("not found in PATH: {}", e)))
}

/// `which` lookup for every tool in [`REQUIRED_TOOLS`].
pub fn dependencies() -> BTreeMap<&'static str, Option<PathBuf>> {
    REQUIRED_TOOLS
        .iter()
        .map(|tool| (*tool, which::which(tool).ok()))
        .collect()
}

/// Build a command running in `cwd`, dropped to `owner` when given.
pub fn tool_command<I, S>(binary: &Path, args: I, cwd: &Path, owner: Option<Owner>) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(binary);
    cmd.args(args).current_dir(cwd).stdin(Stdio::null());
    if let Some(owner) = owner {
        cmd.uid(owner.uid).gid(owner.gid);
    }
    cmd
}

/// Captured result of a tool run. Only stdout is kept.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
}

impl ToolOutput {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Run `tool` to completion and require a zero exit status.
pub async fn run_tool<I, S>(tool: &str, args: I, cwd: &Path, owner: Option<Owner>) -> ServerResult<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let binary = resolve_binary(tool)?;
    let status = tool_command(&binary, args, cwd, owner)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| ServerError::tool(tool, format!("spawn failed: {}", e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(ServerError::tool(tool, format!("exited with {}", status)))
    }
}

/// Run `tool` and hand back its stdout regardless of exit status.
pub async fn run_capture<I, S>(tool: &str, args: I, cwd: &Path, owner: Option<Owner>) -> ServerResult<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let binary = resolve_binary(tool)?;
    let output = tool_command(&binary, args, cwd, owner)
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| ServerError::tool(tool, format!("spawn failed: {}", e)))?;

    Ok(ToolOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}

/// `"true"`, `"1"`, `"yes"`, `"on"` (any case) are true; everything else is false.
pub fn parse_bool(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true") | Some("1") | Some("yes") | Some("on")
    )
}

/// Leading integer of a string, the way a lenient config reader would take it.
pub fn parse_leading_int(value: Option<&str>) -> Option<i64> {
    let value = value?.trim();
    let (sign, digits) = match value.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, value),
    };
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool(Some("true")));
        assert!(parse_bool(Some(" TRUE ")));
        assert!(parse_bool(Some("1")));
        assert!(!parse_bool(Some("false")));
        assert!(!parse_bool(Some("")));
        assert!(!parse_bool(None));
    }

    #[test]
    fn test_parse_leading_int() {
        assert_eq!(parse_leading_int(Some("256")), Some(256));
        assert_eq!(parse_leading_int(Some("512M")), Some(512));
        assert_eq!(parse_leading_int(Some("-3")), Some(-3));
        assert_eq!(parse_leading_int(Some("abc")), None);
        assert_eq!(parse_leading_int(None), None);
    }

    #[tokio::test]
    async fn test_missing_tool_is_external_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_tool("definitely-not-a-real-tool-xyz", ["--help"], dir.path(), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "EXTERNAL_TOOL_FAILED");
    }
}
