//! External tool execution with captured output.

use std::ffi::OsStr;
use std::process::Command;

use crate::errors::{DupError, DupResult};

/// Captured result of one external tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run `tool` with `args`, capturing stdout and stderr.
///
/// A non-zero exit is not an error here; callers that require one use
/// [`run_ok`]. Failure to spawn at all (binary missing, not executable) is
/// [`DupError::Tool`].
pub fn run<S: AsRef<OsStr>>(tool: &'static str, args: &[S]) -> DupResult<CommandOutput> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| DupError::tool(tool, format!("failed to spawn: {e}")))?;

    let out = CommandOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    tracing::debug!(
        tool,
        args = %args
            .iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" "),
        code = out.code,
        "external tool finished"
    );
    Ok(out)
}

/// Run `tool` and require a zero exit, surfacing stderr on failure.
pub fn run_ok<S: AsRef<OsStr>>(tool: &'static str, args: &[S]) -> DupResult<CommandOutput> {
    let out = run(tool, args)?;
    if !out.success() {
        let message = if out.stderr.trim().is_empty() {
            format!("exit code {}", out.code)
        } else {
            out.stderr.trim().to_string()
        };
        return Err(DupError::tool(tool, message));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let out = run("sh", &["-c", "echo hello"]).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_tolerates_nonzero_exit() {
        let out = run("sh", &["-c", "exit 3"]).unwrap();
        assert!(!out.success());
        assert_eq!(out.code, 3);
    }

    #[test]
    fn test_run_ok_surfaces_stderr() {
        let err = run_ok("sh", &["-c", "echo broken >&2; exit 1"]).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_missing_binary_is_tool_error() {
        let err = run::<&str>("definitely-not-a-real-tool-qq", &[]).unwrap_err();
        assert!(matches!(err, DupError::Tool { .. }));
    }
}
