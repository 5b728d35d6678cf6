//! Shell command execution with safe quoting.
//!
//! Network surgery goes through the standard `ip`/`iptables` tools. All
//! values interpolated into a command line pass through [`shellquote`] to
//! rule out injection from container- or operator-supplied names.
//!
//! Commands run asynchronously via [`exec`]; the synchronous
//! [`exec_blocking`] variant exists for the namespace path, where commands
//! must be spawned from the thread currently switched into the container's
//! namespace.

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{FabricError, FabricResult};

/// Path to the `ip` command for link/address/route configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `iptables` command for NAT/forwarding rules.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes the characters that keep
/// meaning inside them (`$`, `` ` ``, `"`, `\`, newline).
///
/// # Example
///
/// ```
/// use fabricd::shell::shellquote;
///
/// assert_eq!(shellquote("fabric0"), "\"fabric0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The trimmed stdout output.
    pub stdout: String,
    /// The trimmed stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

fn into_result(cmd: &str, output: std::process::Output) -> ExecResult {
    let exit_code = output.status.code().unwrap_or(-1);
    let result = ExecResult {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %cmd, "command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "command failed"
        );
    }
    result
}

/// Executes a shell command asynchronously through `/bin/sh -c`.
pub async fn exec(cmd: &str) -> FabricResult<ExecResult> {
    tracing::debug!(command = %cmd, "executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| FabricError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    Ok(into_result(cmd, output))
}

/// Executes a shell command and fails on non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> FabricResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(FabricError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

/// Synchronous variant of [`exec`].
///
/// Child processes inherit the namespaces of the spawning thread, so the
/// in-namespace configuration steps must spawn from the pinned thread, not
/// from the async runtime.
pub fn exec_blocking(cmd: &str) -> FabricResult<ExecResult> {
    tracing::debug!(command = %cmd, "executing shell command (blocking)");

    let output = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| FabricError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    Ok(into_result(cmd, output))
}

/// Synchronous variant of [`exec_or_throw`].
pub fn exec_blocking_or_throw(cmd: &str) -> FabricResult<String> {
    let result = exec_blocking(cmd)?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(FabricError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
