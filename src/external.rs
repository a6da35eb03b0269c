/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/external.rs
 *
 * External tool invocation helper. Two tools are shelled out to
 * opportunistically — `istioctl x create-remote-secret` and `istioctl
 * proxy-status` — both with a 30s budget and both demoted to
 * `Error::ExternalTool` on any failure so callers can fall back to an
 * in-process alternative rather than treating the tool's absence as fatal.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::process::Command;

pub const EXTERNAL_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs `program args...` with a 30s budget, returning stdout on a
/// zero-exit-status completion. Any failure — spawn error, non-zero exit,
/// timeout — becomes `Error::ExternalTool` carrying a human-readable reason;
/// the error never distinguishes "tool missing" from "tool failed" because
/// callers treat all of it identically (swallow, fall back).
pub async fn run(program: &str, args: &[&str]) -> Result<String> {
    let mut command = Command::new(program);
    command.args(args);

    let output = tokio::time::timeout(EXTERNAL_TOOL_TIMEOUT, command.output())
        .await
        .map_err(|_| Error::ExternalTool(format!("{} timed out after {:?}", program, EXTERNAL_TOOL_TIMEOUT)))?
        .map_err(|e| Error::ExternalTool(format!("failed to spawn {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::ExternalTool(format!(
            "{} exited with {}: {}",
            program, output.status, stderr
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Returns `true` iff `program` is on `PATH`. Checked before `run` so a
/// missing tool produces a concise "not installed" log line instead of a
/// spawn-error stack.
pub fn is_available(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout_on_success() {
        let out = run("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit_as_external_tool_error() {
        let err = run("false", &[]).await.unwrap_err();
        assert!(matches!(err, Error::ExternalTool(_)));
    }

    #[test]
    fn is_available_is_false_for_a_nonexistent_binary() {
        assert!(!is_available("definitely-not-a-real-binary-xyz"));
    }
}
