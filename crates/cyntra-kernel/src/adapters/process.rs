//! Shared plumbing for CLI-backed toolchains.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{AdapterOutcome, InvocationRequest};

/// One CLI run of a toolchain.
pub(crate) struct CliInvocation<'a> {
    pub toolchain: &'a str,
    pub program: &'a str,
    pub args: Vec<String>,
    pub env: &'a HashMap<String, String>,
    /// Piped to stdin when set
    pub stdin: Option<&'a str>,
}

/// Prompt file written into the sandbox before invocation.
pub(crate) fn write_prompt(request: &InvocationRequest) -> Result<PathBuf> {
    let prompt_path = request.sandbox_path.join("prompt.md");
    std::fs::write(&prompt_path, &request.prompt)
        .with_context(|| format!("Failed to write {}", prompt_path.display()))?;
    Ok(prompt_path)
}

/// Run the CLI in the sandbox, bounded by the request timeout.
pub(crate) async fn run_cli(
    invocation: CliInvocation<'_>,
    request: &InvocationRequest,
) -> AdapterOutcome {
    tracing::info!(
        issue_id = %request.issue_id,
        workcell_id = %request.workcell_id,
        toolchain = invocation.toolchain,
        "Executing toolchain"
    );

    match spawn_and_wait(&invocation, request).await {
        Ok(outcome) => outcome,
        Err(e) => AdapterOutcome::failed(format!("{e:#}")),
    }
}

async fn spawn_and_wait(
    invocation: &CliInvocation<'_>,
    request: &InvocationRequest,
) -> Result<AdapterOutcome> {
    std::fs::create_dir_all(&request.log_dir)
        .with_context(|| format!("Failed to create {}", request.log_dir.display()))?;
    let stdout_path = request
        .log_dir
        .join(format!("{}-stdout.log", invocation.toolchain));
    let stderr_path = request
        .log_dir
        .join(format!("{}-stderr.log", invocation.toolchain));

    let mut command = Command::new(invocation.program);
    command
        .args(&invocation.args)
        .envs(invocation.env)
        .current_dir(&request.sandbox_path)
        .stdout(Stdio::from(std::fs::File::create(&stdout_path)?))
        .stderr(Stdio::from(std::fs::File::create(&stderr_path)?))
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to execute {} CLI", invocation.program))?;

    if let (Some(input), Some(mut stdin)) = (invocation.stdin, child.stdin.take()) {
        stdin.write_all(input.as_bytes()).await?;
        drop(stdin);
    }

    let waited = tokio::time::timeout(request.timeout, child.wait()).await;
    let stdout = std::fs::read_to_string(&stdout_path).unwrap_or_default();
    let tokens = parse_tokens_used(&stdout).unwrap_or(0);

    let status = match waited {
        Ok(status) => status?,
        Err(_) => {
            let _ = child.kill().await;
            tracing::warn!(
                workcell_id = %request.workcell_id,
                toolchain = invocation.toolchain,
                timeout_secs = request.timeout.as_secs(),
                "Toolchain timed out"
            );
            return Ok(AdapterOutcome::timed_out(tokens));
        }
    };

    if status.success() {
        return Ok(AdapterOutcome::succeeded(tokens));
    }

    let stderr = std::fs::read_to_string(&stderr_path).unwrap_or_default();
    let detail = format!(
        "{} exited with {}: {}",
        invocation.program,
        status,
        tail(&stderr, 2048).trim()
    );
    Ok(AdapterOutcome {
        tokens_used: tokens,
        ..AdapterOutcome::failed(detail)
    })
}

/// Token usage from the last JSON line of toolchain output.
///
/// Accepts `tokens_used` or `usage.input_tokens + usage.output_tokens`.
pub fn parse_tokens_used(stdout: &str) -> Option<u64> {
    let json = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())?;

    if let Some(tokens) = json.get("tokens_used").and_then(|v| v.as_u64()) {
        return Some(tokens);
    }
    let usage = json.get("usage")?;
    let input = usage.get("input_tokens").and_then(|v| v.as_u64());
    let output = usage.get("output_tokens").and_then(|v| v.as_u64());
    match (input, output) {
        (None, None) => None,
        (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
    }
}

/// Locate an executable on PATH (or as given, if it contains a separator).
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// Last `max` bytes of `s`, cut on a char boundary.
pub(crate) fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
