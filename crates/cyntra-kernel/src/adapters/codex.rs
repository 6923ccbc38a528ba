//! Codex adapter - uses `codex exec` with the prompt on stdin.

use std::time::Duration;

use async_trait::async_trait;

use super::process::{self, CliInvocation};
use super::{AdapterOutcome, InvocationRequest, ToolchainAdapter};
use crate::config::ToolchainConfig;

pub struct CodexAdapter {
    config: ToolchainConfig,
}

impl CodexAdapter {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    fn program(&self) -> &str {
        self.config.command.as_deref().unwrap_or("codex")
    }

    fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "exec",
            "-",
            "--sandbox",
            "workspace-write",
            "--ask-for-approval",
            "never",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(model) = &self.config.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        args.extend(self.config.args.iter().cloned());
        args
    }
}

#[async_trait]
impl ToolchainAdapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    async fn is_available(&self) -> bool {
        process::find_executable(self.program()).is_some()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    async fn invoke(&self, request: &InvocationRequest) -> AdapterOutcome {
        if let Err(e) = process::write_prompt(request) {
            return AdapterOutcome::failed(format!("{e:#}"));
        }
        let invocation = CliInvocation {
            toolchain: self.name(),
            program: self.program(),
            args: self.build_args(),
            env: &self.config.env,
            stdin: Some(&request.prompt),
        };
        process::run_cli(invocation, request).await
    }
}
