//! Generic adapter for any configured command.

use std::time::Duration;

use async_trait::async_trait;

use super::process::{self, CliInvocation};
use super::{AdapterOutcome, InvocationRequest, ToolchainAdapter};
use crate::config::ToolchainConfig;

/// Runs `command args...`, substituting `{prompt_file}` in the arguments.
pub struct CommandAdapter {
    name: String,
    config: ToolchainConfig,
}

impl CommandAdapter {
    pub fn new(name: impl Into<String>, config: ToolchainConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    fn program(&self) -> &str {
        self.config.command.as_deref().unwrap_or(&self.name)
    }
}

#[async_trait]
impl ToolchainAdapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        process::find_executable(self.program()).is_some()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    async fn invoke(&self, request: &InvocationRequest) -> AdapterOutcome {
        let prompt_file = match process::write_prompt(request) {
            Ok(path) => path,
            Err(e) => return AdapterOutcome::failed(format!("{e:#}")),
        };
        let prompt_arg = prompt_file.display().to_string();
        let args = self
            .config
            .args
            .iter()
            .map(|a| a.replace("{prompt_file}", &prompt_arg))
            .collect();
        let invocation = CliInvocation {
            toolchain: &self.name,
            program: self.program(),
            args,
            env: &self.config.env,
            stdin: None,
        };
        process::run_cli(invocation, request).await
    }
}
