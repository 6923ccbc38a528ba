//! Claude adapter - uses the Claude Code CLI in print mode.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::process::{self, CliInvocation};
use super::{AdapterOutcome, InvocationRequest, ToolchainAdapter};
use crate::config::ToolchainConfig;

pub struct ClaudeAdapter {
    config: ToolchainConfig,
}

impl ClaudeAdapter {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    fn program(&self) -> &str {
        self.config.command.as_deref().unwrap_or("claude")
    }

    fn build_args(&self, prompt_file: &Path) -> Vec<String> {
        let mut args = vec!["--print".to_string(), format!("@{}", prompt_file.display())];
        if let Some(model) = &self.config.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        // Skip permissions for autonomous mode
        args.push("--dangerously-skip-permissions".to_string());
        args.extend(self.config.args.iter().cloned());
        args
    }
}

#[async_trait]
impl ToolchainAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
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
        let invocation = CliInvocation {
            toolchain: self.name(),
            program: self.program(),
            args: self.build_args(&prompt_file),
            env: &self.config.env,
            stdin: None,
        };
        process::run_cli(invocation, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_reference_prompt_file_and_model() {
        let adapter = ClaudeAdapter::new(ToolchainConfig {
            model: Some("opus".into()),
            ..ToolchainConfig::default()
        });
        let args = adapter.build_args(Path::new("/wc/prompt.md"));
        assert_eq!(args[..2], ["--print".to_string(), "@/wc/prompt.md".to_string()]);
        assert!(args.windows(2).any(|w| w == ["--model", "opus"]));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
    }
}
