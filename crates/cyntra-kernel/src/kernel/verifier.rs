//! Verifier - runs quality gates on completed work.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::process::Command;

use crate::adapters::output_tail;
use crate::config::{GateCommand, GatesConfig};
use crate::workcell::{FailureReason, WorkcellId};

/// How a single gate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Recorded result of one gate run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub name: String,
    pub command: String,
    pub outcome: GateOutcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Full output
    pub output_path: PathBuf,
    /// Tail of the output
    pub output_excerpt: String,
    pub required: bool,
    pub attempts: u32,
    /// Failed at least once before passing
    #[serde(default)]
    pub flaky: bool,
}

impl QualityGateResult {
    pub fn passed(&self) -> bool {
        self.outcome == GateOutcome::Passed
    }

    /// Workcell failure this result stands for, if any.
    pub fn failure(&self, timeout_secs: u64) -> Option<FailureReason> {
        match self.outcome {
            GateOutcome::Passed => None,
            GateOutcome::Failed => Some(FailureReason::GateFailed {
                gate: self.name.clone(),
                exit_code: self.exit_code,
            }),
            GateOutcome::Timeout => Some(FailureReason::GateTimeout {
                gate: self.name.clone(),
                timeout_secs,
            }),
        }
    }
}

/// Results of a full gate sequence.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub results: Vec<QualityGateResult>,
    pub verdict: Verdict,
    /// Reason for a `Fail` verdict
    pub failure: Option<FailureReason>,
}

/// Verifier runs quality gates.
#[derive(Debug, Clone)]
pub struct Verifier {
    config: GatesConfig,
    logs_dir: PathBuf,
}

impl Verifier {
    pub fn new(config: GatesConfig, logs_dir: &Path) -> Self {
        Self {
            config,
            logs_dir: logs_dir.to_path_buf(),
        }
    }

    /// Run required gates in order, stopping at the first failure, then the
    /// advisory gates. Only required gates decide the verdict.
    pub async fn verify(&self, workcell_id: &WorkcellId, sandbox: &Path) -> GateReport {
        let mut results = Vec::new();

        if !self.config.enabled {
            return GateReport {
                results,
                verdict: Verdict::Pass,
                failure: None,
            };
        }

        for gate in self.config.commands.iter().filter(|g| g.required) {
            let result = self.run_gate(gate, workcell_id, sandbox).await;
            let failure = result.failure(gate.timeout_seconds);
            results.push(result);
            if let Some(failure) = failure {
                tracing::info!(
                    workcell_id = %workcell_id,
                    gate = %gate.name,
                    "Quality gate failed"
                );
                return GateReport {
                    results,
                    verdict: Verdict::Fail,
                    failure: Some(failure),
                };
            }
        }

        for gate in self.config.commands.iter().filter(|g| !g.required) {
            let result = self.run_gate(gate, workcell_id, sandbox).await;
            if !result.passed() {
                tracing::warn!(
                    workcell_id = %workcell_id,
                    gate = %gate.name,
                    "Advisory gate failed"
                );
            }
            results.push(result);
        }

        GateReport {
            results,
            verdict: Verdict::Pass,
            failure: None,
        }
    }

    async fn run_gate(
        &self,
        gate: &GateCommand,
        workcell_id: &WorkcellId,
        sandbox: &Path,
    ) -> QualityGateResult {
        let log_dir = self.logs_dir.join(workcell_id.as_str());
        let output_path = log_dir.join(format!("{}.log", gate.name));
        let started = Instant::now();

        let mut attempts = 0;
        let mut outcome = GateOutcome::Failed;
        let mut exit_code = None;

        while attempts <= gate.retries {
            attempts += 1;
            tracing::info!(
                workcell_id = %workcell_id,
                gate = %gate.name,
                attempt = attempts,
                "Running quality gate"
            );
            let append = attempts > 1;
            match run_command(gate, sandbox, &log_dir, &output_path, append).await {
                Ok((o, code)) => {
                    outcome = o;
                    exit_code = code;
                }
                Err(e) => {
                    outcome = GateOutcome::Failed;
                    exit_code = None;
                    let _ = tokio::fs::write(&output_path, format!("{e:#}\n")).await;
                }
            }
            if outcome == GateOutcome::Passed {
                break;
            }
        }

        let output = tokio::fs::read_to_string(&output_path)
            .await
            .unwrap_or_default();
        QualityGateResult {
            name: gate.name.clone(),
            command: gate.command.clone(),
            outcome,
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            output_excerpt: output_tail(&output, self.config.output_excerpt_bytes).to_string(),
            output_path,
            required: gate.required,
            attempts,
            flaky: outcome == GateOutcome::Passed && attempts > 1,
        }
    }
}

/// One attempt: `sh -c <command>` in the sandbox, output to the log file.
async fn run_command(
    gate: &GateCommand,
    sandbox: &Path,
    log_dir: &Path,
    output_path: &Path,
    append: bool,
) -> Result<(GateOutcome, Option<i32>)> {
    tokio::fs::create_dir_all(log_dir)
        .await
        .with_context(|| format!("Failed to create {}", log_dir.display()))?;
    let log = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(output_path)
        .await
        .with_context(|| format!("Failed to open {}", output_path.display()))?
        .into_std()
        .await;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&gate.command)
        .current_dir(sandbox)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn gate {}", gate.name))?;

    match tokio::time::timeout(gate.timeout(), child.wait()).await {
        Ok(status) => {
            let status = status?;
            let outcome = if status.success() {
                GateOutcome::Passed
            } else {
                GateOutcome::Failed
            };
            Ok((outcome, status.code()))
        }
        Err(_) => {
            let _ = child.kill().await;
            Ok((GateOutcome::Timeout, None))
        }
    }
}
