//! Kernel configuration loading and management.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::state::RiskLevel;

/// Main kernel configuration, loaded from .cyntra/config.yaml
///
/// A loaded config is treated as an immutable snapshot for the duration of a
/// scheduling cycle; the runner reloads it between cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Config version
    pub version: Option<String>,

    /// Concurrency, budget and starvation limits
    pub scheduling: SchedulingConfig,

    /// Toolchain priority order (first available wins)
    pub toolchain_priority: Vec<String>,

    /// Per-toolchain settings, keyed by toolchain name
    pub toolchains: HashMap<String, ToolchainConfig>,

    /// Quality gates configuration
    pub gates: GatesConfig,

    /// Speculation (parallel execution) configuration
    pub speculation: SpeculationConfig,

    /// What happens to an issue whose workcell failed for good
    pub failure: FailureConfig,

    /// Workcells directory (relative to project root)
    pub workcells_dir: PathBuf,

    /// Persisted workcell records
    pub state_dir: PathBuf,

    /// Toolchain and gate output
    pub logs_dir: PathBuf,

    /// Beads issue files
    pub beads_dir: PathBuf,

    /// Kernel event log
    pub events_path: PathBuf,

    /// Branch that workcells are cut from
    pub base_branch: String,
}

/// Scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub max_concurrent_workcells: usize,
    pub max_concurrent_tokens: u64,
    pub starvation_threshold_hours: f64,
    pub poll_interval_seconds: u64,
    /// Token estimate for issues that do not declare one
    pub default_estimated_tokens: u64,
    /// Adapter-failure retry budget for issues that do not declare one
    pub max_attempts: u32,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workcells: 3,
            max_concurrent_tokens: 200_000,
            starvation_threshold_hours: 4.0,
            poll_interval_seconds: 5,
            default_estimated_tokens: 50_000,
            max_attempts: 3,
        }
    }
}

/// Settings for one toolchain adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub enabled: bool,
    /// Executable override (defaults to the toolchain name)
    pub command: Option<String>,
    /// Extra arguments; `{prompt_file}` is substituted for command toolchains
    pub args: Vec<String>,
    pub model: Option<String>,
    pub timeout_seconds: u64,
    pub env: HashMap<String, String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            args: Vec::new(),
            model: None,
            timeout_seconds: 1800,
            env: HashMap::new(),
        }
    }
}

/// Quality gates configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    /// Whether gates are enabled
    pub enabled: bool,

    /// Gate commands, run in order
    pub commands: Vec<GateCommand>,

    /// Tail of gate output kept on each result
    pub output_excerpt_bytes: usize,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            commands: Vec::new(),
            output_excerpt_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCommand {
    pub name: String,
    pub command: String,
    #[serde(default = "default_gate_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Extra attempts after a failure (flaky gates)
    #[serde(default)]
    pub retries: u32,
}

impl GateCommand {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout_seconds: default_gate_timeout(),
            required: true,
            retries: 0,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn advisory(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_gate_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Speculation (parallel multi-agent) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculationConfig {
    pub enabled: bool,

    /// Number of variants launched per speculative issue
    pub default_parallelism: usize,

    /// Minimum fraction of passing variants needed to pick a winner
    pub vote_threshold: f64,

    /// Speculate on issues that other pending issues depend on
    pub auto_trigger_on_critical_path: bool,

    /// Risk levels that trigger speculation
    pub auto_trigger_risk_levels: Vec<RiskLevel>,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_parallelism: 2,
            vote_threshold: 0.7,
            auto_trigger_on_critical_path: true,
            auto_trigger_risk_levels: vec![RiskLevel::High, RiskLevel::Critical],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureConfig {
    pub fix_issue_policy: FixIssuePolicy,
}

/// Relationship between a fix issue and the issue it was created for.
///
/// In both cases the fix issue blocks the original.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixIssuePolicy {
    /// The original returns to `open` and becomes ready again once the fix is done.
    #[default]
    ReopenBlocked,
    /// The original is parked as `blocked_failed` until someone reopens it.
    MarkFailed,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            version: None,
            scheduling: SchedulingConfig::default(),
            toolchain_priority: vec!["codex".to_string(), "claude".to_string()],
            toolchains: HashMap::new(),
            gates: GatesConfig::default(),
            speculation: SpeculationConfig::default(),
            failure: FailureConfig::default(),
            workcells_dir: PathBuf::from(".workcells"),
            state_dir: PathBuf::from(".cyntra/state"),
            logs_dir: PathBuf::from(".cyntra/logs"),
            beads_dir: PathBuf::from(".beads"),
            events_path: PathBuf::from(".cyntra/events.jsonl"),
            base_branch: "main".to_string(),
        }
    }
}

impl KernelConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Path of the project config file
    pub fn project_config_path(project_root: &Path) -> PathBuf {
        project_root.join(".cyntra/config.yaml")
    }

    /// Load from project root (looks for .cyntra/config.yaml)
    pub fn load_from_project(project_root: &Path) -> Result<Self> {
        let config_path = Self::project_config_path(project_root);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve paths relative to project root
    pub fn resolve_paths(&mut self, project_root: &Path) {
        self.workcells_dir = project_root.join(&self.workcells_dir);
        self.state_dir = project_root.join(&self.state_dir);
        self.logs_dir = project_root.join(&self.logs_dir);
        self.beads_dir = project_root.join(&self.beads_dir);
        self.events_path = project_root.join(&self.events_path);
    }

    /// Settings for a toolchain (defaults when not configured)
    pub fn toolchain(&self, name: &str) -> ToolchainConfig {
        self.toolchains.get(name).cloned().unwrap_or_default()
    }

    /// Check the invariants the scheduler relies on.
    pub fn validate(&self) -> std::result::Result<(), KernelError> {
        let invalid = |msg: String| Err(KernelError::ConfigInvalid(msg));
        let s = &self.scheduling;

        if s.max_concurrent_workcells == 0 {
            return invalid("scheduling.max_concurrent_workcells must be at least 1".into());
        }
        if s.max_concurrent_tokens == 0 {
            return invalid("scheduling.max_concurrent_tokens must be at least 1".into());
        }
        if !s.starvation_threshold_hours.is_finite() || s.starvation_threshold_hours < 0.0 {
            return invalid(format!(
                "scheduling.starvation_threshold_hours must be a non-negative number, got {}",
                s.starvation_threshold_hours
            ));
        }
        if s.poll_interval_seconds == 0 {
            return invalid("scheduling.poll_interval_seconds must be at least 1".into());
        }

        let spec = &self.speculation;
        if !(spec.vote_threshold > 0.0 && spec.vote_threshold <= 1.0) {
            return invalid(format!(
                "speculation.vote_threshold must be in (0, 1], got {}",
                spec.vote_threshold
            ));
        }
        if spec.enabled && spec.default_parallelism < 2 {
            return invalid("speculation.default_parallelism must be at least 2".into());
        }

        let mut seen = HashSet::new();
        for gate in &self.gates.commands {
            if gate.name.trim().is_empty() {
                return invalid("gate names must not be empty".into());
            }
            if !seen.insert(gate.name.as_str()) {
                return invalid(format!("duplicate gate name: {}", gate.name));
            }
            if gate.command.trim().is_empty() {
                return invalid(format!("gate {} has an empty command", gate.name));
            }
            if gate.timeout_seconds == 0 {
                return invalid(format!("gate {} has a zero timeout", gate.name));
            }
        }

        for (name, toolchain) in &self.toolchains {
            if toolchain.timeout_seconds == 0 {
                return invalid(format!("toolchain {name} has a zero timeout"));
            }
        }

        Ok(())
    }
}

/// Default config written by `init`.
pub const DEFAULT_CONFIG_YAML: &str = r#"# Cyntra Kernel Configuration

scheduling:
  max_concurrent_workcells: 3
  max_concurrent_tokens: 200000
  starvation_threshold_hours: 4
  poll_interval_seconds: 5

toolchain_priority:
  - codex
  - claude

toolchains:
  claude:
    timeout_seconds: 1800
  codex:
    timeout_seconds: 1800

gates:
  enabled: true
  commands:
    - name: test
      command: "cargo test"
      timeout_seconds: 600
    - name: lint
      command: "cargo clippy -- -D warnings"
      required: false

speculation:
  enabled: false
  default_parallelism: 2
  vote_threshold: 0.7
  auto_trigger_risk_levels:
    - high
    - critical

failure:
  fix_issue_policy: reopen_blocked
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        KernelConfig::default().validate().unwrap();
    }

    #[test]
    fn init_template_parses_and_validates() {
        let config: KernelConfig = serde_yaml::from_str(DEFAULT_CONFIG_YAML).unwrap();
        config.validate().unwrap();
        assert_eq!(config.gates.commands.len(), 2);
        assert!(config.gates.commands[0].required);
        assert!(!config.gates.commands[1].required);
        assert_eq!(config.gates.commands[0].timeout_seconds, 600);
        assert_eq!(config.gates.commands[1].timeout_seconds, 300);
        assert_eq!(config.toolchain("claude").timeout_seconds, 1800);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: KernelConfig = serde_yaml::from_str(
            "scheduling:\n  max_concurrent_workcells: 8\nspeculation:\n  enabled: true\n",
        )
        .unwrap();
        assert_eq!(config.scheduling.max_concurrent_workcells, 8);
        assert_eq!(config.scheduling.max_concurrent_tokens, 200_000);
        assert!(config.speculation.enabled);
        assert_eq!(config.speculation.default_parallelism, 2);
        assert_eq!(config.failure.fix_issue_policy, FixIssuePolicy::ReopenBlocked);
    }

    #[test]
    fn rejects_out_of_range_vote_threshold() {
        let mut config = KernelConfig::default();
        config.speculation.vote_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(KernelError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_duplicate_gates() {
        let mut config = KernelConfig::default();
        config.gates.commands = vec![
            GateCommand::new("test", "true"),
            GateCommand::new("test", "false"),
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate gate name"));
    }

    #[test]
    fn rejects_zero_ceilings() {
        let mut config = KernelConfig::default();
        config.scheduling.max_concurrent_workcells = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_paths_anchors_to_project() {
        let mut config = KernelConfig::default();
        config.resolve_paths(Path::new("/repo"));
        assert_eq!(config.workcells_dir, PathBuf::from("/repo/.workcells"));
        assert_eq!(config.events_path, PathBuf::from("/repo/.cyntra/events.jsonl"));
    }
}
