//! Issue model - represents a single work item from Beads.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single issue/task from the Beads work graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Unique identifier
    pub id: String,

    /// Issue title
    #[serde(default)]
    pub title: String,

    /// Detailed description/body
    #[serde(default, alias = "description")]
    pub body: String,

    /// Current status
    #[serde(default)]
    pub status: IssueStatus,

    /// Priority tier (P0 highest)
    #[serde(default, alias = "dk_priority")]
    pub priority: Priority,

    /// Risk level
    #[serde(default, alias = "dk_risk")]
    pub risk: RiskLevel,

    /// Size estimate, used as critical path weight
    #[serde(default, alias = "dk_size")]
    pub size: IssueSize,

    /// Labels attached to this issue
    #[serde(default, alias = "tags")]
    pub labels: Vec<String>,

    /// Issues that must be done before this one is ready
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Estimated tokens for this task
    #[serde(default, alias = "dk_estimated_tokens")]
    pub estimated_tokens: Option<u64>,

    /// Explicit request for speculate+vote
    #[serde(default, alias = "dk_speculate")]
    pub speculate: bool,

    /// Preferred toolchain
    #[serde(default, alias = "dk_tool_hint")]
    pub tool_hint: Option<String>,

    /// Failed attempts so far
    #[serde(default, alias = "dk_attempts")]
    pub attempts: u32,

    /// Retry budget override
    #[serde(default, alias = "dk_max_attempts")]
    pub max_attempts: Option<u32>,

    /// Issue this one was created to fix
    #[serde(default, alias = "dk_parent")]
    pub parent: Option<String>,

    /// When the issue was created
    #[serde(default, alias = "created")]
    pub created_at: Option<DateTime<Utc>>,

    /// When the issue last became ready
    #[serde(default)]
    pub ready_since: Option<DateTime<Utc>>,

    /// When a workcell was first started for the issue
    #[serde(default, alias = "dk_admitted_at")]
    pub admitted_at: Option<DateTime<Utc>>,

    /// When the issue was last updated
    #[serde(default, alias = "updated")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    Ready,
    #[serde(alias = "inprogress", alias = "running")]
    InProgress,
    Gating,
    #[serde(alias = "completed")]
    Done,
    #[serde(alias = "failed", alias = "escalated")]
    BlockedFailed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Gating => "gating",
            Self::Done => "done",
            Self::BlockedFailed => "blocked_failed",
        }
    }

    /// A workcell is (or should be) attached to the issue.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress | Self::Gating)
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier; `P0` is the most urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    /// Numeric tier, lower is more urgent.
    pub fn tier(&self) -> u8 {
        *self as u8
    }

    /// One tier more urgent (P0 stays P0).
    pub fn boosted(&self) -> Self {
        match self {
            Self::P0 | Self::P1 => Self::P0,
            Self::P2 => Self::P1,
            Self::P3 => Self::P2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueSize {
    XS,
    S,
    #[default]
    M,
    L,
    XL,
}

impl IssueSize {
    /// Get size in hours for scheduling
    pub fn hours(&self) -> u32 {
        match self {
            Self::XS => 1,
            Self::S => 2,
            Self::M => 4,
            Self::L => 8,
            Self::XL => 16,
        }
    }
}

impl Issue {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            status: IssueStatus::Open,
            priority: Priority::default(),
            risk: RiskLevel::default(),
            size: IssueSize::default(),
            labels: Vec::new(),
            depends_on: BTreeSet::new(),
            estimated_tokens: None,
            speculate: false,
            tool_hint: None,
            attempts: 0,
            max_attempts: None,
            parent: None,
            created_at: Some(Utc::now()),
            ready_since: None,
            admitted_at: None,
            updated_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_status(mut self, status: IssueStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    pub fn depends_on(mut self, blocker: impl Into<String>) -> Self {
        self.depends_on.insert(blocker.into());
        self
    }

    pub fn ready_since(mut self, at: DateTime<Utc>) -> Self {
        self.ready_since = Some(at);
        self
    }

    /// Get estimated tokens (with default)
    pub fn estimated_tokens_or(&self, default: u64) -> u64 {
        self.estimated_tokens.unwrap_or(default)
    }

    /// Retry budget (with default)
    pub fn max_attempts_or(&self, default: u32) -> u32 {
        self.max_attempts.unwrap_or(default)
    }

    /// Whether a workcell was ever started for the issue.
    pub fn ever_admitted(&self) -> bool {
        self.admitted_at.is_some() || self.attempts > 0
    }

    /// Prompt text handed to toolchains.
    pub fn description(&self) -> String {
        if self.body.trim().is_empty() {
            format!("# Task: {}\n", self.title)
        } else {
            format!("# Task: {}\n\n{}\n", self.title, self.body)
        }
    }
}
