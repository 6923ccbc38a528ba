//! Workcell store - one JSON record per workcell.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{Workcell, WorkcellId};
use crate::state::write_atomic;

/// Persisted workcell records under `<state_dir>/workcells/`.
#[derive(Debug, Clone)]
pub struct WorkcellStore {
    dir: PathBuf,
}

impl WorkcellStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("workcells"),
        }
    }

    fn path(&self, id: &WorkcellId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Write a record, replacing any previous version.
    pub fn save(&self, workcell: &Workcell) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let json = serde_json::to_vec_pretty(workcell)?;
        write_atomic(&self.path(&workcell.id), &json)
    }

    pub fn load(&self, id: &WorkcellId) -> Result<Option<Workcell>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let workcell = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(workcell))
    }

    /// All records, oldest first.
    pub fn load_all(&self) -> Result<Vec<Workcell>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<Workcell>(&c).map_err(Into::into));
            match parsed {
                Ok(workcell) => records.push(workcell),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable workcell record"
                ),
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Terminal workcells, most recently finished first.
    pub fn history(&self, issue_id: Option<&str>, limit: usize) -> Result<Vec<Workcell>> {
        let mut records: Vec<Workcell> = self
            .load_all()?
            .into_iter()
            .filter(|w| w.status.is_terminal())
            .filter(|w| issue_id.map_or(true, |id| w.issue_id == id))
            .collect();
        records.sort_by(|a, b| b.finished_at.cmp(&a.finished_at).then(b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }
}
