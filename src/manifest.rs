use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("write manifest: {0}")]
    Io(#[from] std::io::Error),
}

/// Final state of one (item, target) work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeState {
    Pushed,
    Notpushed,
    Deleted,
    Notdeleted,
    Missing,
    Skipped,
}

impl OutcomeState {
    pub fn is_success(self) -> bool {
        !matches!(self, OutcomeState::Notpushed | OutcomeState::Notdeleted)
    }
}

/// Result of one (item, target) work unit. Every attempted unit produces
/// exactly one of these; they are folded into the manifest afterwards.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    /// Source identity of the push item.
    pub src: String,
    /// Derived image name.
    pub name: String,
    pub region: String,
    /// Access id of the target account.
    pub account: String,
    pub image_id: Option<String>,
    pub snapshots: Vec<String>,
    pub state: OutcomeState,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }
}

/// Per-target slice of a manifest entry.
#[derive(Debug, Clone, Serialize)]
pub struct TargetResult {
    pub region: String,
    pub account: String,
    pub ami: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<String>,
    pub state: OutcomeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One manifest entry per processed item, keyed by source identity.
#[derive(Debug, Serialize)]
pub struct ManifestEntry {
    pub src: String,
    pub name: String,
    pub success: bool,
    pub images: Vec<TargetResult>,
}

/// The aggregate result document, emitted once per invocation.
#[derive(Debug, Default, Serialize)]
pub struct Manifest {
    pub items: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_outcomes(outcomes: Vec<ItemOutcome>) -> Self {
        let mut entries: Vec<ManifestEntry> = Vec::new();
        let mut by_src: HashMap<String, usize> = HashMap::new();
        for outcome in outcomes {
            let index = *by_src.entry(outcome.src.clone()).or_insert_with(|| {
                entries.push(ManifestEntry {
                    src: outcome.src.clone(),
                    name: outcome.name.clone(),
                    success: true,
                    images: Vec::new(),
                });
                entries.len() - 1
            });
            let entry = &mut entries[index];
            entry.success &= outcome.is_success();
            entry.images.push(TargetResult {
                region: outcome.region,
                account: outcome.account,
                ami: outcome.image_id,
                snapshots: outcome.snapshots,
                state: outcome.state,
                error: outcome.error,
            });
        }
        Manifest { items: entries }
    }

    pub fn is_success(&self) -> bool {
        self.items.iter().all(|entry| entry.success)
    }

    /// Work unit counts as (succeeded, failed).
    pub fn counts(&self) -> (usize, usize) {
        let mut succeeded = 0;
        let mut failed = 0;
        for entry in &self.items {
            for target in &entry.images {
                if target.state.is_success() {
                    succeeded += 1;
                } else {
                    failed += 1;
                }
            }
        }
        (succeeded, failed)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
