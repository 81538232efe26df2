//! Persisted per-project scheduling state.
//!
//! Only the debts and resource share survive a restart; every other
//! scheduling field is recomputed on the first pass. Projects are matched by
//! URL since arena IDs are not stable across runs.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::ClientState;

/// One project's persisted fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedProject {
    pub url: String,
    pub resource_share: f64,
    pub short_term_debt: f64,
    pub long_term_debt: f64,
}

impl ClientState {
    /// Snapshot every project's persisted fields, in ID order.
    #[must_use]
    pub fn export_debts(&self) -> Vec<PersistedProject> {
        self.projects()
            .map(|p| PersistedProject {
                url: p.url.clone(),
                resource_share: p.resource_share,
                short_term_debt: p.short_term_debt,
                long_term_debt: p.long_term_debt,
            })
            .collect()
    }

    /// Restore persisted fields onto attached projects. Entries for unknown
    /// URLs are skipped. Returns how many projects were updated.
    pub fn import_debts(&mut self, records: &[PersistedProject]) -> usize {
        let mut applied = 0;
        for record in records {
            let Some(id) = self.project_by_url(&record.url).map(|p| p.id) else {
                warn!(project = %record.url, "persisted debts for unattached project ignored");
                continue;
            };
            if let Err(err) = self.set_resource_share(id, record.resource_share) {
                warn!(%err, project = %record.url, "persisted resource share not applied");
                continue;
            }
            if let Some(project) = self.project_mut(id) {
                project.short_term_debt = finite_or_zero(record.short_term_debt);
                project.long_term_debt = finite_or_zero(record.long_term_debt);
                project.anticipated_debt = 0.0;
                applied += 1;
            }
        }
        applied
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// Write the persisted fields as pretty JSON.
pub fn save_debts(state: &ClientState, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(&state.export_debts())?;
    std::fs::write(path, json)?;
    debug!(path = %path.display(), projects = state.project_count(), "debts saved");
    Ok(())
}

/// Read a file written by [`save_debts`] and apply it.
pub fn load_debts(state: &mut ClientState, path: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(path)?;
    let records: Vec<PersistedProject> = serde_json::from_str(&text)?;
    let applied = state.import_debts(&records);
    debug!(path = %path.display(), applied, "debts loaded");
    Ok(applied)
}
