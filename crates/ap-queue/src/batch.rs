//! Batch task files on disk.

use ap_ledger::write_csv_atomic;
use ap_types::{ApResult, QueueError, RuntimeConfig};
use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::reconcile::Reconciliation;
use crate::schema;
use crate::sweep::SweepDefinition;

pub const TODO_FILE: &str = "todo.csv";

/// Label used when the caller does not name a reconciliation pass.
pub fn default_label() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// Write one `job_<i>_of_<n>/todo.csv` per batch under `<dir>/<label>/`.
///
/// Earlier passes are left in place. Returns the batch directories in
/// batch order.
pub fn write_batches(
    dir: &Path,
    sweep: &SweepDefinition,
    reconciliation: &Reconciliation,
    label: Option<&str>,
) -> ApResult<Vec<PathBuf>> {
    let label = label.map(str::to_string).unwrap_or_else(default_label);
    let pass_dir = dir.join(&label);
    let header = schema::header(sweep, false);

    let mut written = Vec::with_capacity(reconciliation.batches.len());
    for batch in &reconciliation.batches {
        let batch_dir = pass_dir.join(batch.dir_name());
        let rows = batch
            .configs
            .iter()
            .map(|config| schema::row(sweep, config, None));
        write_csv_atomic(&batch_dir.join(TODO_FILE), &header, rows)?;
        written.push(batch_dir);
    }

    tracing::info!(
        "Wrote {} batch files under {}",
        written.len(),
        pass_dir.display()
    );
    Ok(written)
}

/// Configs listed in a batch directory's `todo.csv`, in file order.
pub fn read_batch(batch_dir: &Path, sweep: &SweepDefinition) -> ApResult<Vec<RuntimeConfig>> {
    let path = batch_dir.join(TODO_FILE);
    let malformed = |message: String| QueueError::MalformedBatch {
        path: path.display().to_string(),
        message,
    };
    let data = std::fs::read(&path)
        .map_err(|e| malformed(format!("cannot read task file: {e}")))?;
    let rows = schema::parse(sweep, &data, false).map_err(malformed)?;
    Ok(rows.into_iter().map(|row| row.config).collect())
}
