//! Record stores: where a ledger's rows live between steps.

use ap_types::{ApResult, KnobSpace};
use std::path::{Path, PathBuf};

use crate::record::{EvaluationRecord, RecordLayout};
use crate::snapshot::write_csv_atomic;

/// Persistence backend for an [`ExplorationLedger`](crate::ExplorationLedger).
///
/// `save` always receives the full record set; implementations replace
/// their previous snapshot rather than appending.
pub trait RecordStore: Send {
    fn load(&self) -> ApResult<Vec<EvaluationRecord>>;

    fn save(&mut self, records: &[EvaluationRecord]) -> ApResult<()>;

    /// Persist the final snapshot and flag the run as finished.
    fn mark_complete(&mut self, records: &[EvaluationRecord]) -> ApResult<()>;

    fn is_complete(&self) -> bool;

    fn describe(&self) -> String;
}

/// CSV file store with a `-DONE` sibling marking completion.
#[derive(Debug, Clone)]
pub struct CsvRecordStore {
    path: PathBuf,
    done_path: PathBuf,
    layout: RecordLayout,
}

impl CsvRecordStore {
    pub fn new(path: impl Into<PathBuf>, space: KnobSpace) -> Self {
        let path = path.into();
        let done_path = done_path_for(&path);
        Self {
            path,
            done_path,
            layout: RecordLayout::new(space),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn done_path(&self) -> &Path {
        &self.done_path
    }

    fn write(&self, path: &Path, records: &[EvaluationRecord]) -> ApResult<()> {
        let header = self.layout.header(records);
        let rows = records
            .iter()
            .map(|r| self.layout.to_row(&header, r))
            .collect::<ApResult<Vec<_>>>()?;
        write_csv_atomic(path, &header, rows)
    }
}

/// `runs/lulesh-30-bo-ucb-seed1.csv` → `runs/lulesh-30-bo-ucb-seed1-DONE.csv`
pub fn done_path_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}-DONE.csv"))
}

impl RecordStore for CsvRecordStore {
    fn load(&self) -> ApResult<Vec<EvaluationRecord>> {
        // A finished run may leave both files behind if it died between
        // writing the DONE snapshot and removing the working file.
        let source = if self.done_path.exists() {
            &self.done_path
        } else if self.path.exists() {
            &self.path
        } else {
            return Ok(Vec::new());
        };
        let data = std::fs::read(source)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.layout.parse(&source.display().to_string(), &data)?;
        tracing::info!(
            "Loaded {} records from {}",
            records.len(),
            source.display()
        );
        Ok(records)
    }

    fn save(&mut self, records: &[EvaluationRecord]) -> ApResult<()> {
        self.write(&self.path, records)
    }

    fn mark_complete(&mut self, records: &[EvaluationRecord]) -> ApResult<()> {
        self.write(&self.done_path, records)?;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        tracing::info!("Marked ledger complete: {}", self.done_path.display());
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.done_path.exists()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory store for simulated runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: Vec<EvaluationRecord>,
    complete: bool,
    saves: usize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing records, as if loaded from disk.
    pub fn with_records(records: Vec<EvaluationRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn records(&self) -> &[EvaluationRecord] {
        &self.records
    }

    /// Number of snapshots written so far.
    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl RecordStore for MemoryRecordStore {
    fn load(&self) -> ApResult<Vec<EvaluationRecord>> {
        Ok(self.records.clone())
    }

    fn save(&mut self, records: &[EvaluationRecord]) -> ApResult<()> {
        self.records = records.to_vec();
        self.saves += 1;
        Ok(())
    }

    fn mark_complete(&mut self, records: &[EvaluationRecord]) -> ApResult<()> {
        self.save(records)?;
        self.complete = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
