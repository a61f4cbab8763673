//! Completion files: what workers have already measured.

use ap_ledger::write_csv_atomic;
use ap_types::{ApResult, QueueError, RuntimeConfig};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::schema;
use crate::sweep::SweepDefinition;

pub const COMPLETE_FILE: &str = "complete.csv";

/// One measured config as reported by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub config: RuntimeConfig,
    pub time: f64,
}

impl Completion {
    pub fn new(config: RuntimeConfig, time: f64) -> Self {
        Self { config, time }
    }
}

/// A worker's `complete.csv`.
#[derive(Debug, Clone)]
pub struct CompletionFile {
    path: PathBuf,
}

impl CompletionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The completion file inside a batch directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(COMPLETE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows belonging to `sweep`. A missing file reads as empty; a file
    /// whose columns or labels disagree with the sweep is a schema mismatch.
    pub fn read(&self, sweep: &SweepDefinition) -> ApResult<Vec<Completion>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read(&self.path)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let rows = schema::parse(sweep, &data, true).map_err(|message| {
            QueueError::SchemaMismatch {
                file: self.path.display().to_string(),
                message,
            }
        })?;
        Ok(rows
            .into_iter()
            .map(|row| Completion {
                config: row.config,
                time: row.time.unwrap_or(f64::NAN),
            })
            .collect())
    }

    /// Replace the file with `completions`.
    pub fn write_all(&self, sweep: &SweepDefinition, completions: &[Completion]) -> ApResult<()> {
        let header = schema::header(sweep, true);
        let rows = completions
            .iter()
            .map(|c| schema::row(sweep, &c.config, Some(c.time)));
        write_csv_atomic(&self.path, &header, rows)
    }

    /// Add one completion, rewriting the whole file so a crash leaves
    /// either the old or the new contents.
    pub fn append(&self, sweep: &SweepDefinition, completion: Completion) -> ApResult<()> {
        completion.config.validate(&sweep.space)?;
        let mut completions = self.read(sweep)?;
        completions.push(completion);
        self.write_all(sweep, &completions)
    }
}

/// Every `complete.csv` under `dir`, at any depth, in path order.
pub fn completion_files(dir: &Path) -> ApResult<Vec<CompletionFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() && entry.file_name() == COMPLETE_FILE {
            found.push(CompletionFile::new(entry.into_path()));
        }
    }
    Ok(found)
}

/// Read every completion file under a sweep directory.
pub fn collect_completions(dir: &Path, sweep: &SweepDefinition) -> ApResult<Vec<Completion>> {
    let mut completions = Vec::new();
    for file in completion_files(dir)? {
        let rows = file.read(sweep)?;
        tracing::debug!("{}: {} completions", file.path().display(), rows.len());
        completions.extend(rows);
    }
    Ok(completions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_types::{ApError, KnobSpace};

    fn sweep() -> SweepDefinition {
        let space = KnobSpace::openmp(&[10, 20], &[] as &[&str], 1).unwrap();
        SweepDefinition::new("bt_nas", "medprob", space)
    }

    fn config(threads: usize) -> RuntimeConfig {
        RuntimeConfig::new()
            .with("num_threads", threads)
            .with("proc_bind", 0)
            .with("places", 1)
    }

    #[test]
    fn append_accumulates_rows() {
        let dir = tempfile::tempdir().unwrap();
        let file = CompletionFile::in_dir(dir.path());
        let sweep = sweep();
        assert!(file.read(&sweep).unwrap().is_empty());

        file.append(&sweep, Completion::new(config(0), 3.2)).unwrap();
        file.append(&sweep, Completion::new(config(1), -1.0)).unwrap();

        let rows = file.read(&sweep).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], Completion::new(config(0), 3.2));
        assert_eq!(rows[1].time, -1.0);
    }

    #[test]
    fn unknown_label_is_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(COMPLETE_FILE);
        std::fs::write(
            &path,
            "program,problem_size,num_threads,proc_bind,places,time\n\
             bt_nas,medprob,40,close,cores,1.0\n",
        )
        .unwrap();
        let err = CompletionFile::new(&path).read(&sweep()).unwrap_err();
        assert!(matches!(err, ApError::Queue(QueueError::SchemaMismatch { .. })));
    }

    #[test]
    fn collects_nested_files_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let sweep = sweep();
        for (batch, threads) in [("job_2_of_2", 1), ("job_1_of_2", 0)] {
            let batch_dir = dir.path().join("20240101T000000Z").join(batch);
            CompletionFile::in_dir(&batch_dir)
                .append(&sweep, Completion::new(config(threads), 1.5))
                .unwrap();
        }
        std::fs::write(dir.path().join("todo.csv"), "ignored").unwrap();

        let all = collect_completions(dir.path(), &sweep).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].config, config(0));
        assert_eq!(all[1].config, config(1));
    }

    #[test]
    fn missing_sweep_dir_has_no_completions() {
        let dir = tempfile::tempdir().unwrap();
        let files = completion_files(&dir.path().join("not-yet-created")).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn only_files_named_complete_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("pass").join("job_1_of_1");
        std::fs::create_dir_all(nested.join(COMPLETE_FILE)).unwrap();
        std::fs::write(nested.join("complete.csv.bak"), "stale").unwrap();
        CompletionFile::in_dir(dir.path())
            .append(&sweep(), Completion::new(config(0), 2.0))
            .unwrap();

        let files = completion_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path(), dir.path().join(COMPLETE_FILE));
    }
}
