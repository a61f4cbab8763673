pub mod ledger;
pub mod record;
pub mod snapshot;
pub mod store;

pub use ledger::*;
pub use record::*;
pub use snapshot::*;
pub use store::*;

use ap_types::{ApResult, KnobSpace};
use std::path::{Path, PathBuf};

/// Resolves where a search run keeps its ledger.
#[derive(Debug, Clone)]
pub struct LedgerDirectory {
    pub root: PathBuf,
}

impl LedgerDirectory {
    pub fn new<P: AsRef<Path>>(root: P) -> ApResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// `<data dir>/autopolicy/ledgers`, falling back to `./ledgers`.
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("autopolicy"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ledgers")
    }

    /// `<program>-<problem_size>-<optimizer>-seed<seed>.csv`
    pub fn ledger_path(
        &self,
        program: &str,
        problem_size: &str,
        optimizer: &str,
        seed: u64,
    ) -> PathBuf {
        self.root
            .join(format!("{program}-{problem_size}-{optimizer}-seed{seed}.csv"))
    }

    /// Open (or resume) the CSV ledger for one run.
    pub fn open(
        &self,
        space: KnobSpace,
        program: &str,
        problem_size: &str,
        optimizer: &str,
        seed: u64,
    ) -> ApResult<ExplorationLedger> {
        let path = self.ledger_path(program, problem_size, optimizer, seed);
        let store = CsvRecordStore::new(path, space.clone());
        ExplorationLedger::open(space, Box::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_names_encode_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers = LedgerDirectory::new(dir.path()).unwrap();
        let path = ledgers.ledger_path("lulesh", "30", "bo-ucb", 7);
        assert_eq!(path, dir.path().join("lulesh-30-bo-ucb-seed7.csv"));

        let space = KnobSpace::openmp(&[1, 2], &["r"], 2).unwrap();
        let ledger = ledgers.open(space, "lulesh", "30", "bo-ucb", 7).unwrap();
        assert!(ledger.is_empty());
        assert!(!ledger.is_complete());
    }
}
