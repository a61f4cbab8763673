//! Crash-safe file replacement.

use ap_types::{ApResult, LedgerError};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Replace `path` with `contents`: write a temp file in the same
/// directory, fsync it, rename over the target, then fsync the directory.
///
/// Readers see either the old file or the new one, never a torn write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> ApResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| LedgerError::PersistFailed {
        path: path.display().to_string(),
        message: err.error.to_string(),
    })?;

    sync_parent_directory(parent)?;
    Ok(())
}

/// Serialize `rows` under `header` as CSV and replace `path` atomically.
pub fn write_csv_atomic<I, R>(path: &Path, header: &[String], rows: I) -> ApResult<()>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator<Item = String>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| ap_types::internal_error!("flushing CSV buffer: {}", err))?;
    write_atomic(path, &bytes)
}

fn sync_parent_directory(dir: &Path) -> ApResult<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
