//! Crash-safe record files
//!
//! Records are written to a hidden temporary file in the destination
//! directory and renamed over the final name. Readers therefore see either
//! the previous record or the new one, never a partial write. Directories
//! are plain per-job files; no locking is involved.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use detach_core::domain::JobId;
use tracing::{debug, warn};

const TEMP_SUFFIX: &str = ".tmp";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Atomically replaces `path` with `contents`
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "record path has no file name"))?
        .to_string_lossy();

    let tmp = dir.join(format!(
        ".{}.{}.{}{}",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        TEMP_SUFFIX
    ));

    let result = write_new_file(&tmp, contents).and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    // Persist the rename itself; failure here does not undo the write.
    if let Ok(dir_handle) = fs::File::open(dir) {
        let _ = dir_handle.sync_all();
    }

    Ok(())
}

fn write_new_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Removes `path`, treating a missing file as success
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Lists `<job_id>.<extension>` files in `dir`
///
/// Temporary files and names that are not valid job ids are skipped. A
/// missing directory is an empty listing.
pub fn list_records(dir: &Path, extension: &str) -> io::Result<Vec<(JobId, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if is_temp_file(&name) {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }

        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match JobId::new(stem) {
            Ok(job_id) => records.push((job_id, path)),
            Err(_) => debug!("Ignoring foreign file {}", path.display()),
        }
    }

    records.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(records)
}

/// Deletes temporary files left behind by writers that died mid-write
pub fn sweep_temp_files(dir: &Path, older_than: Duration) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        if !is_temp_file(&entry.file_name().to_string_lossy()) {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        match remove_if_exists(&entry.path()) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => warn!("Failed to remove temp file {}: {}", entry.path().display(), e),
        }
    }

    Ok(removed)
}
