use crate::error::CacheError;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "strata.cache",
                    error = %err,
                    "system time is before unix epoch; using 0 for now_millis"
                );
            }
            0
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "strata.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

/// Remove `dir` and any now-empty parents up to (not including) `stop`.
pub(crate) fn prune_empty_dirs(mut dir: &Path, stop: &Path) {
    while dir != stop && dir.starts_with(stop) {
        if fs::remove_dir(dir).is_err() {
            return;
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return,
        }
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` through a temporary sibling file and a rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    atomic_write_with(path, |file| {
        file.write_all(bytes)?;
        Ok(())
    })
}

pub(crate) fn atomic_write_with(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<(), CacheError>,
) -> Result<(), CacheError> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };

    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = (|| -> Result<(), CacheError> {
        write(&mut file)?;
        file.sync_all()?;
        Ok(())
    })();
    drop(file);
    if let Err(err) = write_result {
        remove_file_best_effort(&tmp_path, "atomic_write.write_failed");
        return Err(err);
    }

    if let Err(err) = rename_replacing(&tmp_path, path) {
        remove_file_best_effort(&tmp_path, "atomic_write.rename_failed");
        return Err(err.into());
    }

    sync_dir_best_effort(parent);
    Ok(())
}

fn rename_replacing(from: &Path, to: &Path) -> io::Result<()> {
    const MAX_RENAME_ATTEMPTS: usize = 64;
    let mut attempts = 0usize;
    loop {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            // `rename` does not replace an existing file on Windows.
            Err(err) if cfg!(windows) && to.exists() && attempts < MAX_RENAME_ATTEMPTS => {
                attempts += 1;
                match fs::remove_file(to) {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(_) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        static SYNC_DIR_ERROR_LOGGED: OnceLock<()> = OnceLock::new();
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if SYNC_DIR_ERROR_LOGGED.set(()).is_ok() {
                    tracing::debug!(
                        target = "strata.cache",
                        dir = %dir.display(),
                        error = %err,
                        "failed to sync directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}
