//! Walks a directory tree and collects the regular files to fingerprint.

use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
};

use crate::log;

/// Recursively collects every regular file below `root`, breadth-first.
/// Unreadable entries and non-regular files are logged and skipped; a backup
/// should back up everything it can rather than die on one bad entry.
pub fn walk_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        let iter = fs::read_dir(&dir)?;
        for item in iter {
            match item {
                Ok(entry) => match entry.file_type() {
                    Ok(ftype) if ftype.is_dir() => {
                        queue.push_back(entry.path());
                    }
                    Ok(ftype) if ftype.is_file() => {
                        files.push(entry.path());
                    }
                    Ok(_) => {
                        log!(
                            "file {} is neither a file or a directory, ignored",
                            entry.path().display()
                        );
                    }
                    Err(e) => {
                        log!(
                            "error when scanning file {}: {}, continuing",
                            entry.path().display(),
                            e
                        );
                    }
                },
                Err(e) => {
                    log!("error when scanning files: {}, continuing", e);
                }
            }
        }
    }

    files.sort();
    Ok(files)
}
