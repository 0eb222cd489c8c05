//! Input file discovery.

use std::path::{Path, PathBuf};

use crate::SourceError;

/// Lists the regular files in `dir` whose file name contains `pattern`,
/// sorted by file name.
///
/// # Errors
///
/// Returns [`SourceError::Open`] if the directory cannot be read, or
/// [`SourceError::NoInputFiles`] if nothing matches.
pub fn discover_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, SourceError> {
    let entries = std::fs::read_dir(dir).map_err(|source| SourceError::Open {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().contains(pattern) {
            files.push(entry.path());
        }
    }

    if files.is_empty() {
        return Err(SourceError::NoInputFiles {
            dir: dir.to_path_buf(),
            pattern: pattern.to_string(),
        });
    }

    files.sort();

    log::debug!(
        "Found {} input file(s) matching {pattern:?} in {}",
        files.len(),
        dir.display()
    );

    Ok(files)
}

/// File name of `path` for log and report messages.
#[must_use]
pub fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}
