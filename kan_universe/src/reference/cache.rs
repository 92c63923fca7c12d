//! On-disk reference cache.
//!
//! One file per entry at `<workspace>/<type>/<name>`, holding the serialized
//! detected-reference container. Validity is judged by mtime only, so the
//! format stays delegated to the serialization layer.

use crate::reference::detect::DetectedReferenceContainer;
use kan_core::InternedString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ReferenceCacheError {
    #[error("cache i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache content is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

pub fn cache_file_path(
    workspace: &Path,
    type_name: InternedString,
    name: InternedString,
) -> PathBuf {
    workspace.join(type_name.as_str()).join(name.as_str())
}

/// Last modification time in nanoseconds since the unix epoch. Missing files
/// report 0, the "never updated" sentinel of the freshness comparisons.
pub fn file_time_ns(path: &Path) -> u64 {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(io_error) => {
            if io_error.kind() != ErrorKind::NotFound {
                error!(
                    path = %path.display(),
                    %io_error,
                    "failed to query last modification time"
                );
            }
            return 0;
        }
    };

    match metadata.modified() {
        Ok(modified) => modified
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0),
        Err(io_error) => {
            error!(
                path = %path.display(),
                %io_error,
                "failed to query last modification time"
            );
            0
        }
    }
}

pub fn read_cache(path: &Path) -> Result<DetectedReferenceContainer, ReferenceCacheError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Writes the cache file and returns its resulting mtime. Failed writes
/// remove the partial file and report 0; references are still published with
/// that time.
pub fn write_cache(
    workspace: &Path,
    type_name: InternedString,
    name: InternedString,
    container: &DetectedReferenceContainer,
) -> u64 {
    let directory = workspace.join(type_name.as_str());
    let path = cache_file_path(workspace, type_name, name);

    let written = fs::create_dir_all(&directory)
        .map_err(ReferenceCacheError::from)
        .and_then(|_| Ok(serde_json::to_string(container)?))
        .and_then(|serialized| Ok(fs::write(&path, serialized)?));

    if let Err(cache_error) = written {
        error!(path = %path.display(), %cache_error, "failed to write cache file");
        let _ = fs::remove_file(&path);
    }

    file_time_ns(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::detect::DetectedReference;
    use kan_core::intern;

    #[test]
    fn write_then_read_round_trip() {
        let workspace = tempfile::tempdir().unwrap();
        let container = DetectedReferenceContainer {
            detected_references: vec![DetectedReference {
                type_name: intern("material"),
                name: intern("brick"),
            }],
        };

        let written_time =
            write_cache(workspace.path(), intern("effect"), intern("fire"), &container);
        assert!(written_time > 0);

        let path = cache_file_path(workspace.path(), intern("effect"), intern("fire"));
        assert_eq!(file_time_ns(&path), written_time);

        let restored = read_cache(&path).unwrap();
        assert_eq!(restored, container);
    }

    #[test]
    fn missing_file_reports_zero_time() {
        let workspace = tempfile::tempdir().unwrap();
        let path = cache_file_path(workspace.path(), intern("effect"), intern("missing"));
        assert_eq!(file_time_ns(&path), 0);
        assert!(read_cache(&path).is_err());
    }
}
