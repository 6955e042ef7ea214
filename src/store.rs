//! Durable JSON store with backup-and-restore on corruption.
//!
//! Every state file owned by the crate goes through [`write_json`] /
//! [`read_json_or`]. A write first preserves the previous generation as
//! `<path>.bak`, stages the new payload at `<path>.tmp` and atomically
//! renames it into place, so a crash mid-write never leaves the path absent
//! or truncated when a prior valid version existed. Corruption is detected
//! structurally (parse failure) and transparently repaired from the backup.
//!
//! Serialization of mutations is the caller's job: each service owns exactly
//! one file and guards it with a single in-process lock.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CarrosselError;

/// Appends a suffix to a path without touching its extension.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn store_err(path: &Path, source: std::io::Error) -> CarrosselError {
    CarrosselError::Store {
        path: path.to_path_buf(),
        source,
    }
}

/// Serializes `value` and atomically replaces the file at `path`.
///
/// Any existing file is copied to `<path>.bak` first; at most one backup
/// generation is retained.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CarrosselError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| store_err(path, e))?;
    }

    let payload = serde_json::to_vec_pretty(value)?;

    let backup = sibling(path, ".bak");
    match tokio::fs::copy(path, &backup).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(store_err(path, e)),
    }

    let temp = sibling(path, ".tmp");
    tokio::fs::write(&temp, payload)
        .await
        .map_err(|e| store_err(&temp, e))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| store_err(path, e))?;

    Ok(())
}

/// Reads and parses the file at `path`, falling back to `<path>.bak` on
/// missing or corrupt content. A readable backup transparently repairs the
/// primary. Returns `default` when neither parses.
pub async fn read_json_or<T: DeserializeOwned>(path: &Path, default: T) -> T {
    let primary_missing = match tokio::fs::read(path).await {
        Ok(raw) => match serde_json::from_slice::<T>(&raw) {
            Ok(value) => return value,
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "state file failed to parse; trying backup",
                );
                false
            }
        },
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => true,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "state file unreadable; trying backup",
            );
            false
        }
    };

    let backup = sibling(path, ".bak");
    match tokio::fs::read(&backup).await {
        Ok(raw) => match serde_json::from_slice::<T>(&raw) {
            Ok(value) => {
                if let Err(error) = tokio::fs::copy(&backup, path).await {
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        "failed to repair state file from backup",
                    );
                } else {
                    tracing::info!(
                        path = %path.display(),
                        "state file repaired from backup",
                    );
                }
                value
            }
            Err(error) => {
                tracing::warn!(
                    path = %backup.display(),
                    error = %error,
                    "backup failed to parse; using default state",
                );
                default
            }
        },
        Err(error) => {
            if !primary_missing {
                tracing::warn!(
                    path = %backup.display(),
                    error = %error,
                    "backup unreadable; using default state",
                );
            }
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        generation: u32,
        note: String,
    }

    fn doc(generation: u32) -> Doc {
        Doc {
            generation,
            note: "hello".into(),
        }
    }

    #[tokio::test]
    async fn roundtrip_and_missing_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let missing: Doc = read_json_or(&path, doc(0)).await;
        assert_eq!(missing, doc(0));

        write_json(&path, &doc(1)).await.unwrap();
        let read: Doc = read_json_or(&path, doc(0)).await;
        assert_eq!(read, doc(1));
    }

    #[tokio::test]
    async fn keeps_exactly_one_backup_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        write_json(&path, &doc(1)).await.unwrap();
        write_json(&path, &doc(2)).await.unwrap();
        write_json(&path, &doc(3)).await.unwrap();

        let bak: Doc = read_json_or(&sibling(&path, ".bak"), doc(0)).await;
        assert_eq!(bak, doc(2));
    }

    #[tokio::test]
    async fn corrupt_primary_recovers_and_repairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        write_json(&path, &doc(1)).await.unwrap();
        write_json(&path, &doc(2)).await.unwrap();
        tokio::fs::write(&path, b"{ truncated garba").await.unwrap();

        // bak holds generation 1, the last fully committed value before the
        // corrupt write landed.
        let read: Doc = read_json_or(&path, doc(0)).await;
        assert_eq!(read, doc(1));

        // The primary was repaired in place.
        let raw = tokio::fs::read(&path).await.unwrap();
        let repaired: Doc = serde_json::from_slice(&raw).unwrap();
        assert_eq!(repaired, doc(1));
    }

    #[tokio::test]
    async fn truncated_tmp_artifact_does_not_affect_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        write_json(&path, &doc(7)).await.unwrap();
        // Simulate a crash mid-write: a half-written tmp file left behind.
        tokio::fs::write(sibling(&path, ".tmp"), b"{\"generation\":")
            .await
            .unwrap();

        let read: Doc = read_json_or(&path, doc(0)).await;
        assert_eq!(read, doc(7));
    }

    #[tokio::test]
    async fn corrupt_primary_and_backup_fall_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        tokio::fs::write(&path, b"not json").await.unwrap();
        tokio::fs::write(sibling(&path, ".bak"), b"also not json")
            .await
            .unwrap();

        let read: Doc = read_json_or(&path, doc(42)).await;
        assert_eq!(read, doc(42));
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.json");

        write_json(&path, &doc(1)).await.unwrap();
        let read: Doc = read_json_or(&path, doc(0)).await;
        assert_eq!(read, doc(1));
    }
}
