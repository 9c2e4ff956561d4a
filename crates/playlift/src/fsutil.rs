//! Atomic JSON persistence helpers shared by the stores.
//!
//! Every durable record is written to a temp file, synced, then renamed
//! into place so a concurrent reader never observes a half-written record.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Best-effort fsync of the parent directory after a rename, ensuring the
/// directory entry update is durable on crash.  Errors are silently ignored
/// because not all platforms support opening a directory for sync.
pub(crate) fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

pub(crate) fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    // Unique per process and per write, so concurrent writers of the same
    // record never share a temp file.
    static TMP_SEQ: AtomicU64 = AtomicU64::new(0);
    let tmp = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| {
            format!(
                "failed to rename tmp file {} to {}",
                tmp.display(),
                path.display()
            )
        });
    }

    fsync_parent_dir(path);

    Ok(())
}

/// Read and parse a JSON record.  Absence is `Ok(None)`; a file that exists
/// but fails to parse is an error, never silently treated as absent.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read record file {}", path.display()))?;
    let value: T = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse JSON record {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn roundtrip_writes_and_reads_record() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("sample.json");
        let value = Sample {
            name: "demo".to_string(),
            count: 3,
        };

        atomic_write_json(&path, &value).expect("write");
        let loaded: Sample = read_json(&path).expect("read").expect("exists");
        assert_eq!(loaded, value);
    }

    #[test]
    fn read_missing_file_is_none() {
        let td = tempdir().expect("tempdir");
        let loaded: Option<Sample> = read_json(&td.path().join("absent.json")).expect("read");
        assert!(loaded.is_none());
    }

    #[test]
    fn read_surfaces_corruption_as_error() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("bad.json");
        fs::write(&path, "{not-json").expect("write");

        let err = read_json::<Sample>(&path).expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to parse JSON record"));
    }

    #[test]
    fn write_surfaces_rename_error() {
        let td = tempdir().expect("tempdir");
        // Pre-create the destination as a directory so the rename fails.
        let path = td.path().join("blocked.json");
        fs::create_dir_all(&path).expect("mkdir");

        let err = atomic_write_json(
            &path,
            &Sample {
                name: "x".to_string(),
                count: 0,
            },
        )
        .expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to rename tmp file"));

        // The temp file is removed on the failure path.
        let stray: Vec<_> = fs::read_dir(td.path())
            .expect("list")
            .map(|e| e.expect("entry").path())
            .filter(|p| *p != path)
            .collect();
        assert!(stray.is_empty(), "leftover temp files: {stray:?}");
    }

    #[test]
    fn concurrent_writers_never_share_a_temp_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("contested.json");

        std::thread::scope(|scope| {
            for worker in 0u32..4 {
                let path = &path;
                scope.spawn(move || {
                    for i in 0..50 {
                        atomic_write_json(
                            path,
                            &Sample {
                                name: format!("worker-{worker}"),
                                count: i,
                            },
                        )
                        .expect("write");
                    }
                });
            }
        });

        // Whatever write landed last, the record parses and no temp files
        // remain alongside it.
        let loaded: Sample = read_json(&path).expect("read").expect("exists");
        assert!(loaded.name.starts_with("worker-"));
        let entries: Vec<_> = fs::read_dir(td.path())
            .expect("list")
            .map(|e| e.expect("entry").path())
            .collect();
        assert_eq!(entries, vec![path.clone()]);
    }
}
