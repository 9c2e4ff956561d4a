//! Content digests for local artifacts.
//!
//! The SHA-256 of an artifact's bytes is its identity everywhere in this
//! crate: cache keys, idempotency keys, and upload dedup all hang off it.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

const CHUNK_SIZE: usize = 64 * 1024;

/// Content digest and size of a local artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Lowercase hex SHA-256 of the file's bytes.
    pub sha256: String,
    /// File size in bytes.
    pub size: u64,
}

/// Compute the SHA-256 digest and size of a file.
pub fn digest_file(path: &Path) -> Result<FileDigest> {
    digest_file_with_progress(path, |_, _| {})
}

/// Like [`digest_file`] but reports `(bytes_hashed, total_bytes)` after
/// every chunk, for progress rendering on large artifacts.
pub fn digest_file_with_progress(
    path: &Path,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<FileDigest> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let total = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();

    let mut reader = std::io::BufReader::with_capacity(CHUNK_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut hashed = 0u64;

    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        hashed += n as u64;
        on_progress(hashed, total);
    }

    Ok(FileDigest {
        sha256: hex::encode(hasher.finalize()),
        size: hashed,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).expect("create");
        f.write_all(bytes).expect("write");
        path
    }

    #[test]
    fn same_bytes_same_digest() {
        let td = tempdir().expect("tempdir");
        let path = write_file(td.path(), "app.aab", b"artifact bytes");

        let first = digest_file(&path).expect("digest");
        let second = digest_file(&path).expect("digest");
        assert_eq!(first, second);
        assert_eq!(first.size, 14);
        assert_eq!(first.sha256.len(), 64);
    }

    #[test]
    fn different_bytes_different_digest() {
        let td = tempdir().expect("tempdir");
        let a = write_file(td.path(), "a.apk", b"artifact one");
        let b = write_file(td.path(), "b.apk", b"artifact two");

        let da = digest_file(&a).expect("digest a");
        let db = digest_file(&b).expect("digest b");
        assert_ne!(da.sha256, db.sha256);
    }

    #[test]
    fn missing_file_fails_with_path_in_error() {
        let td = tempdir().expect("tempdir");
        let err = digest_file(&td.path().join("absent.aab")).expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to open"));
    }

    #[test]
    fn progress_reports_monotonic_byte_counts() {
        let td = tempdir().expect("tempdir");
        // Three chunks plus a partial tail.
        let bytes = vec![7u8; CHUNK_SIZE * 3 + 100];
        let path = write_file(td.path(), "big.aab", &bytes);

        let mut reports = Vec::new();
        let digest = digest_file_with_progress(&path, |hashed, total| {
            reports.push((hashed, total));
        })
        .expect("digest");

        assert_eq!(digest.size, bytes.len() as u64);
        assert_eq!(reports.len(), 4);
        assert!(reports.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(reports.last().expect("nonempty").0, bytes.len() as u64);
        assert!(reports.iter().all(|(_, total)| *total == bytes.len() as u64));
    }

    #[test]
    fn empty_file_has_stable_digest() {
        let td = tempdir().expect("tempdir");
        let path = write_file(td.path(), "empty.apk", b"");

        let digest = digest_file(&path).expect("digest");
        assert_eq!(digest.size, 0);
        // SHA-256 of the empty string.
        assert_eq!(
            digest.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
