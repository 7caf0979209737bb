//! Repository fingerprinting for change detection.
//!
//! A fingerprint is a SHA-256 digest over a deterministic, sorted walk of
//! the repository: each regular file contributes its relative path, size,
//! and content hash. Two repositories with identical file sets and contents
//! produce identical fingerprints; modification times are irrelevant.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::permissions::normalize;

/// Short stable id for a repository, derived from its normalized absolute
/// path. Used only for file layout, never for cross-repository joins.
pub fn repository_id(root: &Path) -> String {
    let normalized = normalize(root);
    let digest = Sha256::digest(normalized.to_string_lossy().as_bytes());
    hex::encode(&digest[..6])
}

/// Compute the repository fingerprint, skipping `ignore_dirs` by name.
pub fn compute_fingerprint(root: &Path, ignore_dirs: &[String]) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file_count = 0usize;
    walk(root, root, ignore_dirs, &mut hasher, &mut file_count)?;
    let digest = hasher.finalize();
    debug!(root = %root.display(), file_count, "fingerprint computed");
    Ok(hex::encode(digest))
}

fn walk(
    root: &Path,
    dir: &Path,
    ignore_dirs: &[String],
    hasher: &mut Sha256,
    file_count: &mut usize,
) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    paths.sort();

    for path in paths {
        let file_type = fs::symlink_metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .file_type();
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            if ignore_dirs.iter().any(|ignored| ignored == &name) {
                continue;
            }
            walk(root, &path, ignore_dirs, hasher, file_count)?;
            continue;
        }

        let contents =
            fs::read(&path).with_context(|| format!("read file {}", path.display()))?;
        let content_hash = hex::encode(Sha256::digest(&contents));
        let relative = path
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", path.display()))?;

        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(b"\n");
        hasher.update(contents.len().to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(content_hash.as_bytes());
        hasher.update(b"\n");
        *file_count += 1;
    }
    Ok(())
}
