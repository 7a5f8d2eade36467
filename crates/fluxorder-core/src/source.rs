//! Source collaborator: turns a unit's `source_path` into manifest bytes and
//! a content hash. The hash is the revision the scheduler compares against
//! `last_applied_revision`.

use crate::error::{FluxError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSource {
    /// `sha256:<hex>` over the source tree. Identical trees always produce
    /// the same revision.
    pub revision: String,
    /// All manifests of the tree, concatenated as YAML documents.
    pub manifests: Vec<u8>,
}

#[async_trait]
pub trait Source: Send + Sync {
    async fn fetch(&self, source_path: &str) -> Result<FetchedSource>;
}

// ---------------------------------------------------------------------------
// DirectorySource
// ---------------------------------------------------------------------------

/// Reads manifests from a checked-out tree on disk.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_tree(&self, source_path: &str) -> Result<FetchedSource> {
        let relative = source_path.trim_start_matches("./");
        let base = if relative.is_empty() || relative == "." {
            self.root.clone()
        } else {
            self.root.join(relative)
        };
        if !base.exists() {
            return Err(FluxError::Source {
                path: source_path.to_string(),
                reason: format!("{} does not exist", base.display()),
            });
        }

        let mut files: Vec<PathBuf> = WalkDir::new(&base)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !e.file_name().to_str().is_some_and(|n| n.starts_with('.'))
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        files.sort();

        let mut hasher = Sha256::new();
        let mut manifests = Vec::new();
        for file in &files {
            let data = std::fs::read(file)?;
            let rel = file.strip_prefix(&base).unwrap_or(file);
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(&data);
            hasher.update([0u8]);

            manifests.extend_from_slice(b"---\n");
            manifests.extend_from_slice(&data);
            if !data.ends_with(b"\n") {
                manifests.push(b'\n');
            }
        }

        Ok(FetchedSource {
            revision: format!("sha256:{}", hex::encode(hasher.finalize())),
            manifests,
        })
    }
}

#[async_trait]
impl Source for DirectorySource {
    async fn fetch(&self, source_path: &str) -> Result<FetchedSource> {
        let this = self.clone();
        let path = source_path.to_string();
        tokio::task::spawn_blocking(move || this.read_tree(&path))
            .await
            .map_err(|e| FluxError::Source {
                path: source_path.to_string(),
                reason: e.to_string(),
            })?
    }
}
