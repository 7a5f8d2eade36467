//! Apply collaborator: pushes a unit's rendered resources into the target
//! system, deletes them on prune, and reports drift of live objects against
//! the last applied inventory.

use crate::io;
use crate::resource::{
    digest_bytes, AppliedResource, AppliedSet, DriftReport, Resource, ResourceRef, ResourceSet,
};
use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

/// Label stamped on every object the engine applies, naming the owning unit.
pub const OWNER_LABEL: &str = "fluxorder.io/owner";

// ---------------------------------------------------------------------------
// ApplyError
// ---------------------------------------------------------------------------

/// A failed apply attempt. Every variant feeds the scheduler's retry,
/// backoff and stall policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    /// Another unit already owns the object. Never resolved automatically.
    #[error("{resource} is owned by unit '{owner}'")]
    Conflict { resource: ResourceRef, owner: String },

    #[error("validation failed for {resource}: {reason}")]
    Validation {
        resource: ResourceRef,
        reason: String,
    },

    #[error("apply timed out after {0:?}")]
    Timeout(Duration),

    #[error("target unavailable: {0}")]
    Unavailable(String),

    #[error("source fetch failed: {0}")]
    Source(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ApplyError {
    fn from(e: std::io::Error) -> Self {
        ApplyError::Io(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Applier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub unit: String,
    pub revision: String,
    pub resources: ResourceSet,
    pub prune: bool,
    /// Inventory of the previous successful apply, used for pruning.
    pub previous: Option<AppliedSet>,
}

#[async_trait]
pub trait Applier: Send + Sync {
    /// Apply the whole resource set, all or nothing.
    async fn apply(&self, request: ApplyRequest) -> Result<AppliedSet, ApplyError>;

    /// Delete every object in `applied` that `unit` still owns.
    async fn delete(&self, unit: &str, applied: &AppliedSet) -> Result<(), ApplyError>;

    async fn detect_drift(&self, unit: &str, applied: &AppliedSet)
        -> Result<DriftReport, ApplyError>;
}

// ---------------------------------------------------------------------------
// DirectoryApplier
// ---------------------------------------------------------------------------

/// Materializes resources as YAML files under a target directory, laid out
/// as `<namespace>/<Kind[.group]>/<name>.yaml` (`_cluster` for cluster-scoped
/// objects). Useful as a local stand-in for an API server.
#[derive(Debug, Clone)]
pub struct DirectoryApplier {
    root: PathBuf,
}

impl DirectoryApplier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, reference: &ResourceRef) -> PathBuf {
        let ns = reference.namespace.as_deref().unwrap_or("_cluster");
        let kind = if reference.group.is_empty() {
            reference.kind.clone()
        } else {
            format!("{}.{}", reference.kind, reference.group)
        };
        self.root
            .join(ns)
            .join(kind)
            .join(format!("{}.yaml", reference.name))
    }

    /// Read the live object at `path`. Content that no longer parses is
    /// reported as `Unreadable` rather than failing the caller, so one
    /// damaged file never blocks other units or its own repair.
    fn inspect(&self, path: &Path) -> Result<Live, ApplyError> {
        match std::fs::read_to_string(path) {
            Ok(data) => match serde_yaml::from_str(&data) {
                Ok(value) => Ok(Live::Object(value)),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "live object does not parse");
                    Ok(Live::Unreadable)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Live::Absent),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(file = %path.display(), error = %e, "live object is not utf-8");
                Ok(Live::Unreadable)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn owner_of(live: &Value) -> Option<&str> {
        live.get("metadata")?
            .get("labels")?
            .get(OWNER_LABEL)?
            .as_str()
    }

    fn stamped(resource: &Resource, unit: &str) -> Result<String, ApplyError> {
        let mut manifest = resource.manifest.clone();
        let validation = |reason: &str| ApplyError::Validation {
            resource: resource.reference(),
            reason: reason.to_string(),
        };
        let metadata = manifest
            .as_mapping_mut()
            .and_then(|m| m.get_mut("metadata"))
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| validation("metadata is not a mapping"))?;
        let labels = metadata
            .entry(Value::from("labels"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        labels
            .as_mapping_mut()
            .ok_or_else(|| validation("metadata.labels is not a mapping"))?
            .insert(Value::from(OWNER_LABEL), Value::from(unit));
        serde_yaml::to_string(&manifest).map_err(|e| validation(&e.to_string()))
    }

    fn apply_blocking(&self, request: &ApplyRequest) -> Result<AppliedSet, ApplyError> {
        // Validate and serialize everything before the first write.
        let mut staged = Vec::with_capacity(request.resources.len());
        for resource in &request.resources.resources {
            let reference = resource.reference();
            let path = self.path_for(&reference);
            if let Live::Object(live) = self.inspect(&path)? {
                if let Some(owner) = Self::owner_of(&live) {
                    if owner != request.unit {
                        return Err(ApplyError::Conflict {
                            resource: reference,
                            owner: owner.to_string(),
                        });
                    }
                }
            }
            let body = Self::stamped(resource, &request.unit)?;
            staged.push((reference, path, body));
        }

        let writes: Vec<(PathBuf, Vec<u8>)> = staged
            .iter()
            .map(|(_, path, body)| (path.clone(), body.as_bytes().to_vec()))
            .collect();
        io::atomic_write_all(&writes).map_err(|e| ApplyError::Io(e.to_string()))?;

        let applied: Vec<AppliedResource> = staged
            .into_iter()
            .map(|(reference, _, body)| AppliedResource {
                reference,
                digest: digest_bytes(body.as_bytes()),
            })
            .collect();

        if request.prune {
            let current: HashSet<&ResourceRef> = applied.iter().map(|r| &r.reference).collect();
            if let Some(previous) = &request.previous {
                for stale in previous.references().filter(|r| !current.contains(r)) {
                    self.remove_owned(&request.unit, stale)?;
                }
            }
            // Owned objects the inventory never recorded.
            for (reference, path) in self.owned_files(&request.unit)? {
                if !current.contains(&reference) {
                    io::remove_file_and_empty_parents(&path, &self.root)
                        .map_err(|e| ApplyError::Io(e.to_string()))?;
                }
            }
        }

        Ok(AppliedSet {
            revision: request.revision.clone(),
            resources: applied,
        })
    }

    fn remove_owned(&self, unit: &str, reference: &ResourceRef) -> Result<(), ApplyError> {
        let path = self.path_for(reference);
        match self.inspect(&path)? {
            Live::Absent => return Ok(()),
            Live::Object(live) if Self::owner_of(&live).is_some_and(|owner| owner != unit) => {
                return Ok(());
            }
            // Unparseable content at this unit's inventory path is ours to remove.
            Live::Object(_) | Live::Unreadable => {}
        }
        io::remove_file_and_empty_parents(&path, &self.root)
            .map_err(|e| ApplyError::Io(e.to_string()))
    }

    fn drift_blocking(&self, unit: &str, applied: &AppliedSet) -> Result<DriftReport, ApplyError> {
        let mut report = DriftReport::default();
        for resource in &applied.resources {
            let path = self.path_for(&resource.reference);
            match std::fs::read(&path) {
                Ok(data) => {
                    if digest_bytes(&data) != resource.digest {
                        report.mutated.push(resource.reference.clone());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    report.missing.push(resource.reference.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }

        for (reference, _) in self.owned_files(unit)? {
            if !applied.contains(&reference) {
                report.extra.push(reference);
            }
        }
        report.extra.sort();
        Ok(report)
    }

    /// Every live object labelled as owned by `unit`.
    fn owned_files(&self, unit: &str) -> Result<Vec<(ResourceRef, PathBuf)>, ApplyError> {
        let mut owned = Vec::new();
        if !self.root.is_dir() {
            return Ok(owned);
        }
        for entry in WalkDir::new(&self.root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable target entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Live::Object(live) = self.inspect(entry.path())? else {
                continue;
            };
            if Self::owner_of(&live) != Some(unit) {
                continue;
            }
            if let Some(reference) = live_reference(&live) {
                owned.push((reference, entry.into_path()));
            }
        }
        Ok(owned)
    }
}

/// What sits at a live object's path.
enum Live {
    Absent,
    Unreadable,
    Object(Value),
}

fn live_reference(live: &Value) -> Option<ResourceRef> {
    let api_version = live.get("apiVersion")?.as_str()?;
    let metadata = live.get("metadata")?;
    Some(ResourceRef {
        group: ResourceRef::group_of(api_version),
        kind: live.get("kind")?.as_str()?.to_string(),
        namespace: metadata
            .get("namespace")
            .and_then(Value::as_str)
            .map(str::to_string),
        name: metadata.get("name")?.as_str()?.to_string(),
    })
}

#[async_trait]
impl Applier for DirectoryApplier {
    async fn apply(&self, request: ApplyRequest) -> Result<AppliedSet, ApplyError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.apply_blocking(&request))
            .await
            .map_err(|e| ApplyError::Unavailable(e.to_string()))?
    }

    async fn delete(&self, unit: &str, applied: &AppliedSet) -> Result<(), ApplyError> {
        let this = self.clone();
        let (unit, applied) = (unit.to_string(), applied.clone());
        tokio::task::spawn_blocking(move || {
            applied
                .references()
                .try_for_each(|reference| this.remove_owned(&unit, reference))
        })
        .await
        .map_err(|e| ApplyError::Unavailable(e.to_string()))?
    }

    async fn detect_drift(
        &self,
        unit: &str,
        applied: &AppliedSet,
    ) -> Result<DriftReport, ApplyError> {
        let this = self.clone();
        let (unit, applied) = (unit.to_string(), applied.clone());
        tokio::task::spawn_blocking(move || this.drift_blocking(&unit, &applied))
            .await
            .map_err(|e| ApplyError::Unavailable(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{Overlay, OverlayRenderer, Renderer};
    use tempfile::TempDir;

    const INFRA: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ingress\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: nginx\n  namespace: ingress\ndata:\n  workers: \"4\"\n";

    fn request(unit: &str, raw: &str, prune: bool, previous: Option<AppliedSet>) -> ApplyRequest {
        ApplyRequest {
            unit: unit.to_string(),
            revision: digest_bytes(raw.as_bytes()),
            resources: OverlayRenderer
                .render(raw.as_bytes(), &Overlay::default())
                .unwrap(),
            prune,
            previous,
        }
    }

    #[tokio::test]
    async fn apply_writes_owned_files() {
        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        let applied = applier.apply(request("infra", INFRA, true, None)).await.unwrap();
        assert_eq!(applied.resources.len(), 2);

        let cm = dir.path().join("ingress/ConfigMap/nginx.yaml");
        let body = std::fs::read_to_string(&cm).unwrap();
        assert!(body.contains("fluxorder.io/owner: infra"), "{body}");
        assert!(dir.path().join("_cluster/Namespace/ingress.yaml").exists());
    }

    #[tokio::test]
    async fn conflicting_owner_is_rejected_without_writing() {
        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        applier.apply(request("infra", INFRA, true, None)).await.unwrap();

        let other = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: extra\n  namespace: ingress\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: nginx\n  namespace: ingress\n";
        let err = applier
            .apply(request("apps", other, true, None))
            .await
            .unwrap_err();
        match err {
            ApplyError::Conflict { owner, resource } => {
                assert_eq!(owner, "infra");
                assert_eq!(resource.name, "nginx");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(!dir.path().join("ingress/ConfigMap/extra.yaml").exists());
    }

    #[tokio::test]
    async fn prune_removes_resources_dropped_from_source() {
        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        let first = applier.apply(request("infra", INFRA, true, None)).await.unwrap();

        let only_ns = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ingress\n";
        applier
            .apply(request("infra", only_ns, true, Some(first)))
            .await
            .unwrap();
        assert!(!dir.path().join("ingress").exists());
        assert!(dir.path().join("_cluster/Namespace/ingress.yaml").exists());
    }

    #[tokio::test]
    async fn without_prune_dropped_resources_stay() {
        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        let first = applier.apply(request("infra", INFRA, false, None)).await.unwrap();

        let only_ns = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ingress\n";
        let second = applier
            .apply(request("infra", only_ns, false, Some(first)))
            .await
            .unwrap();
        assert!(dir.path().join("ingress/ConfigMap/nginx.yaml").exists());

        let drift = applier.detect_drift("infra", &second).await.unwrap();
        assert_eq!(drift.extra.len(), 1);
        assert!(!drift.requires_correction(false));
    }

    #[tokio::test]
    async fn prune_removes_owned_objects_missing_from_inventory() {
        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        let applied = applier.apply(request("infra", INFRA, true, None)).await.unwrap();

        let stray = dir.path().join("ingress/ConfigMap/stray.yaml");
        std::fs::write(
            &stray,
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: stray\n  namespace: ingress\n  labels:\n    fluxorder.io/owner: infra\n",
        )
        .unwrap();
        let drift = applier.detect_drift("infra", &applied).await.unwrap();
        assert_eq!(drift.extra.len(), 1);
        assert!(drift.requires_correction(true));

        applier
            .apply(request("infra", INFRA, true, Some(applied)))
            .await
            .unwrap();
        assert!(!stray.exists());
        assert!(dir.path().join("ingress/ConfigMap/nginx.yaml").exists());
    }

    #[tokio::test]
    async fn drift_detects_mutation_and_deletion() {
        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        let applied = applier.apply(request("infra", INFRA, true, None)).await.unwrap();
        assert!(applier
            .detect_drift("infra", &applied)
            .await
            .unwrap()
            .is_clean());

        std::fs::write(
            dir.path().join("ingress/ConfigMap/nginx.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: nginx\n  namespace: ingress\n  labels:\n    fluxorder.io/owner: infra\ndata:\n  workers: \"64\"\n",
        )
        .unwrap();
        std::fs::remove_file(dir.path().join("_cluster/Namespace/ingress.yaml")).unwrap();

        let drift = applier.detect_drift("infra", &applied).await.unwrap();
        assert_eq!(drift.mutated.len(), 1);
        assert_eq!(drift.missing.len(), 1);
        assert!(drift.requires_correction(false));
    }

    #[tokio::test]
    async fn delete_removes_only_owned_objects() {
        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        let applied = applier.apply(request("infra", INFRA, true, None)).await.unwrap();
        applier.delete("infra", &applied).await.unwrap();
        assert!(!dir.path().join("ingress").exists());
        assert!(!dir.path().join("_cluster").exists());
    }

    #[tokio::test]
    async fn unparseable_live_object_is_drift_and_heals_on_reapply() {
        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        let infra = applier.apply(request("infra", INFRA, true, None)).await.unwrap();
        let web = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: web\n  namespace: apps\n";
        let apps = applier.apply(request("apps", web, true, None)).await.unwrap();

        let cm = dir.path().join("ingress/ConfigMap/nginx.yaml");
        std::fs::write(&cm, "key: [unterminated").unwrap();

        let drift = applier.detect_drift("infra", &infra).await.unwrap();
        assert_eq!(drift.mutated.len(), 1);
        assert_eq!(drift.mutated[0].name, "nginx");
        assert!(applier.detect_drift("apps", &apps).await.unwrap().is_clean());

        applier
            .apply(request("infra", INFRA, true, Some(infra)))
            .await
            .unwrap();
        let body = std::fs::read_to_string(&cm).unwrap();
        assert!(body.contains("fluxorder.io/owner: infra"), "{body}");
        assert!(dir.path().join("apps/ConfigMap/web.yaml").exists());
    }

    #[tokio::test]
    async fn delete_removes_unparseable_inventory_object() {
        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        let applied = applier.apply(request("infra", INFRA, true, None)).await.unwrap();
        let cm = dir.path().join("ingress/ConfigMap/nginx.yaml");
        std::fs::write(&cm, "key: [unterminated").unwrap();

        applier.delete("infra", &applied).await.unwrap();
        assert!(!dir.path().join("ingress").exists());
    }

    #[tokio::test]
    async fn failed_apply_leaves_previous_objects_untouched() {
        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        let first = applier.apply(request("infra", INFRA, true, None)).await.unwrap();
        let ns = dir.path().join("_cluster/Namespace/ingress.yaml");
        let before = std::fs::read_to_string(&ns).unwrap();

        // A directory now occupies the ConfigMap's path.
        let cm = dir.path().join("ingress/ConfigMap/nginx.yaml");
        std::fs::remove_file(&cm).unwrap();
        std::fs::create_dir_all(&cm).unwrap();
        std::fs::write(cm.join("keep"), "x").unwrap();

        let v2 = INFRA.replacen(
            "  name: ingress\n",
            "  name: ingress\n  labels:\n    tier: edge\n",
            1,
        );
        assert!(applier
            .apply(request("infra", &v2, true, Some(first)))
            .await
            .is_err());
        assert_eq!(std::fs::read_to_string(&ns).unwrap(), before);
        assert!(cm.join("keep").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_target_directory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let applier = DirectoryApplier::new(dir.path());
        let applied = applier.apply(request("infra", INFRA, true, None)).await.unwrap();

        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        if std::fs::read_dir(&locked).is_ok() {
            // Permission bits are not enforced for this user.
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let drift = applier.detect_drift("infra", &applied).await;
        let reapply = applier
            .apply(request("infra", INFRA, true, Some(applied)))
            .await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(drift.unwrap().is_clean());
        assert_eq!(reapply.unwrap().resources.len(), 2);
    }
}
