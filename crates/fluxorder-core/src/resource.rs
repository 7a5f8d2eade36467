//! Rendered Kubernetes-style resources and the bookkeeping the engine keeps
//! about what it applied.
//!
//! A [`ResourceSet`] is the output of rendering one unit's manifests; an
//! [`AppliedSet`] is the inventory the applier returns after a successful
//! apply. The inventory is what prune and drift detection compare against.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kinds that live outside any namespace. Overlay namespaces are never
/// applied to these.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "ClusterIssuer",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "PersistentVolume",
    "PriorityClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// `sha256:<hex>` digest of arbitrary bytes.
pub fn digest_bytes(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

// ---------------------------------------------------------------------------
// ResourceRef
// ---------------------------------------------------------------------------

/// Identity of a resource in the target system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// API group, empty for the core group.
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    /// Derive the group from an `apiVersion` such as `apps/v1` or `v1`.
    pub fn group_of(api_version: &str) -> String {
        match api_version.split_once('/') {
            Some((group, _)) => group.to_string(),
            None => String::new(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.group)
        };
        match &self.namespace {
            Some(ns) => write!(f, "{kind}/{ns}/{}", self.name),
            None => write!(f, "{kind}/{}", self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource / ResourceSet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// Full manifest, including the identity fields above.
    pub manifest: serde_yaml::Value,
}

impl Resource {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            group: ResourceRef::group_of(&self.api_version),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(&self.manifest)
    }
}

/// The final, rendered resources of one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSet {
    pub resources: Vec<Resource>,
}

impl ResourceSet {
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn references(&self) -> Vec<ResourceRef> {
        self.resources.iter().map(Resource::reference).collect()
    }
}

// ---------------------------------------------------------------------------
// AppliedSet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedResource {
    #[serde(flatten)]
    pub reference: ResourceRef,
    /// Digest of the live object as written by the applier.
    pub digest: String,
}

/// Inventory of a successful apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedSet {
    pub revision: String,
    pub resources: Vec<AppliedResource>,
}

impl AppliedSet {
    pub fn contains(&self, reference: &ResourceRef) -> bool {
        self.resources.iter().any(|r| &r.reference == reference)
    }

    pub fn references(&self) -> impl Iterator<Item = &ResourceRef> {
        self.resources.iter().map(|r| &r.reference)
    }
}

// ---------------------------------------------------------------------------
// DriftReport
// ---------------------------------------------------------------------------

/// Difference between the live state and a unit's last applied inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    /// Applied resources that no longer exist.
    pub missing: Vec<ResourceRef>,
    /// Applied resources whose live content changed.
    pub mutated: Vec<ResourceRef>,
    /// Live resources owned by the unit that are not in the inventory.
    pub extra: Vec<ResourceRef>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mutated.is_empty() && self.extra.is_empty()
    }

    /// Whether re-applying would change anything. Extra resources only count
    /// when prune is enabled, since without prune they are left in place.
    pub fn requires_correction(&self, prune: bool) -> bool {
        !self.missing.is_empty() || !self.mutated.is_empty() || (prune && !self.extra.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> ResourceRef {
        ResourceRef {
            group: String::new(),
            kind: "ConfigMap".to_string(),
            namespace: Some("apps".to_string()),
            name: name.to_string(),
        }
    }

    #[test]
    fn group_of_core_and_named_groups() {
        assert_eq!(ResourceRef::group_of("v1"), "");
        assert_eq!(ResourceRef::group_of("apps/v1"), "apps");
        assert_eq!(
            ResourceRef::group_of("networking.k8s.io/v1"),
            "networking.k8s.io"
        );
    }

    #[test]
    fn reference_display() {
        assert_eq!(cm("settings").to_string(), "ConfigMap/apps/settings");
        let ns = ResourceRef {
            group: String::new(),
            kind: "Namespace".to_string(),
            namespace: None,
            name: "apps".to_string(),
        };
        assert_eq!(ns.to_string(), "Namespace/apps");
        let deploy = ResourceRef {
            group: "apps".to_string(),
            kind: "Deployment".to_string(),
            namespace: Some("web".to_string()),
            name: "frontend".to_string(),
        };
        assert_eq!(deploy.to_string(), "Deployment.apps/web/frontend");
    }

    #[test]
    fn digest_is_stable_and_prefixed() {
        let a = digest_bytes(b"kind: ConfigMap");
        assert!(a.starts_with("sha256:"));
        assert_eq!(a, digest_bytes(b"kind: ConfigMap"));
        assert_ne!(a, digest_bytes(b"kind: Secret"));
    }

    #[test]
    fn extra_resources_only_matter_with_prune() {
        let report = DriftReport {
            extra: vec![cm("leftover")],
            ..Default::default()
        };
        assert!(!report.is_clean());
        assert!(report.requires_correction(true));
        assert!(!report.requires_correction(false));
    }

    #[test]
    fn mutations_always_require_correction() {
        let report = DriftReport {
            mutated: vec![cm("settings")],
            ..Default::default()
        };
        assert!(report.requires_correction(false));
        assert!(report.requires_correction(true));
    }

    #[test]
    fn applied_set_json_flattens_reference() {
        let set = AppliedSet {
            revision: "sha256:abc".to_string(),
            resources: vec![AppliedResource {
                reference: cm("settings"),
                digest: "sha256:def".to_string(),
            }],
        };
        let json = serde_json::to_string(&set).unwrap();
        assert!(json.contains("\"kind\":\"ConfigMap\""));
        let parsed: AppliedSet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, set);
        assert!(parsed.contains(&cm("settings")));
    }
}
