//! Manifest rendering: raw multi-document YAML plus a unit's overlay
//! parameters in, a [`ResourceSet`] out.
//!
//! Rendering is a pure function of its inputs. The bundled
//! [`OverlayRenderer`] covers the overlay features unit declarations expose
//! (target namespace, common labels, image overrides); full kustomize
//! builds are left to an external renderer implementing [`Renderer`].

use crate::error::{FluxError, Result};
use crate::resource::{is_cluster_scoped, Resource, ResourceSet};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashSet};

// ---------------------------------------------------------------------------
// Overlay parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    /// Namespace forced onto every namespaced resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub common_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageOverride>,
}

/// Kustomize-style image override, matched on the image name without tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOverride {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

pub trait Renderer: Send + Sync {
    fn render(&self, raw: &[u8], overlay: &Overlay) -> Result<ResourceSet>;
}

#[derive(Debug, Clone, Default)]
pub struct OverlayRenderer;

impl Renderer for OverlayRenderer {
    fn render(&self, raw: &[u8], overlay: &Overlay) -> Result<ResourceSet> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| FluxError::Render(format!("manifests are not UTF-8: {e}")))?;

        let mut resources = Vec::new();
        let mut seen = HashSet::new();
        for document in serde_yaml::Deserializer::from_str(text) {
            let mut value = Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            // Kustomize entry points are consumed by the renderer, never applied.
            if kind_of(&value) == Some("Kustomization") {
                continue;
            }
            apply_overlay(&mut value, overlay)?;
            let resource = to_resource(value)?;
            if !seen.insert(resource.reference()) {
                return Err(FluxError::Render(format!(
                    "duplicate resource {}",
                    resource.reference()
                )));
            }
            resources.push(resource);
        }
        Ok(ResourceSet { resources })
    }
}

fn kind_of(value: &Value) -> Option<&str> {
    value.get("kind").and_then(Value::as_str)
}

fn to_resource(manifest: Value) -> Result<Resource> {
    let field = |key: &str| manifest.get(key).and_then(Value::as_str).map(str::to_string);
    let api_version =
        field("apiVersion").ok_or_else(|| FluxError::Render("resource without apiVersion".into()))?;
    let kind = field("kind").ok_or_else(|| FluxError::Render("resource without kind".into()))?;
    let metadata = manifest.get("metadata");
    let name = metadata
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| FluxError::Render(format!("{kind} without metadata.name")))?;
    let namespace = metadata
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Resource {
        api_version,
        kind,
        namespace,
        name,
        manifest,
    })
}

fn apply_overlay(value: &mut Value, overlay: &Overlay) -> Result<()> {
    let kind = kind_of(value).unwrap_or_default().to_string();
    let root = value
        .as_mapping_mut()
        .ok_or_else(|| FluxError::Render("manifest document is not a mapping".into()))?;
    let metadata = root
        .entry(Value::from("metadata"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let metadata = metadata
        .as_mapping_mut()
        .ok_or_else(|| FluxError::Render(format!("{kind} metadata is not a mapping")))?;

    if let Some(ns) = &overlay.target_namespace {
        if !is_cluster_scoped(&kind) {
            metadata.insert(Value::from("namespace"), Value::from(ns.as_str()));
        }
    }

    if !overlay.common_labels.is_empty() {
        let labels = metadata
            .entry(Value::from("labels"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if let Some(labels) = labels.as_mapping_mut() {
            for (k, v) in &overlay.common_labels {
                labels.insert(Value::from(k.as_str()), Value::from(v.as_str()));
            }
        }
    }

    if !overlay.images.is_empty() {
        rewrite_container_images(value, &overlay.images);
    }
    Ok(())
}

/// Walk the manifest and rewrite `image` fields of every entry in a
/// `containers` or `initContainers` list.
fn rewrite_container_images(value: &mut Value, images: &[ImageOverride]) {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map.iter_mut() {
                let is_container_list = matches!(
                    key.as_str(),
                    Some("containers") | Some("initContainers")
                );
                if is_container_list {
                    if let Some(list) = child.as_sequence_mut() {
                        for container in list {
                            rewrite_one(container, images);
                        }
                    }
                } else {
                    rewrite_container_images(child, images);
                }
            }
        }
        Value::Sequence(seq) => {
            for child in seq {
                rewrite_container_images(child, images);
            }
        }
        _ => {}
    }
}

fn rewrite_one(container: &mut Value, images: &[ImageOverride]) {
    let Some(current) = container.get("image").and_then(Value::as_str) else {
        return;
    };
    let reference = ImageRef::parse(current);
    let Some(rule) = images.iter().find(|i| i.name == reference.name) else {
        return;
    };
    let rewritten = reference.with_override(rule).to_string();
    if let Some(map) = container.as_mapping_mut() {
        map.insert(Value::from("image"), Value::from(rewritten));
    }
}

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// `name[:tag][@digest]`, where the tag separator is the last `:` after the
/// final `/` (so registry ports are not mistaken for tags).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(s: &str) -> Self {
        let (rest, digest) = match s.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (s, None),
        };
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                Self {
                    name: rest[..split].to_string(),
                    tag: Some(rest[split + 1..].to_string()),
                    digest,
                }
            }
            None => Self {
                name: rest.to_string(),
                tag: None,
                digest,
            },
        }
    }

    pub fn with_override(mut self, rule: &ImageOverride) -> Self {
        if let Some(name) = &rule.new_name {
            self.name = name.clone();
        }
        if let Some(tag) = &rule.new_tag {
            self.tag = Some(tag.clone());
        }
        if let Some(digest) = &rule.digest {
            self.digest = Some(digest.clone());
        }
        self
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFESTS: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: web
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: frontend
  labels:
    app: frontend
spec:
  template:
    spec:
      initContainers:
        - name: migrate
          image: ghcr.io/acme/web:1.0.0
      containers:
        - name: web
          image: ghcr.io/acme/web:1.0.0
        - name: proxy
          image: registry.local:5000/envoy:v1.29
---
apiVersion: kustomize.config.k8s.io/v1beta1
kind: Kustomization
resources:
  - deployment.yaml
"#;

    fn render(overlay: &Overlay) -> ResourceSet {
        OverlayRenderer.render(MANIFESTS.as_bytes(), overlay).unwrap()
    }

    fn image_at(set: &ResourceSet, list: &str, idx: usize) -> String {
        set.resources[1].manifest["spec"]["template"]["spec"][list][idx]["image"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn splits_documents_and_skips_kustomization_entrypoint() {
        let set = render(&Overlay::default());
        assert_eq!(set.len(), 2);
        assert_eq!(set.resources[0].kind, "Namespace");
        assert_eq!(set.resources[1].name, "frontend");
        assert_eq!(set.resources[1].reference().group, "apps");
    }

    #[test]
    fn target_namespace_skips_cluster_scoped_kinds() {
        let set = render(&Overlay {
            target_namespace: Some("web".into()),
            ..Default::default()
        });
        assert_eq!(set.resources[0].namespace, None);
        assert_eq!(set.resources[1].namespace.as_deref(), Some("web"));
    }

    #[test]
    fn common_labels_merge_with_existing() {
        let mut labels = BTreeMap::new();
        labels.insert("team".to_string(), "platform".to_string());
        let set = render(&Overlay {
            common_labels: labels,
            ..Default::default()
        });
        let meta = &set.resources[1].manifest["metadata"]["labels"];
        assert_eq!(meta["app"].as_str(), Some("frontend"));
        assert_eq!(meta["team"].as_str(), Some("platform"));
    }

    #[test]
    fn image_overrides_rewrite_matching_containers_only() {
        let set = render(&Overlay {
            images: vec![ImageOverride {
                name: "ghcr.io/acme/web".into(),
                new_tag: Some("1.4.2".into()),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(image_at(&set, "containers", 0), "ghcr.io/acme/web:1.4.2");
        assert_eq!(image_at(&set, "initContainers", 0), "ghcr.io/acme/web:1.4.2");
        assert_eq!(
            image_at(&set, "containers", 1),
            "registry.local:5000/envoy:v1.29"
        );
    }

    #[test]
    fn duplicate_resources_are_rejected() {
        let raw = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";
        let err = OverlayRenderer
            .render(raw.as_bytes(), &Overlay::default())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate resource"), "{err}");
    }

    #[test]
    fn missing_name_is_a_render_error() {
        let raw = "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
        assert!(matches!(
            OverlayRenderer.render(raw.as_bytes(), &Overlay::default()),
            Err(FluxError::Render(_))
        ));
    }

    #[test]
    fn image_ref_parsing() {
        let r = ImageRef::parse("registry.local:5000/envoy:v1.29");
        assert_eq!(r.name, "registry.local:5000/envoy");
        assert_eq!(r.tag.as_deref(), Some("v1.29"));

        let r = ImageRef::parse("registry.local:5000/envoy");
        assert_eq!(r.name, "registry.local:5000/envoy");
        assert_eq!(r.tag, None);

        let r = ImageRef::parse("nginx:1.25@sha256:abc");
        assert_eq!(r.name, "nginx");
        assert_eq!(r.tag.as_deref(), Some("1.25"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(r.to_string(), "nginx:1.25@sha256:abc");
    }
}
