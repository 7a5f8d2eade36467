//! Unit declarations: the Flux-style `Kustomization` documents that name a
//! reconciliation unit, its source path, interval, dependencies and prune
//! behaviour.
//!
//! ```yaml
//! apiVersion: kustomize.toolkit.fluxcd.io/v1
//! kind: Kustomization
//! metadata:
//!   name: apps
//! spec:
//!   interval: 10m0s
//!   path: ./apps
//!   prune: true
//!   dependsOn:
//!     - name: infra
//!     - name: image-auto
//! ```

use crate::error::{FluxError, Result};
use crate::paths;
use crate::render::{ImageOverride, Overlay};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const KUSTOMIZATION_KIND: &str = "Kustomization";

// ---------------------------------------------------------------------------
// UnitDeclaration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDeclaration {
    pub name: String,
    pub source_path: String,
    #[serde(
        serialize_with = "serialize_interval",
        deserialize_with = "deserialize_interval"
    )]
    pub interval: Duration,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default)]
    pub overlay: Overlay,
}

impl UnitDeclaration {
    pub fn new(name: impl Into<String>, source_path: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
            interval,
            depends_on: Vec::new(),
            prune: false,
            suspend: false,
            overlay: Overlay::default(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }
}

// ---------------------------------------------------------------------------
// Flux Kustomization document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KustomizationDoc {
    metadata: ObjectMeta,
    spec: KustomizationSpec,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KustomizationSpec {
    #[serde(default = "default_path")]
    path: String,
    interval: String,
    #[serde(default)]
    depends_on: Vec<DependencyRef>,
    #[serde(default)]
    prune: bool,
    #[serde(default)]
    suspend: bool,
    #[serde(default)]
    target_namespace: Option<String>,
    #[serde(default)]
    common_labels: BTreeMap<String, String>,
    #[serde(default)]
    images: Vec<ImageOverride>,
}

#[derive(Debug, Deserialize)]
struct DependencyRef {
    name: String,
}

fn default_path() -> String {
    "./".to_string()
}

/// Parse every `Kustomization` document in a (possibly multi-document) YAML
/// string. Documents of other kinds are ignored so declarations can sit next
/// to unrelated manifests. `origin` is only used in error messages.
pub fn parse_declarations(data: &str, origin: &str) -> Result<Vec<UnitDeclaration>> {
    let mut out = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or("");
        if kind != KUSTOMIZATION_KIND {
            continue;
        }
        let doc: KustomizationDoc =
            serde_yaml::from_value(value).map_err(|e| FluxError::InvalidDeclaration {
                file: origin.to_string(),
                reason: e.to_string(),
            })?;
        paths::validate_name(&doc.metadata.name)?;
        let interval = parse_interval(&doc.spec.interval)?;
        out.push(UnitDeclaration {
            name: doc.metadata.name,
            source_path: doc.spec.path,
            interval,
            depends_on: doc.spec.depends_on.into_iter().map(|d| d.name).collect(),
            prune: doc.spec.prune,
            suspend: doc.spec.suspend,
            overlay: Overlay {
                target_namespace: doc.spec.target_namespace,
                common_labels: doc.spec.common_labels,
                images: doc.spec.images,
            },
        });
    }
    Ok(out)
}

/// Load all declarations from `*.yaml` / `*.yml` files directly inside `dir`,
/// in file-name order.
pub fn load_declarations(dir: &Path) -> Result<Vec<UnitDeclaration>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    files.sort();

    let mut out = Vec::new();
    for file in files {
        let data = std::fs::read_to_string(&file)?;
        out.extend(parse_declarations(&data, &file.display().to_string())?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Interval parsing (Go duration syntax, as written in Flux manifests)
// ---------------------------------------------------------------------------

/// Parse a duration such as `10m`, `1h30m`, `10m0s` or `500ms`.
pub fn parse_interval(s: &str) -> Result<Duration> {
    let invalid = || FluxError::InvalidInterval(s.to_string());
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let mut total_ms: u64 = 0;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let factor_ms = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            _ => return Err(invalid()),
        };
        total_ms = value
            .checked_mul(factor_ms)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }

    if total_ms == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_millis(total_ms))
}

/// Render a duration in the compact form `parse_interval` accepts.
pub fn format_interval(d: Duration) -> String {
    let total_ms = d.as_millis() as u64;
    if total_ms == 0 {
        return "0s".to_string();
    }
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1_000;
    let millis = total_ms % 1_000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0 {
        out.push_str(&format!("{seconds}s"));
    }
    if millis > 0 {
        out.push_str(&format!("{millis}ms"));
    }
    out
}

fn serialize_interval<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&format_interval(*d))
}

fn deserialize_interval<'de, D>(d: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    parse_interval(&raw).map_err(serde::de::Error::custom)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STAGED: &str = r#"
apiVersion: kustomize.toolkit.fluxcd.io/v1
kind: Kustomization
metadata:
  name: infra
  namespace: flux-system
spec:
  interval: 10m0s
  path: ./infrastructure
  prune: true
---
apiVersion: kustomize.toolkit.fluxcd.io/v1
kind: Kustomization
metadata:
  name: apps
spec:
  interval: 5m
  path: ./apps
  dependsOn:
    - name: infra
    - name: image-auto
  targetNamespace: web
  commonLabels:
    team: platform
  images:
    - name: ghcr.io/acme/web
      newTag: 1.4.2
"#;

    #[test]
    fn parses_multi_document_declarations() {
        let decls = parse_declarations(STAGED, "clusters.yaml").unwrap();
        assert_eq!(decls.len(), 2);

        let infra = &decls[0];
        assert_eq!(infra.name, "infra");
        assert_eq!(infra.source_path, "./infrastructure");
        assert_eq!(infra.interval, Duration::from_secs(600));
        assert!(infra.prune);
        assert!(infra.depends_on.is_empty());

        let apps = &decls[1];
        assert_eq!(apps.depends_on, vec!["infra", "image-auto"]);
        assert!(!apps.prune);
        assert_eq!(apps.overlay.target_namespace.as_deref(), Some("web"));
        assert_eq!(apps.overlay.common_labels["team"], "platform");
        assert_eq!(apps.overlay.images[0].new_tag.as_deref(), Some("1.4.2"));
    }

    #[test]
    fn ignores_other_kinds_and_empty_documents() {
        let yaml = "---\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: flux-system\n";
        assert!(parse_declarations(yaml, "ns.yaml").unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_interval() {
        let yaml = "kind: Kustomization\nmetadata:\n  name: infra\nspec:\n  interval: soon\n";
        assert!(matches!(
            parse_declarations(yaml, "x.yaml"),
            Err(FluxError::InvalidInterval(_))
        ));
    }

    #[test]
    fn rejects_invalid_name() {
        let yaml = "kind: Kustomization\nmetadata:\n  name: Infra_1\nspec:\n  interval: 1m\n";
        assert!(matches!(
            parse_declarations(yaml, "x.yaml"),
            Err(FluxError::InvalidName(_))
        ));
    }

    #[test]
    fn missing_spec_is_invalid_declaration() {
        let yaml = "kind: Kustomization\nmetadata:\n  name: infra\n";
        let err = parse_declarations(yaml, "broken.yaml").unwrap_err();
        assert!(err.to_string().contains("broken.yaml"), "{err}");
    }

    #[test]
    fn load_reads_yaml_files_in_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("20-apps.yaml"),
            "kind: Kustomization\nmetadata:\n  name: apps\nspec:\n  interval: 1m\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("10-infra.yml"),
            "kind: Kustomization\nmetadata:\n  name: infra\nspec:\n  interval: 1m\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not yaml").unwrap();

        let decls = load_declarations(dir.path()).unwrap();
        let names: Vec<_> = decls.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["infra", "apps"]);
    }

    #[test]
    fn load_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(load_declarations(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn interval_forms() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_interval("10m0s").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_interval("250ms").unwrap(), Duration::from_millis(250));
        for bad in ["", "10", "m", "5d", "0s", "1h-2m", "abc"] {
            assert!(parse_interval(bad).is_err(), "expected error for {bad:?}");
        }
    }

    #[test]
    fn interval_format_is_compact() {
        assert_eq!(format_interval(Duration::from_secs(600)), "10m");
        assert_eq!(format_interval(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_interval(Duration::from_millis(1500)), "1s500ms");
    }

    #[test]
    fn declaration_serde_uses_interval_strings() {
        let decl = UnitDeclaration::new("infra", "./infrastructure", Duration::from_secs(600))
            .with_prune(true);
        let yaml = serde_yaml::to_string(&decl).unwrap();
        assert!(yaml.contains("interval: 10m"));
        let parsed: UnitDeclaration = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, decl);
    }
}
