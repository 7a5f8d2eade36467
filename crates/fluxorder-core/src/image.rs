//! Image automation: pick the newest tag allowed by a policy and rewrite the
//! marked image references in the source tree.
//!
//! Lines are selected by a trailing Flux-style setter marker:
//!
//! ```yaml
//! image: ghcr.io/stefanprodan/podinfo:6.0.0 # {"$imagepolicy": "flux-system:podinfo"}
//! tag: 6.0.0 # {"$imagepolicy": "flux-system:podinfo:tag"}
//! ```
//!
//! The rewrite changes the source content hash, so the affected units pick
//! it up through the ordinary source-change path.

use crate::error::{FluxError, Result};
use crate::io::atomic_write;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// How candidate tags are ranked. `Asc` picks the greatest tag, `Desc` the
/// smallest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    Semver {
        range: String,
    },
    Alphabetical {
        #[serde(default)]
        order: SortOrder,
    },
    Numerical {
        #[serde(default)]
        order: SortOrder,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePolicy {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Repository without tag, e.g. `ghcr.io/stefanprodan/podinfo`.
    pub image: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub policy: PolicyRule,
    /// Tags not matching this regex are ignored. When the pattern has a
    /// capture group, the first group is what gets ranked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

fn default_namespace() -> String {
    "flux-system".to_string()
}

fn policy_err(policy: &str, reason: impl std::fmt::Display) -> FluxError {
    FluxError::ImagePolicy(format!("{policy}: {reason}"))
}

impl ImagePolicy {
    /// `<namespace>:<name>`, the key used in setter markers.
    pub fn key(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }

    pub fn check(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(policy_err(&self.name, "image must not be empty"));
        }
        if let PolicyRule::Semver { range } = &self.policy {
            parse_range(range).map_err(|e| policy_err(&self.name, e))?;
        }
        self.filter_regex()?;
        Ok(())
    }

    fn filter_regex(&self) -> Result<Option<Regex>> {
        match &self.filter {
            Some(pattern) => Regex::new(pattern)
                .map(Some)
                .map_err(|e| policy_err(&self.name, e)),
            None => Ok(None),
        }
    }

    /// The newest tag among `tags` according to the policy, or `None` when
    /// no tag qualifies.
    pub fn select_latest<S: AsRef<str>>(&self, tags: &[S]) -> Result<Option<String>> {
        let filter = self.filter_regex()?;

        // (original tag, ranked value)
        let mut candidates: Vec<(String, String)> = Vec::new();
        for tag in tags {
            let tag = tag.as_ref();
            let ranked = match &filter {
                Some(re) => match re.captures(tag) {
                    Some(caps) => caps
                        .get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| m.as_str().to_string()),
                    None => None,
                },
                None => Some(tag.to_string()),
            };
            if let Some(ranked) = ranked {
                candidates.push((tag.to_string(), ranked));
            }
        }

        let best = match &self.policy {
            PolicyRule::Semver { range } => {
                let req = parse_range(range).map_err(|e| policy_err(&self.name, e))?;
                candidates
                    .into_iter()
                    .filter_map(|(tag, ranked)| parse_version(&ranked).map(|v| (tag, v)))
                    .filter(|(_, v)| req.matches(v))
                    .max_by(|a, b| a.1.cmp(&b.1))
                    .map(|(tag, _)| tag)
            }
            PolicyRule::Alphabetical { order } => {
                pick(candidates, *order, |a, b| a.cmp(b)).map(|(tag, _)| tag)
            }
            PolicyRule::Numerical { order } => {
                let numeric: Vec<(String, f64)> = candidates
                    .into_iter()
                    .filter_map(|(tag, ranked)| ranked.parse::<f64>().ok().map(|n| (tag, n)))
                    .collect();
                pick(numeric, *order, |a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                    .map(|(tag, _)| tag)
            }
        };
        Ok(best)
    }
}

fn pick<T>(
    items: Vec<(String, T)>,
    order: SortOrder,
    cmp: impl Fn(&T, &T) -> Ordering,
) -> Option<(String, T)> {
    match order {
        SortOrder::Asc => items.into_iter().max_by(|a, b| cmp(&a.1, &b.1)),
        SortOrder::Desc => items.into_iter().min_by(|a, b| cmp(&a.1, &b.1)),
    }
}

fn parse_version(tag: &str) -> Option<semver::Version> {
    semver::Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()
}

/// Accepts both `semver` crate syntax (`>=1.0.0, <2.0.0`) and the
/// space-separated form common in Flux policies (`>=1.0.0 <2.0.0`).
fn parse_range(range: &str) -> std::result::Result<semver::VersionReq, semver::Error> {
    if range.contains(',') {
        return semver::VersionReq::parse(range);
    }
    let mut parts: Vec<String> = Vec::new();
    let mut pending_op = String::new();
    for token in range.split_whitespace() {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
            pending_op.push_str(token);
            continue;
        }
        parts.push(format!("{}{}", std::mem::take(&mut pending_op), token));
    }
    semver::VersionReq::parse(&parts.join(", "))
}

// ---------------------------------------------------------------------------
// Source rewriting
// ---------------------------------------------------------------------------

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"#\s*\{\s*"\$imagepolicy"\s*:\s*"([^"]+)"\s*\}"#).expect("valid regex")
    })
}

fn value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r##"^(\s*(?:-\s+)?[A-Za-z_][\w-]*:\s*)("?)([^\s"#]+)("?)(\s*)#"##)
            .expect("valid regex")
    })
}

/// Rewrite one line if it carries a marker for `policy`. Returns `None`
/// when the line is left as is.
fn rewrite_line(line: &str, policy: &ImagePolicy, key: &str, tag: &str) -> Option<String> {
    let marker = marker_re().captures(line)?;
    let target = marker.get(1)?.as_str();
    let replacement = if target == key {
        format!("{}:{}", policy.image, tag)
    } else if target.strip_prefix(key) == Some(":tag") {
        tag.to_string()
    } else if target.strip_prefix(key) == Some(":name") {
        policy.image.clone()
    } else {
        return None;
    };

    let caps = value_re().captures(line)?;
    let current = caps.get(3)?;
    if current.as_str() == replacement {
        return None;
    }
    let mut out = String::with_capacity(line.len() + replacement.len());
    out.push_str(&line[..current.start()]);
    out.push_str(&replacement);
    out.push_str(&line[current.end()..]);
    Some(out)
}

/// Point every reference marked for `policy` under `root` at `tag`.
///
/// Hidden files and directories are skipped. Returns the files that
/// changed, sorted.
pub fn update_sources(root: &Path, policy: &ImagePolicy, tag: &str) -> Result<Vec<PathBuf>> {
    let key = policy.key();
    let mut files: Vec<PathBuf> = WalkDir::new(root)
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

    let mut changed = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file)?;
        let mut dirty = false;
        let mut out = String::with_capacity(text.len());
        for line in text.split_inclusive('\n') {
            let (body, newline) = match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            };
            match rewrite_line(body, policy, &key, tag) {
                Some(new) => {
                    dirty = true;
                    out.push_str(&new);
                }
                None => out.push_str(body),
            }
            out.push_str(newline);
        }
        if dirty {
            atomic_write(&file, out.as_bytes())?;
            tracing::info!(file = %file.display(), policy = %key, tag, "image reference updated");
            changed.push(file);
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn semver_policy(range: &str) -> ImagePolicy {
        ImagePolicy {
            name: "podinfo".to_string(),
            namespace: "flux-system".to_string(),
            image: "ghcr.io/stefanprodan/podinfo".to_string(),
            policy: PolicyRule::Semver {
                range: range.to_string(),
            },
            filter: None,
        }
    }

    #[test]
    fn semver_picks_highest_in_range() {
        let policy = semver_policy(">=6.0.0 <7.0.0");
        let tags = ["5.2.1", "6.0.0", "v6.3.5", "6.10.0", "7.0.0", "latest"];
        assert_eq!(
            policy.select_latest(&tags).unwrap().as_deref(),
            Some("6.10.0")
        );
    }

    #[test]
    fn semver_accepts_comma_ranges_and_v_prefix() {
        let policy = semver_policy(">=1.0.0, <2.0.0");
        assert_eq!(
            policy.select_latest(&["v1.2.0", "v1.10.1", "v2.0.0"]).unwrap().as_deref(),
            Some("v1.10.1")
        );
    }

    #[test]
    fn no_qualifying_tag_is_none() {
        let policy = semver_policy("^9");
        assert!(policy.select_latest(&["1.0.0"]).unwrap().is_none());
    }

    #[test]
    fn numerical_with_extracting_filter() {
        let policy = ImagePolicy {
            policy: PolicyRule::Numerical {
                order: SortOrder::Asc,
            },
            filter: Some(r"^main-[a-f0-9]+-(\d+)$".to_string()),
            ..semver_policy("*")
        };
        let tags = ["main-abc123-100", "main-def456-99", "main-0a1b2c-1000", "dev-1-5000"];
        assert_eq!(
            policy.select_latest(&tags).unwrap().as_deref(),
            Some("main-0a1b2c-1000")
        );
    }

    #[test]
    fn alphabetical_desc_picks_smallest() {
        let policy = ImagePolicy {
            policy: PolicyRule::Alphabetical {
                order: SortOrder::Desc,
            },
            ..semver_policy("*")
        };
        assert_eq!(
            policy.select_latest(&["b", "a", "c"]).unwrap().as_deref(),
            Some("a")
        );
    }

    #[test]
    fn check_rejects_bad_range_and_filter() {
        assert!(semver_policy("not a range").check().is_err());
        let bad_filter = ImagePolicy {
            filter: Some("(".to_string()),
            ..semver_policy("*")
        };
        assert!(matches!(bad_filter.check(), Err(FluxError::ImagePolicy(_))));
        assert!(semver_policy(">=1.0.0").check().is_ok());
    }

    #[test]
    fn policy_rule_yaml_shape() {
        let yaml = "name: podinfo\nimage: ghcr.io/stefanprodan/podinfo\npolicy:\n  semver:\n    range: '>=6.0.0'\n";
        let policy: ImagePolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.namespace, "flux-system");
        assert_eq!(
            policy.policy,
            PolicyRule::Semver {
                range: ">=6.0.0".to_string()
            }
        );
    }

    #[test]
    fn update_sources_rewrites_marked_lines_only() {
        let dir = TempDir::new().unwrap();
        let apps = dir.path().join("apps");
        std::fs::create_dir_all(&apps).unwrap();
        let deploy = apps.join("deployment.yaml");
        std::fs::write(
            &deploy,
            concat!(
                "spec:\n",
                "  containers:\n",
                "    - name: podinfo\n",
                "      image: ghcr.io/stefanprodan/podinfo:6.0.0 # {\"$imagepolicy\": \"flux-system:podinfo\"}\n",
                "    - name: sidecar\n",
                "      image: busybox:1.36\n",
            ),
        )
        .unwrap();
        let values = apps.join("values.yaml");
        std::fs::write(
            &values,
            "tag: \"6.0.0\" # {\"$imagepolicy\": \"flux-system:podinfo:tag\"}\n",
        )
        .unwrap();
        std::fs::write(
            apps.join("other.yaml"),
            "image: nginx:1.0 # {\"$imagepolicy\": \"flux-system:nginx\"}\n",
        )
        .unwrap();

        let changed = update_sources(dir.path(), &semver_policy("*"), "6.3.5").unwrap();
        assert_eq!(changed, vec![deploy.clone(), values.clone()]);

        let text = std::fs::read_to_string(&deploy).unwrap();
        assert!(text.contains(
            "image: ghcr.io/stefanprodan/podinfo:6.3.5 # {\"$imagepolicy\": \"flux-system:podinfo\"}"
        ));
        assert!(text.contains("image: busybox:1.36\n"));
        assert_eq!(
            std::fs::read_to_string(&values).unwrap(),
            "tag: \"6.3.5\" # {\"$imagepolicy\": \"flux-system:podinfo:tag\"}\n"
        );
    }

    #[test]
    fn update_sources_is_noop_when_current() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("d.yaml"),
            "image: ghcr.io/stefanprodan/podinfo:6.3.5 # {\"$imagepolicy\": \"flux-system:podinfo\"}\n",
        )
        .unwrap();
        let changed = update_sources(dir.path(), &semver_policy("*"), "6.3.5").unwrap();
        assert!(changed.is_empty());
    }
}
