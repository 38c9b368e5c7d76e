//! tillerman manifest: parse rendered release manifests into per-resource maps and diff them.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_yaml::Value as Yaml;
use thiserror::Error;
use tillerman_core::RenderedRelease;
use tracing::debug;

const HOOK_ANNOTATION: &str = "helm.sh/hook";
const TEST_HOOKS: [&str; 3] = ["test", "test-success", "test-failure"];

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("malformed manifest document {index}: {source}")]
    Yaml { index: usize, #[source] source: serde_yaml::Error },
    #[error("manifest document {index} missing {field}")]
    MissingField { index: usize, field: &'static str },
}

/// One rendered resource, keyed in a [`ManifestMap`] by namespace/name/kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingResult {
    pub name: String,
    pub kind: String,
    /// Canonical YAML text, used for the human diff.
    pub content: String,
    #[serde(skip)]
    pub value: Yaml,
}

pub type ManifestMap = BTreeMap<String, MappingResult>;

/// Split a multi-document manifest and key each resource as `"<ns>, <name>, <Kind> (<apiVersion>)"`.
/// Resources without a namespace are placed in `default_namespace`.
pub fn parse(manifest: &str, default_namespace: &str) -> Result<ManifestMap, DiffError> {
    let mut out = ManifestMap::new();
    parse_into(&mut out, manifest, default_namespace, false)?;
    Ok(out)
}

/// Parse a release's manifest plus its hooks. Test hooks are not part of the deployed state.
pub fn parse_release(release: &RenderedRelease) -> Result<ManifestMap, DiffError> {
    let mut out = ManifestMap::new();
    parse_into(&mut out, &release.manifest, &release.namespace, false)?;
    for hook in &release.hooks {
        parse_into(&mut out, hook, &release.namespace, true)?;
    }
    Ok(out)
}

/// Extraction rule shared by both sides of a comparison.
pub fn select(release: &RenderedRelease, hooks_disabled: bool) -> Result<ManifestMap, DiffError> {
    if hooks_disabled {
        parse(&release.manifest, &release.namespace)
    } else {
        parse_release(release)
    }
}

fn parse_into(out: &mut ManifestMap, manifest: &str, default_namespace: &str, skip_tests: bool) -> Result<(), DiffError> {
    for (index, doc) in serde_yaml::Deserializer::from_str(manifest).enumerate() {
        let value = Yaml::deserialize(doc).map_err(|source| DiffError::Yaml { index, source })?;
        if value.is_null() {
            continue;
        }
        if skip_tests && is_test_hook(&value) {
            debug!(index, "skipping test hook");
            continue;
        }
        let kind = str_at(&value, &["kind"]).ok_or(DiffError::MissingField { index, field: "kind" })?;
        let name = str_at(&value, &["metadata", "name"]).ok_or(DiffError::MissingField { index, field: "metadata.name" })?;
        let api_version = str_at(&value, &["apiVersion"]).unwrap_or("");
        let ns = str_at(&value, &["metadata", "namespace"]).unwrap_or(default_namespace);
        let key = format!("{}, {}, {} ({})", ns, name, kind, api_version);
        let content = serde_yaml::to_string(&value).map_err(|source| DiffError::Yaml { index, source })?;
        out.insert(key, MappingResult { name: name.to_string(), kind: kind.to_string(), content, value });
    }
    Ok(())
}

fn str_at<'a>(v: &'a Yaml, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for p in path {
        cur = cur.get(*p)?;
    }
    cur.as_str()
}

fn is_test_hook(v: &Yaml) -> bool {
    let Some(events) = v.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(HOOK_ANNOTATION)).and_then(|h| h.as_str()) else {
        return false;
    };
    events.split(',').map(str::trim).any(|e| TEST_HOOKS.contains(&e))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn has_changes(&self) -> bool {
        self.adds + self.updates + self.removes > 0
    }
}

/// Compare resources structurally and write a line-level diff of each difference to `out`.
/// Failures writing to `out` are ignored; the summary is the result.
pub fn diff_manifests<W: Write>(old: &ManifestMap, new: &ManifestMap, out: &mut W) -> DiffSummary {
    let mut summary = DiffSummary::default();
    for (key, old_res) in old {
        match new.get(key) {
            Some(new_res) if new_res.value == old_res.value => {}
            Some(new_res) => {
                summary.updates += 1;
                let _ = writeln!(out, "{} has changed:", key);
                write_lines(out, &line_diff(&old_res.content, &new_res.content));
            }
            None => {
                summary.removes += 1;
                let _ = writeln!(out, "{} has been removed:", key);
                write_lines(out, &line_diff(&old_res.content, ""));
            }
        }
    }
    for (key, new_res) in new {
        if !old.contains_key(key) {
            summary.adds += 1;
            let _ = writeln!(out, "{} has been added:", key);
            write_lines(out, &line_diff("", &new_res.content));
        }
    }
    summary
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line<'a> {
    Same(&'a str),
    Removed(&'a str),
    Added(&'a str),
}

fn write_lines<W: Write>(out: &mut W, lines: &[Line<'_>]) {
    for l in lines {
        let _ = match l {
            Line::Same(s) => writeln!(out, "  {}", s),
            Line::Removed(s) => writeln!(out, "- {}", s),
            Line::Added(s) => writeln!(out, "+ {}", s),
        };
    }
}

/// Cap on LCS table cells; larger changed regions are shown as a plain remove/add block.
const MAX_LCS_CELLS: usize = 1 << 20;

/// Line diff: common head and tail are trimmed, then the changed middle is aligned by
/// longest common subsequence when it fits under [`MAX_LCS_CELLS`].
fn line_diff<'a>(old: &'a str, new: &'a str) -> Vec<Line<'a>> {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    let head = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let tail = a[head..].iter().rev().zip(b[head..].iter().rev()).take_while(|(x, y)| x == y).count();
    let (mid_a, mid_b) = (&a[head..a.len() - tail], &b[head..b.len() - tail]);

    let mut out = Vec::with_capacity(a.len().max(b.len()));
    out.extend(a[..head].iter().map(|s| Line::Same(*s)));
    if (mid_a.len() + 1).saturating_mul(mid_b.len() + 1) > MAX_LCS_CELLS {
        out.extend(mid_a.iter().map(|s| Line::Removed(*s)));
        out.extend(mid_b.iter().map(|s| Line::Added(*s)));
    } else {
        lcs_diff(mid_a, mid_b, &mut out);
    }
    out.extend(a[a.len() - tail..].iter().map(|s| Line::Same(*s)));
    out
}

fn lcs_diff<'a>(a: &[&'a str], b: &[&'a str], out: &mut Vec<Line<'a>>) {
    let (n, m) = (a.len(), b.len());
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a[i] == b[j] { lcs[i + 1][j + 1] + 1 } else { lcs[i + 1][j].max(lcs[i][j + 1]) };
        }
    }
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            out.push(Line::Same(a[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push(Line::Removed(a[i]));
            i += 1;
        } else {
            out.push(Line::Added(b[j]));
            j += 1;
        }
    }
    out.extend(a[i..].iter().map(|s| Line::Removed(*s)));
    out.extend(b[j..].iter().map(|s| Line::Added(*s)));
}

/// Answers whether a proposed set of resources differs from the current one.
pub trait ManifestDiffer: Send + Sync {
    fn has_changes(&self, current: &ManifestMap, proposed: &ManifestMap) -> bool;
}

/// Writes the human diff to stderr; stdout is reserved for the result document.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrDiffer;

impl ManifestDiffer for StderrDiffer {
    fn has_changes(&self, current: &ManifestMap, proposed: &ManifestMap) -> bool {
        let summary = diff_manifests(current, proposed, &mut std::io::stderr().lock());
        debug!(adds = summary.adds, updates = summary.updates, removes = summary.removes, "manifest diff");
        summary.has_changes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOY_V2: &str = "---
# Source: web/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
---
# Source: web/templates/service.yaml
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: edge
spec:
  ports:
  - port: 80
";

    #[test]
    fn parse_keys_resources_and_defaults_namespace() {
        let m = parse(DEPLOY_V2, "apps").unwrap();
        let keys: Vec<_> = m.keys().cloned().collect();
        assert_eq!(keys, vec!["apps, web, Deployment (apps/v1)", "edge, web, Service (v1)"]);
        assert_eq!(m["apps, web, Deployment (apps/v1)"].kind, "Deployment");
    }

    #[test]
    fn parse_skips_empty_documents() {
        let m = parse("---\n# only a comment\n---\n\n", "default").unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn parse_errors_on_malformed_or_incomplete_docs() {
        let e = parse("kind: [unclosed\n", "default").unwrap_err();
        assert!(matches!(e, DiffError::Yaml { .. }), "e={}", e);
        let e = parse("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n", "default").unwrap_err();
        assert!(e.to_string().contains("missing metadata.name"), "e={}", e);
        let e = parse("apiVersion: v1\nmetadata:\n  name: x\n", "default").unwrap_err();
        assert!(e.to_string().contains("missing kind"), "e={}", e);
    }

    #[test]
    fn formatting_only_changes_are_not_differences() {
        let a = parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\ndata:\n  a: '1'\n  b: '2'\n", "ns").unwrap();
        let b = parse("kind: ConfigMap\napiVersion: v1\nmetadata: {name: x}\ndata: {b: \"2\", a: \"1\"}\n", "ns").unwrap();
        let mut sink = Vec::new();
        let s = diff_manifests(&a, &b, &mut sink);
        assert!(!s.has_changes());
        assert!(sink.is_empty());
    }

    #[test]
    fn diff_reports_updates_adds_and_removes() {
        let old = parse(DEPLOY_V2, "apps").unwrap();
        let new = parse(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 3\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: web-config\n",
            "apps",
        )
        .unwrap();
        let mut sink = Vec::new();
        let s = diff_manifests(&old, &new, &mut sink);
        assert_eq!(s, DiffSummary { adds: 1, updates: 1, removes: 1 });
        let text = String::from_utf8(sink).unwrap();
        assert!(text.contains("apps, web, Deployment (apps/v1) has changed:"), "{}", text);
        assert!(text.contains("-   replicas: 2"), "{}", text);
        assert!(text.contains("+   replicas: 3"), "{}", text);
        assert!(text.contains("edge, web, Service (v1) has been removed:"), "{}", text);
        assert!(text.contains("apps, web-config, ConfigMap (v1) has been added:"), "{}", text);
    }

    #[test]
    fn release_parse_includes_hooks_but_not_test_hooks() {
        let rel = RenderedRelease {
            namespace: "apps".into(),
            manifest: DEPLOY_V2.into(),
            hooks: vec![
                "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: migrate\n  annotations:\n    helm.sh/hook: pre-upgrade,pre-install\n".into(),
                "apiVersion: v1\nkind: Pod\nmetadata:\n  name: web-test\n  annotations:\n    helm.sh/hook: test-success\n".into(),
            ],
        };
        let full = select(&rel, false).unwrap();
        assert!(full.contains_key("apps, migrate, Job (batch/v1)"));
        assert!(!full.contains_key("apps, web-test, Pod (v1)"));
        let bare = select(&rel, true).unwrap();
        assert_eq!(bare.len(), 2);
    }

    #[test]
    fn large_resources_diff_without_quadratic_table() {
        let lines = 6000;
        let body = |changed: bool| -> String {
            let mut s = String::from("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: dashboards\ndata:\n");
            for i in 0..lines {
                let v = if changed && i % 2 == 1 { "b" } else { "a" };
                s.push_str(&format!("  k{}: {}\n", i, v));
            }
            s
        };
        let (old, new) = (body(false), body(true));
        let d = line_diff(&old, &new);
        let removed = d.iter().filter(|l| matches!(l, Line::Removed(_))).count();
        let added = d.iter().filter(|l| matches!(l, Line::Added(_))).count();
        let same = d.iter().filter(|l| matches!(l, Line::Same(_))).count();
        // first data line is shared; the rest of the data block is one remove/add run
        assert_eq!(same, 6);
        assert_eq!(removed, lines - 1);
        assert_eq!(added, lines - 1);
        assert_eq!(d[5], Line::Same("  k0: a"));

        let a = parse(&old, "monitoring").unwrap();
        let b = parse(&new, "monitoring").unwrap();
        let mut sink = Vec::new();
        let s = diff_manifests(&a, &b, &mut sink);
        assert_eq!(s, DiffSummary { adds: 0, updates: 1, removes: 0 });
        assert!(!sink.is_empty());
    }

    #[test]
    fn line_diff_trims_shared_head_and_tail() {
        let d = line_diff("a\nb\nc\nd\n", "a\nb\nx\nd\n");
        assert_eq!(d, vec![Line::Same("a"), Line::Same("b"), Line::Removed("c"), Line::Added("x"), Line::Same("d")]);
        assert_eq!(line_diff("a\nb\n", "a\nb\n"), vec![Line::Same("a"), Line::Same("b")]);
        assert_eq!(line_diff("", "a\n"), vec![Line::Added("a")]);
    }

    #[test]
    fn line_diff_keeps_common_lines() {
        let d = line_diff("a\nb\nc\n", "a\nx\nc\n");
        assert_eq!(d, vec![Line::Same("a"), Line::Removed("b"), Line::Added("x"), Line::Same("c")]);
    }
}
