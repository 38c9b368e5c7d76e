//! [`ReleaseBackend`] over the `helm` (v2) command line, talking to Tiller at the provisioned endpoint.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::Deserialize;
use tillerman_core::{Endpoint, ReleaseLookup, ReleaseRecord, ReleaseStatus, RenderedRelease};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{BackendError, DeleteRequest, Operation, ReleaseBackend, ReleaseRequest, UpgradeOptions, UpgradeResponse};

/// Extra time given to a helm process beyond its own timeouts before it is killed.
const PROCESS_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HelmCli {
    program: PathBuf,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self::new("helm")
    }
}

impl HelmCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// `TILLERMAN_HELM_BIN` or `helm` from `PATH`.
    pub fn from_env() -> Self {
        std::env::var("TILLERMAN_HELM_BIN").map(Self::new).unwrap_or_default()
    }

    async fn run(&self, op: Operation, endpoint: &Endpoint, args: Vec<String>, stdin: Option<&[u8]>, deadline: Duration) -> Result<String, BackendError> {
        let t0 = std::time::Instant::now();
        counter!("backend_calls", 1u64, "op" => op.as_str());
        debug!(op = %op, args = ?args, host = %endpoint, "running helm");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .args(connection_args(endpoint))
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|source| BackendError::Spawn { program: self.program.display().to_string(), source })?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes).await.map_err(|source| BackendError::Io { op, source })?;
            // closing stdin lets helm finish reading values
            drop(pipe);
        }

        let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(res) => res.map_err(|source| BackendError::Io { op, source })?,
            Err(_) => {
                counter!("backend_err", 1u64, "op" => op.as_str());
                return Err(BackendError::Timeout { op, after: deadline });
            }
        };
        histogram!("backend_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op.as_str());

        if !output.status.success() {
            counter!("backend_err", 1u64, "op" => op.as_str());
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = match stderr.trim() {
                "" => format!("helm exited with {}", output.status),
                text => text.strip_prefix("Error: ").unwrap_or(text).to_string(),
            };
            return Err(BackendError::Command { op, detail });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Description of the latest revision, e.g. "Install complete".
    async fn latest_description(&self, endpoint: &Endpoint, name: &str, fallback: &str) -> String {
        let fetched = self
            .run(Operation::History, endpoint, history_args(name), None, read_deadline(endpoint))
            .await
            .and_then(|out| parse_history_description(&out));
        match fetched {
            Ok(desc) => desc,
            Err(e) => {
                warn!(error = %e, release = %name, "could not fetch release description");
                fallback.to_string()
            }
        }
    }
}

#[async_trait::async_trait]
impl ReleaseBackend for HelmCli {
    async fn read(&self, endpoint: &Endpoint, name: &str) -> Result<ReleaseLookup, BackendError> {
        let deadline = read_deadline(endpoint);
        let listed = self.run(Operation::Read, endpoint, list_args(name), None, deadline).await?;
        let Some(entry) = find_listed(&listed, name)? else {
            debug!(release = %name, "release not found");
            return Ok(ReleaseLookup::NotFound);
        };
        let manifest = self.run(Operation::Read, endpoint, get_args("manifest", name), None, deadline).await?;
        let hooks = self.run(Operation::Read, endpoint, get_args("hooks", name), None, deadline).await?;
        Ok(ReleaseLookup::Found(ReleaseRecord {
            name: entry.name,
            status: ReleaseStatus::parse(&entry.status),
            rendered: RenderedRelease { namespace: entry.namespace, manifest, hooks: split_documents(&hooks) },
        }))
    }

    async fn install(&self, endpoint: &Endpoint, req: &ReleaseRequest) -> Result<String, BackendError> {
        info!(release = %req.name, chart = %req.chart.path.display(), ns = %req.namespace, "installing release");
        self.run(Operation::Install, endpoint, install_args(req), Some(&req.values), mutation_deadline(endpoint, req.timeout_secs))
            .await?;
        Ok(self.latest_description(endpoint, &req.name, "Install complete").await)
    }

    async fn upgrade(&self, endpoint: &Endpoint, req: &ReleaseRequest, opts: UpgradeOptions) -> Result<UpgradeResponse, BackendError> {
        let op = if opts.dry_run { Operation::Trial } else { Operation::Upgrade };
        if !opts.dry_run {
            info!(release = %req.name, chart = %req.chart.path.display(), force = opts.force, "upgrading release");
        }
        let out = self
            .run(op, endpoint, upgrade_args(req, opts), Some(&req.values), mutation_deadline(endpoint, req.timeout_secs))
            .await?;
        if opts.dry_run {
            let rendered = parse_release_dump(&out)?;
            return Ok(UpgradeResponse { description: String::new(), rendered: Some(rendered) });
        }
        let description = self.latest_description(endpoint, &req.name, "Upgrade complete").await;
        Ok(UpgradeResponse { description, rendered: None })
    }

    async fn delete(&self, endpoint: &Endpoint, req: &DeleteRequest) -> Result<String, BackendError> {
        info!(release = %req.name, purge = req.purge, "deleting release");
        let out = self
            .run(Operation::Delete, endpoint, delete_args(req), None, mutation_deadline(endpoint, req.timeout_secs))
            .await?;
        Ok(out.trim().to_string())
    }
}

fn read_deadline(endpoint: &Endpoint) -> Duration {
    endpoint.connect_timeout + PROCESS_GRACE
}

fn mutation_deadline(endpoint: &Endpoint, timeout_secs: u64) -> Duration {
    endpoint.connect_timeout + Duration::from_secs(timeout_secs) + PROCESS_GRACE
}

fn connection_args(endpoint: &Endpoint) -> Vec<String> {
    vec![
        "--host".into(),
        endpoint.host.clone(),
        "--tiller-connection-timeout".into(),
        endpoint.connect_timeout.as_secs().to_string(),
    ]
}

fn list_args(name: &str) -> Vec<String> {
    vec!["list".into(), "--all".into(), "--output".into(), "json".into(), format!("^{}$", escape_regex(name))]
}

fn get_args(what: &str, name: &str) -> Vec<String> {
    vec!["get".into(), what.into(), name.into()]
}

fn history_args(name: &str) -> Vec<String> {
    vec!["history".into(), name.into(), "--max".into(), "1".into(), "--output".into(), "json".into()]
}

fn install_args(req: &ReleaseRequest) -> Vec<String> {
    let mut args = vec![
        "install".into(),
        req.chart.path.display().to_string(),
        "--name".into(),
        req.name.clone(),
        "--namespace".into(),
        req.namespace.clone(),
        "--values".into(),
        "-".into(),
        "--timeout".into(),
        req.timeout_secs.to_string(),
    ];
    if req.hooks.disable_hooks { args.push("--no-hooks".into()); }
    if req.hooks.disable_crd_hook { args.push("--no-crd-hook".into()); }
    if req.wait { args.push("--wait".into()); }
    push_version(&mut args, req);
    args
}

fn upgrade_args(req: &ReleaseRequest, opts: UpgradeOptions) -> Vec<String> {
    let mut args = vec![
        "upgrade".into(),
        req.name.clone(),
        req.chart.path.display().to_string(),
        "--values".into(),
        "-".into(),
        "--timeout".into(),
        req.timeout_secs.to_string(),
    ];
    if req.hooks.disable_hooks { args.push("--no-hooks".into()); }
    if opts.force { args.push("--force".into()); }
    if opts.dry_run {
        // --debug makes a dry run print the rendered release
        args.push("--dry-run".into());
        args.push("--debug".into());
    } else if req.wait {
        args.push("--wait".into());
    }
    push_version(&mut args, req);
    args
}

fn delete_args(req: &DeleteRequest) -> Vec<String> {
    let mut args = vec!["delete".into(), req.name.clone(), "--timeout".into(), req.timeout_secs.to_string()];
    if req.purge { args.push("--purge".into()); }
    if req.hooks.disable_hooks { args.push("--no-hooks".into()); }
    args
}

fn push_version(args: &mut Vec<String>, req: &ReleaseRequest) {
    if let Some(v) = &req.chart.requested_version {
        args.push("--version".into());
        args.push(v.clone());
    }
}

fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ListOutput {
    releases: Vec<ListedRelease>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ListedRelease {
    name: String,
    status: String,
    namespace: String,
}

/// `helm list` prints nothing at all when the filter matches no release.
fn find_listed(out: &str, name: &str) -> Result<Option<ListedRelease>, BackendError> {
    if out.trim().is_empty() {
        return Ok(None);
    }
    let parsed: ListOutput =
        serde_json::from_str(out).map_err(|e| BackendError::Decode { op: Operation::Read, detail: e.to_string() })?;
    Ok(parsed.releases.into_iter().find(|r| r.name == name))
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    description: String,
}

fn parse_history_description(out: &str) -> Result<String, BackendError> {
    let entries: Vec<HistoryEntry> =
        serde_json::from_str(out).map_err(|e| BackendError::Decode { op: Operation::History, detail: e.to_string() })?;
    entries
        .into_iter()
        .last()
        .map(|e| e.description)
        .ok_or_else(|| BackendError::Decode { op: Operation::History, detail: "empty history".into() })
}

/// Split `---`-separated YAML into documents, dropping empty ones.
fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut cur = String::new();
    for line in text.lines() {
        if line.trim_end() == "---" {
            push_doc(&mut docs, &mut cur);
            continue;
        }
        cur.push_str(line);
        cur.push('\n');
    }
    push_doc(&mut docs, &mut cur);
    docs
}

fn push_doc(docs: &mut Vec<String>, cur: &mut String) {
    let doc = std::mem::take(cur);
    let has_content = doc.lines().any(|l| {
        let t = l.trim();
        !t.is_empty() && !t.starts_with('#')
    });
    if has_content {
        docs.push(doc);
    }
}

fn join_lines(lines: &[&str]) -> String {
    lines.iter().flat_map(|l| [*l, "\n"]).collect()
}

/// Parse the release printed by `helm upgrade --dry-run --debug`: header fields, the values
/// sections, then `HOOKS:` and `MANIFEST:`. Values may hold keys that look like section
/// markers, so the last markers win and header fields stop at the first values section.
fn parse_release_dump(out: &str) -> Result<RenderedRelease, BackendError> {
    let lines: Vec<&str> = out.lines().collect();
    let manifest_at = lines.iter().rposition(|l| *l == "MANIFEST:").ok_or_else(|| BackendError::Decode {
        op: Operation::Trial,
        detail: "no MANIFEST section in dry-run output".into(),
    })?;
    let hooks_at = lines[..manifest_at].iter().rposition(|l| *l == "HOOKS:");
    let first_section = hooks_at.unwrap_or(manifest_at);
    let header_end = lines[..first_section]
        .iter()
        .position(|l| *l == "USER-SUPPLIED VALUES:" || *l == "COMPUTED VALUES:")
        .unwrap_or(first_section);
    let namespace = lines[..header_end]
        .iter()
        .find_map(|l| l.strip_prefix("NAMESPACE:"))
        .map(|ns| ns.trim().to_string())
        .unwrap_or_default();
    let hooks = hooks_at.map(|h| join_lines(&lines[h + 1..manifest_at])).unwrap_or_default();
    // trailer printed after the dump
    let body = &lines[manifest_at + 1..];
    let end = body.iter().position(|l| l.starts_with("Release \"")).unwrap_or(body.len());
    Ok(RenderedRelease { namespace, manifest: join_lines(&body[..end]), hooks: split_documents(&hooks) })
}
