//! tillerman backend: release reads, trial upgrades and mutations against the
//! release-management backend. The default implementation drives the `helm` binary.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tillerman_core::{Endpoint, HookPolicy, ReleaseLookup, ReleaseSpec, RenderedRelease};

pub mod chart;
pub mod helm;

pub use chart::{ChartDir, ChartError, ChartLoader, LoadedChart};
pub use helm::HelmCli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Install,
    Upgrade,
    Trial,
    Delete,
    History,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Install => "install",
            Operation::Upgrade => "upgrade",
            Operation::Trial => "trial upgrade",
            Operation::Delete => "delete",
            Operation::History => "history",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to run {program}: {source}")]
    Spawn { program: String, #[source] source: std::io::Error },
    #[error("{op}: i/o error: {source}")]
    Io { op: Operation, #[source] source: std::io::Error },
    /// The backend rejected the operation; `detail` is its own error text.
    #[error("{op} failed: {detail}")]
    Command { op: Operation, detail: String },
    #[error("{op} timed out after {}s", .after.as_secs())]
    Timeout { op: Operation, after: Duration },
    #[error("{op}: unexpected output: {detail}")]
    Decode { op: Operation, detail: String },
}

/// Inputs shared by install, upgrade and trial upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub name: String,
    pub chart: LoadedChart,
    pub namespace: String,
    /// Serialized value overrides (JSON, which the backend reads as YAML).
    pub values: Vec<u8>,
    pub hooks: HookPolicy,
    pub timeout_secs: u64,
    pub wait: bool,
}

impl ReleaseRequest {
    pub fn new(spec: &ReleaseSpec, chart: LoadedChart) -> Result<Self, serde_json::Error> {
        Ok(Self {
            name: spec.release.clone(),
            chart,
            namespace: spec.namespace.clone(),
            values: serde_json::to_vec(&spec.values)?,
            hooks: spec.hooks,
            timeout_secs: spec.timeout_secs,
            wait: spec.wait,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpgradeOptions {
    pub force: bool,
    pub dry_run: bool,
}

impl UpgradeOptions {
    pub fn forced() -> Self {
        Self { force: true, dry_run: false }
    }

    pub fn dry_run() -> Self {
        Self { force: false, dry_run: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeResponse {
    pub description: String,
    /// Present for dry runs: the release the upgrade would produce.
    pub rendered: Option<RenderedRelease>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub name: String,
    pub purge: bool,
    pub hooks: HookPolicy,
    pub timeout_secs: u64,
}

/// Release-management backend. Every call receives the endpoint explicitly; implementations hold no connection state.
#[async_trait::async_trait]
pub trait ReleaseBackend: Send + Sync {
    /// Look up a release by name. A missing release is `ReleaseLookup::NotFound`, not an error.
    async fn read(&self, endpoint: &Endpoint, name: &str) -> Result<ReleaseLookup, BackendError>;

    /// Install a new release; returns the backend's description of the result.
    async fn install(&self, endpoint: &Endpoint, req: &ReleaseRequest) -> Result<String, BackendError>;

    async fn upgrade(&self, endpoint: &Endpoint, req: &ReleaseRequest, opts: UpgradeOptions) -> Result<UpgradeResponse, BackendError>;

    /// Non-committing upgrade: renders what an upgrade with `req` would deploy without touching backend state.
    async fn try_upgrade(&self, endpoint: &Endpoint, req: &ReleaseRequest) -> Result<RenderedRelease, BackendError> {
        self.upgrade(endpoint, req, UpgradeOptions::dry_run())
            .await?
            .rendered
            .ok_or_else(|| BackendError::Decode { op: Operation::Trial, detail: "dry run returned no release".into() })
    }

    async fn delete(&self, endpoint: &Endpoint, req: &DeleteRequest) -> Result<String, BackendError>;
}
