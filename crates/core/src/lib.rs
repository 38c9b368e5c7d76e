//! tillerman core types: release inputs, observed release state and outcomes.

#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_BACKEND_NAMESPACE: &str = "kube-system";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 300;

pub type Values = serde_json::Map<String, serde_json::Value>;

/// Caller-supplied fields exactly as they arrive. Every field may be absent or zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawInput {
    pub kubeconfig: String,
    pub kube_context: String,
    pub chart: String,
    pub chart_version: String,
    pub values: Option<Values>,
    pub no_hooks: bool,
    pub no_crd_hook: bool,
    pub timeout: u64,
    pub release: String,
    pub namespace: String,
    pub state: String,
    pub tiller_namespace: String,
    pub tiller_host: String,
    pub tiller_connection_timeout: u64,
    pub wait: bool,
}

impl RawInput {
    /// Fill every default in one place. Cannot fail; applying it twice is a no-op.
    pub fn normalize(mut self) -> Self {
        if self.state.is_empty() {
            self.state = LifecycleGoal::Present.as_str().to_string();
        }
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if self.timeout == 0 {
            self.timeout = DEFAULT_TIMEOUT_SECS;
        }
        if self.values.is_none() {
            self.values = Some(Values::new());
        }
        if self.tiller_namespace.is_empty() {
            self.tiller_namespace = DEFAULT_BACKEND_NAMESPACE.to_string();
        }
        if self.tiller_connection_timeout == 0 {
            self.tiller_connection_timeout = DEFAULT_CONNECT_TIMEOUT_SECS;
        }
        self
    }

    /// Split normalized input into the release spec and the connection settings.
    pub fn into_parts(self) -> (ReleaseSpec, ConnectionSettings) {
        let raw = self.normalize();
        let spec = ReleaseSpec {
            chart: PackageSource { path: raw.chart, version: non_empty(raw.chart_version) },
            values: raw.values.unwrap_or_default(),
            release: raw.release,
            namespace: raw.namespace,
            state: raw.state,
            hooks: HookPolicy { disable_hooks: raw.no_hooks, disable_crd_hook: raw.no_crd_hook },
            timeout_secs: raw.timeout,
            wait: raw.wait,
        };
        let conn = ConnectionSettings {
            kubeconfig: non_empty(raw.kubeconfig).map(PathBuf::from),
            kube_context: non_empty(raw.kube_context),
            backend_namespace: raw.tiller_namespace,
            backend_host: non_empty(raw.tiller_host),
            connect_timeout_secs: raw.tiller_connection_timeout,
        };
        (spec, conn)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Where the chart comes from: a chart directory or a packaged archive, plus an optional version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSource {
    pub path: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookPolicy {
    pub disable_hooks: bool,
    pub disable_crd_hook: bool,
}

/// Desired state of one release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSpec {
    pub chart: PackageSource,
    pub values: Values,
    pub release: String,
    pub namespace: String,
    /// Raw lifecycle goal; see [`ReleaseSpec::goal`].
    pub state: String,
    pub hooks: HookPolicy,
    pub timeout_secs: u64,
    pub wait: bool,
}

impl ReleaseSpec {
    pub fn goal(&self) -> Result<LifecycleGoal, ConfigError> {
        self.state.parse()
    }

    /// Checks that need no backend: a non-empty release name and a known goal.
    pub fn validate(&self) -> Result<LifecycleGoal, ConfigError> {
        if self.release.trim().is_empty() {
            return Err(ConfigError::EmptyRelease);
        }
        self.goal()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// How to reach the release-management backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub kubeconfig: Option<PathBuf>,
    pub kube_context: Option<String>,
    pub backend_namespace: String,
    /// Preset `host:port`; when set no tunnel is opened.
    pub backend_host: Option<String>,
    pub connect_timeout_secs: u64,
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// A reachable backend address and the budget for connecting to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub connect_timeout: Duration,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleGoal {
    Present,
    Absent,
    Purged,
}

impl LifecycleGoal {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleGoal::Present => "present",
            LifecycleGoal::Absent => "absent",
            LifecycleGoal::Purged => "purged",
        }
    }
}

impl FromStr for LifecycleGoal {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(LifecycleGoal::Present),
            "absent" => Ok(LifecycleGoal::Absent),
            "purged" => Ok(LifecycleGoal::Purged),
            other => Err(ConfigError::UnknownState { state: other.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("state must be one of 'present', 'absent', or 'purged' (got '{state}')")]
    UnknownState { state: String },
    #[error("release must not be empty")]
    EmptyRelease,
}

/// Lifecycle status as reported by the backend's release history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseStatus {
    Unknown,
    Deployed,
    Deleted,
    Superseded,
    Failed,
    Deleting,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    /// Lenient parse: `DEPLOYED`, `deployed` and `pending-install` style spellings all map.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DEPLOYED" => ReleaseStatus::Deployed,
            "DELETED" | "UNINSTALLED" => ReleaseStatus::Deleted,
            "SUPERSEDED" => ReleaseStatus::Superseded,
            "FAILED" => ReleaseStatus::Failed,
            "DELETING" | "UNINSTALLING" => ReleaseStatus::Deleting,
            "PENDING_INSTALL" => ReleaseStatus::PendingInstall,
            "PENDING_UPGRADE" => ReleaseStatus::PendingUpgrade,
            "PENDING_ROLLBACK" => ReleaseStatus::PendingRollback,
            _ => ReleaseStatus::Unknown,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, ReleaseStatus::Deleted)
    }
}

/// Rendered resources of a release: the stored one, or what a trial upgrade would produce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedRelease {
    pub namespace: String,
    pub manifest: String,
    /// One YAML document per hook.
    pub hooks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub name: String,
    pub status: ReleaseStatus,
    pub rendered: RenderedRelease,
}

/// Result of reading a release. Absence is a normal branch, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseLookup {
    NotFound,
    Found(ReleaseRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Install,
    ForceUpgrade,
    Upgrade,
    Noop,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::ForceUpgrade => "force-upgrade",
            Action::Upgrade => "upgrade",
            Action::Noop => "noop",
            Action::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub action: Action,
    pub message: String,
    pub changed: bool,
}

impl ReconcileOutcome {
    pub fn noop() -> Self {
        Self { action: Action::Noop, message: String::new(), changed: false }
    }

    pub fn changed(action: Action, message: impl Into<String>) -> Self {
        Self { action, message: message.into(), changed: true }
    }
}
