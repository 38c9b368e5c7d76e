//! tillerman reconcile: compare a desired release against the backend and apply at most one change.

#![forbid(unsafe_code)]

use std::time::Instant;

use metrics::{counter, histogram};
use thiserror::Error;
use tillerman_backend::{
    BackendError, ChartError, ChartLoader, DeleteRequest, ReleaseBackend, ReleaseRequest, UpgradeOptions,
};
use tillerman_core::{
    Action, ConfigError, ConnectionSettings, Endpoint, LifecycleGoal, ReconcileOutcome, ReleaseLookup, ReleaseRecord,
    ReleaseSpec,
};
use tillerman_kubehub::{ConnectError, ConnectionProvisioner};
use tillerman_manifest::{DiffError, ManifestDiffer};
use tracing::{debug, info, info_span, Instrument};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Connectivity(#[from] ConnectError),
    #[error(transparent)]
    Chart(#[from] ChartError),
    #[error("serializing values: {0}")]
    Values(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Diff(#[from] DiffError),
}

impl ReconcileError {
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Configuration(_) => "configuration",
            ReconcileError::Connectivity(_) => "connectivity",
            ReconcileError::Chart(_) => "chart",
            ReconcileError::Values(_) => "values",
            ReconcileError::Backend(_) => "backend",
            ReconcileError::Diff(_) => "diff",
        }
    }
}

/// Drives one release toward its lifecycle goal. Holds no state between calls.
pub struct Reconciler<'a, B, L, D> {
    backend: &'a B,
    charts: &'a L,
    differ: &'a D,
}

impl<'a, B, L, D> Reconciler<'a, B, L, D>
where
    B: ReleaseBackend,
    L: ChartLoader,
    D: ManifestDiffer,
{
    pub fn new(backend: &'a B, charts: &'a L, differ: &'a D) -> Self {
        Self { backend, charts, differ }
    }

    /// Validate the spec, provision a connection and reconcile over it. The connection is torn down on return.
    pub async fn run(
        &self,
        provisioner: &dyn ConnectionProvisioner,
        settings: &ConnectionSettings,
        spec: &ReleaseSpec,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        spec.validate()?;
        let handle = provisioner.provision(settings).await?;
        self.reconcile(handle.endpoint(), spec).await
    }

    pub async fn reconcile(&self, endpoint: &Endpoint, spec: &ReleaseSpec) -> Result<ReconcileOutcome, ReconcileError> {
        let goal = spec.validate()?;
        counter!("reconcile_attempts", 1u64, "goal" => goal.as_str());
        let span = info_span!("reconcile", release = %spec.release, goal = goal.as_str(), host = %endpoint);
        let t0 = Instant::now();
        let res = async {
            match goal {
                LifecycleGoal::Present => self.ensure_present(endpoint, spec).await,
                LifecycleGoal::Absent | LifecycleGoal::Purged => self.ensure_removed(endpoint, spec, goal).await,
            }
        }
        .instrument(span)
        .await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "goal" => goal.as_str());
        match &res {
            Ok(o) if o.changed => {
                counter!("reconcile_changed", 1u64, "action" => o.action.as_str());
            }
            Ok(_) => {
                counter!("reconcile_noop", 1u64);
            }
            Err(e) => {
                counter!("reconcile_err", 1u64, "kind" => e.kind());
            }
        }
        res
    }

    async fn ensure_present(&self, endpoint: &Endpoint, spec: &ReleaseSpec) -> Result<ReconcileOutcome, ReconcileError> {
        let chart = self.charts.load(&spec.chart)?;
        let req = ReleaseRequest::new(spec, chart)?;
        let current = match self.backend.read(endpoint, &spec.release).await? {
            ReleaseLookup::NotFound => {
                info!("release not found, installing");
                let desc = self.backend.install(endpoint, &req).await?;
                return Ok(ReconcileOutcome::changed(Action::Install, desc));
            }
            ReleaseLookup::Found(rec) => rec,
        };
        if current.status.is_deleted() {
            info!("release deleted but not purged, force upgrading");
            let resp = self.backend.upgrade(endpoint, &req, UpgradeOptions::forced()).await?;
            return Ok(ReconcileOutcome::changed(Action::ForceUpgrade, resp.description));
        }
        if !self.would_change(endpoint, &req, &current, spec.hooks.disable_hooks).await? {
            debug!("release up to date");
            return Ok(ReconcileOutcome::noop());
        }
        info!("release differs, upgrading");
        let resp = self.backend.upgrade(endpoint, &req, UpgradeOptions::default()).await?;
        Ok(ReconcileOutcome::changed(Action::Upgrade, resp.description))
    }

    async fn would_change(
        &self,
        endpoint: &Endpoint,
        req: &ReleaseRequest,
        current: &ReleaseRecord,
        hooks_disabled: bool,
    ) -> Result<bool, ReconcileError> {
        let mut proposed = self.backend.try_upgrade(endpoint, req).await?;
        if proposed.namespace.is_empty() {
            proposed.namespace = current.rendered.namespace.clone();
        }
        let before = tillerman_manifest::select(&current.rendered, hooks_disabled)?;
        let after = tillerman_manifest::select(&proposed, hooks_disabled)?;
        Ok(self.differ.has_changes(&before, &after))
    }

    async fn ensure_removed(
        &self,
        endpoint: &Endpoint,
        spec: &ReleaseSpec,
        goal: LifecycleGoal,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let purge = goal == LifecycleGoal::Purged;
        match self.backend.read(endpoint, &spec.release).await? {
            ReleaseLookup::NotFound => {
                debug!("release not found, nothing to delete");
                return Ok(ReconcileOutcome::noop());
            }
            ReleaseLookup::Found(rec) if rec.status.is_deleted() && !purge => {
                debug!("release already deleted");
                return Ok(ReconcileOutcome::noop());
            }
            ReleaseLookup::Found(_) => {}
        }
        let req = DeleteRequest { name: spec.release.clone(), purge, hooks: spec.hooks, timeout_secs: spec.timeout_secs };
        self.backend.delete(endpoint, &req).await?;
        info!(purge, "release deleted");
        Ok(ReconcileOutcome::changed(Action::Delete, format!("release {} deleted", spec.release)))
    }
}
