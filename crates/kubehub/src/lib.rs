//! tillerman kubehub: kube client wiring and the local tunnel to the release-management backend.

#![forbid(unsafe_code)]

use std::net::{Ipv4Addr, SocketAddr};

use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use thiserror::Error;
use tillerman_core::{ConnectionSettings, Endpoint};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

pub const TILLER_PORT: u16 = 44134;
pub const TILLER_SELECTOR: &str = "app=helm,name=tiller";

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not get Kubernetes config for context {context:?}: {detail}")]
    Config { context: Option<String>, detail: String },
    #[error("could not get Kubernetes client: {0}")]
    Client(#[source] kube::Error),
    #[error("listing pods in {namespace}: {source}")]
    List { namespace: String, #[source] source: kube::Error },
    #[error("no running tiller pod in namespace {namespace}")]
    NoBackend { namespace: String },
    #[error("binding local tunnel port: {0}")]
    Bind(#[source] std::io::Error),
    #[error("port-forward to {pod}: {source}")]
    PortForward { pod: String, #[source] source: kube::Error },
    #[error("tunnel i/o: {0}")]
    TunnelIo(#[source] std::io::Error),
}

/// A provisioned endpoint. Dropping the handle tears the tunnel down.
#[derive(Debug)]
pub struct ConnectionHandle {
    endpoint: Endpoint,
    tunnel: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn direct(endpoint: Endpoint) -> Self {
        Self { endpoint, tunnel: None }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(t) = self.tunnel.take() {
            debug!(host = %self.endpoint, "closing tunnel");
            t.abort();
        }
    }
}

#[async_trait::async_trait]
pub trait ConnectionProvisioner: Send + Sync {
    async fn provision(&self, settings: &ConnectionSettings) -> Result<ConnectionHandle, ConnectError>;
}

/// Uses a preset `host:port` as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticEndpoint;

#[async_trait::async_trait]
impl ConnectionProvisioner for StaticEndpoint {
    async fn provision(&self, settings: &ConnectionSettings) -> Result<ConnectionHandle, ConnectError> {
        let host = settings.backend_host.clone().ok_or_else(|| ConnectError::Config {
            context: settings.kube_context.clone(),
            detail: "no backend host given".into(),
        })?;
        Ok(ConnectionHandle::direct(Endpoint { host, connect_timeout: settings.connect_timeout() }))
    }
}

/// Port-forwards a local ephemeral port to the Tiller pod in the backend namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct TillerTunnel;

#[async_trait::async_trait]
impl ConnectionProvisioner for TillerTunnel {
    async fn provision(&self, settings: &ConnectionSettings) -> Result<ConnectionHandle, ConnectError> {
        let client = client_for(settings).await?;
        let ns = settings.backend_namespace.as_str();
        let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
        let lp = ListParams::default().labels(TILLER_SELECTOR);
        let list = pods
            .list(&lp)
            .await
            .map_err(|source| ConnectError::List { namespace: ns.to_string(), source })?;
        let pod = pick_running_pod(&list.items).ok_or_else(|| ConnectError::NoBackend { namespace: ns.to_string() })?;
        let (local, task) = open_tunnel(pods, pod.clone(), TILLER_PORT).await?;
        info!(pod = %pod, ns = %ns, local = %local, "tunnel to release backend ready");
        Ok(ConnectionHandle {
            endpoint: Endpoint { host: local.to_string(), connect_timeout: settings.connect_timeout() },
            tunnel: Some(task),
        })
    }
}

/// Static endpoint when one is preset, otherwise a tunnel.
pub fn provisioner_for(settings: &ConnectionSettings) -> Box<dyn ConnectionProvisioner> {
    if settings.backend_host.is_some() {
        Box::new(StaticEndpoint)
    } else {
        Box::new(TillerTunnel)
    }
}

/// Build a kube client from an explicit kubeconfig and/or context, falling back to inference.
pub async fn client_for(settings: &ConnectionSettings) -> Result<Client, ConnectError> {
    let context = settings.kube_context.clone();
    let cfg_err = |detail: String| ConnectError::Config { context: context.clone(), detail };
    let options = KubeConfigOptions { context: settings.kube_context.clone(), ..Default::default() };
    let mut config = match (&settings.kubeconfig, &settings.kube_context) {
        (Some(path), _) => {
            let kc = Kubeconfig::read_from(path).map_err(|e| cfg_err(e.to_string()))?;
            Config::from_custom_kubeconfig(kc, &options).await.map_err(|e| cfg_err(e.to_string()))?
        }
        (None, Some(_)) => Config::from_kubeconfig(&options).await.map_err(|e| cfg_err(e.to_string()))?,
        (None, None) => Config::infer().await.map_err(|e| cfg_err(e.to_string()))?,
    };
    config.connect_timeout = Some(settings.connect_timeout());
    Client::try_from(config).map_err(ConnectError::Client)
}

fn pick_running_pod(pods: &[Pod]) -> Option<String> {
    pods.iter()
        .filter(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
        .find_map(|p| p.metadata.name.clone())
}

/// Ephemeral port on the loopback interface only.
async fn bind_local() -> Result<(TcpListener, SocketAddr), ConnectError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.map_err(ConnectError::Bind)?;
    let local = listener.local_addr().map_err(ConnectError::Bind)?;
    Ok((listener, local))
}

async fn open_tunnel(api: Api<Pod>, pod: String, remote: u16) -> Result<(SocketAddr, JoinHandle<()>), ConnectError> {
    let (listener, local) = bind_local().await?;
    let task = tokio::spawn(async move {
        // each client connection gets its own port-forward; dropping the set aborts them
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((inbound, peer)) => {
                        debug!(peer = %peer, "tunnel connection");
                        let api = api.clone();
                        let pod = pod.clone();
                        conns.spawn(async move {
                            if let Err(e) = forward(api, &pod, remote, inbound).await {
                                warn!(error = %e, "tunnel connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "tunnel accept failed");
                        break;
                    }
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }
    });
    Ok((local, task))
}

async fn forward(api: Api<Pod>, pod: &str, port: u16, mut inbound: TcpStream) -> Result<(), ConnectError> {
    let mut pf = api
        .portforward(pod, &[port])
        .await
        .map_err(|source| ConnectError::PortForward { pod: pod.to_string(), source })?;
    let mut upstream = pf.take_stream(port).ok_or_else(|| {
        ConnectError::TunnelIo(std::io::Error::new(std::io::ErrorKind::NotConnected, "port-forward stream missing"))
    })?;
    tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await.map_err(ConnectError::TunnelIo)?;
    drop(upstream);
    if let Err(e) = pf.join().await {
        debug!(error = %e, "port-forward closed with error");
    }
    Ok(())
}
