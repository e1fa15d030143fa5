use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::dataplane::ceph::CephTool;
use crate::dataplane::DataPlane;
use crate::osd::health::OsdHealthMonitor;
use crate::osd::Controller;
use crate::store::{KubeStore, ObjectStore};
use reef_core::crd::{ReefCluster, RequiredMetadata};

/// A result type used for CR events coming from K8s.
type ClusterCREventResult = std::result::Result<Event<ReefCluster>, WatcherError>;

/// The application object for when the operator is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the cluster CR watcher.
    watcher: JoinHandle<Result<()>>,
    /// The join handle of the advisory health monitor.
    health: JoinHandle<()>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone(), &config));
        let dataplane: Arc<dyn DataPlane> = Arc::new(CephTool::new(&config.dataplane_tool, &config.dataplane_conf));

        // Spawn various core tasks.
        let controller = Controller::new(config.clone(), store, dataplane.clone(), shutdown_tx.clone());
        let watcher = ClusterWatcher::new(client, config.clone(), controller, shutdown_tx.subscribe()).spawn();
        let health = OsdHealthMonitor::new(config.clone(), dataplane, shutdown_tx.subscribe()).spawn();

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            watcher,
            health,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Reef operator is shutting down");
        if let Err(err) = self.watcher.await.context("error joining cluster watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down cluster watcher");
        }
        if let Err(err) = self.health.await {
            tracing::error!(error = ?err, "error joining health monitor task");
        }

        tracing::debug!("Reef operator shutdown complete");
        Ok(())
    }
}

/// A K8s event watcher of ReefCluster CRs, driving OSD reconciliation.
struct ClusterWatcher {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The OSD lifecycle controller invoked per cluster event.
    controller: Controller,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl ClusterWatcher {
    /// Create a new instance.
    fn new(client: Client, config: Arc<Config>, controller: Controller, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            client,
            config,
            controller,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let api: Api<ReefCluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let stream = watcher(api, ListParams::default());
        tokio::pin!(stream);

        tracing::info!("cluster CR watcher initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = stream.next() => self.handle_k8s_event(k8s_event_res).await,
                _ = self.shutdown.next() => break,
            }
        }

        Ok(())
    }

    /// Handle watcher events coming from K8s.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_k8s_event(&mut self, res: ClusterCREventResult) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from k8s watch stream");
                let _ = tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(cluster) => self.reconcile(&cluster).await,
            // Deletion cascades through owner references; nothing to do here.
            Event::Deleted(cluster) => tracing::info!(cluster = cluster.name(), "cluster CR deleted"),
            Event::Restarted(clusters) => {
                tracing::debug!("cluster CR watcher restarted");
                for cluster in &clusters {
                    self.reconcile(cluster).await;
                }
            }
        }
    }

    /// Run one reconcile pass, logging its outcome.
    async fn reconcile(&self, cluster: &ReefCluster) {
        match self.controller.reconcile(cluster).await {
            Ok(()) => tracing::info!(cluster = cluster.name(), "OSD reconciliation complete"),
            Err(err) => tracing::error!(error = ?err, cluster = cluster.name(), "error reconciling cluster OSDs"),
        }
    }
}
