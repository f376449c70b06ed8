//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the Node and
//! ClusterCIDR controllers to their shared reflector caches and the probe
//! server, and runs them until shutdown.

use crate::backoff::{ExponentialBackoff, RetryTracker};
use crate::client::{KubeNodeClient, KubePoolClient, NodeClient, PoolClient};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::{self, Reconciler, triggers};
use crate::server::{self, ServerState};
use crate::watcher::{run_controller, trigger_stream, watch_events};
use crds::ClusterCIDR;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use kube_runtime::controller::Config as RuntimeConfig;
use kube_runtime::reflector::{self, Store};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Main controller for Node IPAM.
pub struct Controller {
    config: ControllerConfig,
    reconciler: Arc<Reconciler>,
    nodes: Store<Node>,
    pools: Store<ClusterCIDR>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    node_controller: JoinHandle<()>,
    pool_controller: JoinHandle<()>,
}

impl Controller {
    /// Creates a new controller instance and starts watching.
    ///
    /// Reconciliations wait until `run` has rebuilt the in-memory state.
    ///
    /// # Errors
    ///
    /// Returns an error if no Kubernetes client can be built or the
    /// metrics cannot be registered.
    pub async fn new(config: ControllerConfig, shutdown: CancellationToken) -> Result<Self, ControllerError> {
        info!("Initializing Node IPAM Controller");

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;

        // Create API clients
        let node_api: Api<Node> = Api::all(kube_client.clone());
        let pool_api: Api<ClusterCIDR> = Api::all(kube_client.clone());

        let (nodes, node_writer) = reflector::store();
        let (pools, pool_writer) = reflector::store();
        let metrics = Arc::new(Metrics::new()?);
        let (triggers, requests) = triggers();
        let retries = RetryTracker::new(
            ExponentialBackoff::new(config.backoff_base, config.backoff_max),
            config.max_retries,
        );

        // Create reconciler
        let node_client: Arc<dyn NodeClient> = Arc::new(KubeNodeClient::new(kube_client.clone()));
        let pool_client: Arc<dyn PoolClient> = Arc::new(KubePoolClient::new(kube_client));
        let reconciler = Arc::new(Reconciler::new(
            nodes.clone(),
            pools.clone(),
            node_client,
            pool_client,
            triggers,
            retries,
            Arc::clone(&metrics),
        ));

        let ctx = Arc::clone(&reconciler);
        let nodes_controller = kube_runtime::Controller::for_stream(
            trigger_stream(watch_events(node_api), node_writer, move |event| ctx.observe_node(event)),
            nodes.clone(),
        )
        .with_config(RuntimeConfig::default().concurrency(config.node_workers))
        .reconcile_on(requests.nodes)
        .graceful_shutdown_on(shutdown.clone().cancelled_owned());

        let ctx = Arc::clone(&reconciler);
        let pools_controller = kube_runtime::Controller::for_stream(
            trigger_stream(watch_events(pool_api), pool_writer, move |event| ctx.observe_pool(event)),
            pools.clone(),
        )
        .with_config(RuntimeConfig::default().concurrency(config.pool_workers))
        .reconcile_on(requests.pools)
        .graceful_shutdown_on(shutdown.clone().cancelled_owned());

        // Start controllers in background tasks
        let node_controller = tokio::spawn(run_controller(
            nodes_controller,
            reconciler::reconcile_node,
            reconciler::node_error_policy,
            Arc::clone(&reconciler),
            "Node",
        ));
        let pool_controller = tokio::spawn(run_controller(
            pools_controller,
            reconciler::reconcile_pool,
            reconciler::pool_error_policy,
            Arc::clone(&reconciler),
            "ClusterCIDR",
        ));

        Ok(Self {
            config,
            reconciler,
            nodes,
            pools,
            metrics,
            shutdown,
            node_controller,
            pool_controller,
        })
    }

    /// Runs the controller until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if a controller or the probe server stops on its own.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        let state = ServerState::new(Arc::clone(&self.metrics));
        let listener = TcpListener::bind(self.config.health_probe_addr).await?;
        let mut probe_server = tokio::spawn(server::serve(listener, state.clone(), self.shutdown.clone()));

        // Startup needs both caches to hold a full list
        info!("Waiting for Node and ClusterCIDR caches to sync");
        let synced = tokio::select! {
            () = self.shutdown.cancelled() => None,
            result = wait_for_caches(&self.nodes, &self.pools) => Some(result),
            result = &mut self.node_controller => Some(Err(controller_exit("Node", result))),
            result = &mut self.pool_controller => Some(Err(controller_exit("ClusterCIDR", result))),
        };
        match synced {
            None => {
                self.stop().await;
                return Ok(());
            }
            Some(Err(e)) => {
                self.stop().await;
                return Err(e);
            }
            Some(Ok(())) => {}
        }

        self.reconciler.startup();
        state.set_ready();
        info!(
            "Node IPAM Controller running with {} node and {} ClusterCIDR worker(s)",
            self.config.node_workers, self.config.pool_workers
        );

        // Wait for shutdown or for any background task to exit
        let result = tokio::select! {
            () = self.shutdown.cancelled() => Ok(()),
            result = &mut self.node_controller => Err(controller_exit("Node", result)),
            result = &mut self.pool_controller => Err(controller_exit("ClusterCIDR", result)),
            result = &mut probe_server => match result {
                Ok(Ok(())) => Err(ControllerError::Watch("probe server exited".to_string())),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ControllerError::Watch(format!("probe server panicked: {}", e))),
            },
        };

        self.stop().await;
        result
    }

    /// Stops both controllers and waits for in-flight reconciliations
    async fn stop(self) {
        info!("Shutting down Node IPAM Controller");
        self.shutdown.cancel();
        for (resource, handle) in [("Node", self.node_controller), ("ClusterCIDR", self.pool_controller)] {
            // A handle that already finished was consumed by `run`
            if handle.is_finished() {
                continue;
            }
            if let Err(e) = handle.await {
                warn!("{} controller exited abnormally: {}", resource, e);
            }
        }
    }
}

async fn wait_for_caches(nodes: &Store<Node>, pools: &Store<ClusterCIDR>) -> Result<(), ControllerError> {
    nodes
        .wait_until_ready()
        .await
        .map_err(|e| ControllerError::Watch(format!("Node cache never synced: {}", e)))?;
    pools
        .wait_until_ready()
        .await
        .map_err(|e| ControllerError::Watch(format!("ClusterCIDR cache never synced: {}", e)))?;
    info!("Caches synced: {} node(s), {} ClusterCIDR(s)", nodes.state().len(), pools.state().len());
    Ok(())
}

fn controller_exit(resource: &str, result: Result<(), tokio::task::JoinError>) -> ControllerError {
    match result {
        Ok(()) => ControllerError::Watch(format!("{} controller stopped unexpectedly", resource)),
        Err(e) => ControllerError::Watch(format!("{} controller panicked: {}", resource, e)),
    }
}
