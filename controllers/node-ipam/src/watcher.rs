//! Kubernetes resource watchers.
//!
//! Each resource kind is driven by a `kube_runtime::Controller` built on a
//! watch stream of our own: the stream fills the reflector cache and then
//! shows every event to an observer before handing applied objects to the
//! controller. The controller only reconciles objects it finds in the
//! cache, so deletions are handled by the observer.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use futures::{Stream, StreamExt, TryFuture, TryStreamExt};
use kube::Resource;
use kube_runtime::controller::{self, Action};
use kube_runtime::reflector::store::Writer;
use kube_runtime::watcher::{self, Event};
use kube_runtime::{Controller, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds the trigger stream of one resource kind.
///
/// Events are applied to `writer` first, then passed to `observe`, so the
/// observer always sees the cache as of the event.
pub fn trigger_stream<K, S, F>(
    events: S,
    writer: Writer<K>,
    observe: F,
) -> impl Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync + 'static,
    S: Stream<Item = Result<Event<K>, watcher::Error>> + Send + 'static,
    F: Fn(&Event<K>) + Send + 'static,
{
    events
        .reflect(writer)
        .inspect_ok(move |event| observe(event))
        .applied_objects()
}

/// Watch events of every object of a kind, retried with backoff
pub fn watch_events<K>(api: kube::Api<K>) -> impl Stream<Item = Result<Event<K>, watcher::Error>> + Send + 'static
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher::watcher(api, watcher::Config::default()).default_backoff()
}

/// Runs a controller until its graceful shutdown completes.
///
/// Reconciler failures are reported by the error policy; everything else
/// the controller yields is logged here.
pub async fn run_controller<K, ReconcileFut>(
    controller: Controller<K>,
    reconcile: impl FnMut(Arc<K>, Arc<Reconciler>) -> ReconcileFut,
    error_policy: impl Fn(Arc<K>, &ControllerError, Arc<Reconciler>) -> Action,
    ctx: Arc<Reconciler>,
    resource_name: &'static str,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Debug + Unpin,
    ReconcileFut: TryFuture<Ok = Action, Error = ControllerError> + Send + 'static,
{
    info!("Starting {} controller", resource_name);

    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!("Reconciled {} {}", resource_name, obj.name),
                Err(controller::Error::ReconcilerFailed(_, obj)) => {
                    debug!("Reconciliation of {} {} failed", resource_name, obj.name);
                }
                Err(controller::Error::ObjectNotFound(obj)) => {
                    debug!("{} {} left the cache before it was reconciled", resource_name, obj.name);
                }
                Err(e) => warn!("{} controller error: {}", resource_name, e),
            }
        })
        .await;

    info!("{} controller stopped", resource_name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestReconciler, create_test_cluster_cidr, create_test_node, test_reconciler};
    use crds::ClusterCIDR;
    use futures::stream;
    use k8s_openapi::api::core::v1::Node;
    use kube_runtime::reflector::ObjectRef;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_trigger_stream_caches_before_observing() {
        let writer: Writer<Node> = Writer::default();
        let store = writer.as_reader();
        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen = Arc::clone(&observed);
        let reader = store.clone();
        let events = stream::iter(vec![
            Ok::<_, watcher::Error>(Event::Init),
            Ok(Event::InitApply(create_test_node("node1", "uid-1", &[], &[]))),
            Ok(Event::InitDone),
            Ok(Event::Delete(create_test_node("node1", "uid-1", &[], &[]))),
        ]);
        let applied: Vec<String> = trigger_stream(events, writer, move |event| {
            let cached = reader.get(&ObjectRef::new("node1")).is_some();
            let kind = match event {
                Event::Init => "init",
                Event::InitApply(_) => "init-apply",
                Event::InitDone => "init-done",
                Event::Apply(_) => "apply",
                Event::Delete(_) => "delete",
            };
            seen.lock().unwrap().push((kind, cached));
        })
        .map_ok(|node: Node| node.metadata.name.unwrap_or_default())
        .try_collect()
        .await
        .unwrap();

        assert_eq!(applied, vec!["node1".to_string()]);
        assert_eq!(
            *observed.lock().unwrap(),
            vec![("init", false), ("init-apply", false), ("init-done", true), ("delete", false)]
        );
        assert!(store.get(&ObjectRef::new("node1")).is_none());
    }

    #[tokio::test]
    async fn test_controller_assigns_waiting_node_once_pool_appears() {
        let node_writer: Writer<Node> = Writer::default();
        let pool_writer: Writer<ClusterCIDR> = Writer::default();
        let nodes = node_writer.as_reader();
        let pools = pool_writer.as_reader();
        let TestReconciler {
            reconciler,
            node_client,
            pool_client,
            requests,
            ..
        } = test_reconciler(nodes.clone(), pools.clone());
        let shutdown = CancellationToken::new();

        // The node is listed before any pool exists
        let node_events = stream::iter(vec![
            Ok(Event::Init),
            Ok(Event::InitApply(create_test_node("node1", "uid-1", &[("ipv4", "true")], &[]))),
            Ok(Event::InitDone),
        ])
        .chain(stream::pending::<Result<Event<Node>, watcher::Error>>());
        let (pool_tx, pool_rx) = futures::channel::mpsc::unbounded::<Result<Event<ClusterCIDR>, watcher::Error>>();
        let pool_events = stream::iter(vec![Ok(Event::Init), Ok(Event::InitDone)]).chain(pool_rx);

        let ctx = Arc::clone(&reconciler);
        let node_controller = Controller::for_stream(
            trigger_stream(node_events, node_writer, move |event| ctx.observe_node(event)),
            nodes.clone(),
        )
        .reconcile_on(requests.nodes)
        .graceful_shutdown_on(shutdown.clone().cancelled_owned());
        let ctx = Arc::clone(&reconciler);
        let pool_controller = Controller::for_stream(
            trigger_stream(pool_events, pool_writer, move |event| ctx.observe_pool(event)),
            pools.clone(),
        )
        .reconcile_on(requests.pools)
        .graceful_shutdown_on(shutdown.clone().cancelled_owned());

        let node_task = tokio::spawn(run_controller(
            node_controller,
            crate::reconciler::reconcile_node,
            crate::reconciler::node_error_policy,
            Arc::clone(&reconciler),
            "Node",
        ));
        let pool_task = tokio::spawn(run_controller(
            pool_controller,
            crate::reconciler::reconcile_pool,
            crate::reconciler::pool_error_policy,
            Arc::clone(&reconciler),
            "ClusterCIDR",
        ));

        nodes.wait_until_ready().await.unwrap();
        pools.wait_until_ready().await.unwrap();
        reconciler.startup();

        // Only a pool added later can serve the node
        pool_tx
            .unbounded_send(Ok(Event::Apply(create_test_cluster_cidr(
                "ipv4-cc",
                "10.0.0.0/16",
                "",
                8,
                &[("ipv4", "true")],
            ))))
            .unwrap();

        for _ in 0..200 {
            if node_client.patched("node1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node_client.patched("node1").unwrap(), vec!["10.0.0.0/24".to_string()]);
        assert!(pool_client.has_finalizer("ipv4-cc"));

        shutdown.cancel();
        node_task.await.unwrap();
        pool_task.await.unwrap();
    }
}
