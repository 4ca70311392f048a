//! Reflectors feeding the local caches and the work queue
//!
//! Nodes, VirtualMachines and launcher pods are watched. Every applied or
//! deleted object is mapped to a node key (see [`crate::keys`]) and enqueued;
//! the initial list enqueues every node once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use virtwatch_common::crd::VirtualMachine;
use virtwatch_common::{Error, LAUNCHER_LABEL_SELECTOR};

use crate::keys::{node_key, pod_key, vm_key};
use crate::queue::WorkQueue;

/// Watcher timeout (seconds), below the client read timeout so idle watches
/// are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed watch task, spawned by the caller
pub type WatchTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Caches filled by the watches plus the tasks driving them
pub struct Watches {
    /// Node mirror
    pub nodes: Store<Node>,
    /// VirtualMachine mirror
    pub vms: Store<VirtualMachine>,
    /// One task per watched kind
    pub tasks: Vec<WatchTask>,
}

impl Watches {
    /// Wait until the Node and VirtualMachine caches completed their initial list
    pub async fn wait_for_sync(&self) -> Result<(), Error> {
        wait_for_sync(&self.nodes, &self.vms).await
    }
}

/// Build the Node, VirtualMachine and launcher Pod watches.
///
/// VM and pod watches are restricted to `namespace` when set. Tasks stop when
/// `shutdown` is cancelled.
pub fn build_watches(
    client: Client,
    namespace: Option<&str>,
    queue: Arc<dyn WorkQueue>,
    shutdown: CancellationToken,
) -> Watches {
    let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);

    let (nodes, node_writer) = reflector::store::<Node>();
    let node_events = reflector::reflector(
        node_writer,
        watcher(Api::<Node>::all(client.clone()), config.clone()),
    )
    .default_backoff();

    let (vms, vm_writer) = reflector::store::<VirtualMachine>();
    let vm_events = reflector::reflector(
        vm_writer,
        watcher(scoped::<VirtualMachine>(&client, namespace), config.clone()),
    )
    .default_backoff();

    let pod_events = watcher(
        scoped::<Pod>(&client, namespace),
        config.labels(LAUNCHER_LABEL_SELECTOR),
    )
    .default_backoff();

    let vm_cache = vms.clone();
    let tasks: Vec<WatchTask> = vec![
        Box::pin(drive(
            "Node",
            node_events,
            queue.clone(),
            node_key,
            shutdown.clone(),
        )),
        Box::pin(drive(
            "VirtualMachine",
            vm_events,
            queue.clone(),
            vm_key,
            shutdown.clone(),
        )),
        Box::pin(drive(
            "Pod",
            pod_events,
            queue,
            move |pod: &Pod| pod_key(pod, &vm_cache),
            shutdown,
        )),
    ];

    Watches { nodes, vms, tasks }
}

/// Wait until both caches completed their initial list
pub async fn wait_for_sync(nodes: &Store<Node>, vms: &Store<VirtualMachine>) -> Result<(), Error> {
    nodes
        .wait_until_ready()
        .await
        .map_err(|e| Error::internal_with_context(e.to_string(), "node watcher"))?;
    vms.wait_until_ready()
        .await
        .map_err(|e| Error::internal_with_context(e.to_string(), "vm watcher"))?;
    info!(
        nodes = nodes.state().len(),
        vms = vms.state().len(),
        "caches synced"
    );
    Ok(())
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Object carried by a watch event, if any
fn touched<K>(event: &watcher::Event<K>) -> Option<&K> {
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) | watcher::Event::Delete(obj) => {
            Some(obj)
        }
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

async fn drive<K, S, F>(
    kind: &'static str,
    events: S,
    queue: Arc<dyn WorkQueue>,
    key_of: F,
    shutdown: CancellationToken,
) where
    K: Send,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    F: Fn(&K) -> Option<String> + Send,
{
    let mut events = std::pin::pin!(events);
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                if let Some(key) = touched(&event).and_then(&key_of) {
                    debug!(kind, node = %key, "enqueueing node");
                    queue.enqueue(key);
                }
            }
            Some(Err(e)) => warn!(kind, error = %e, "watch error, backing off"),
            None => break,
        }
    }
    debug!(kind, "watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RateLimitedQueue;
    use crate::testing::{healthy_node, pod_for_vm, running_vm, store_with};

    fn events<K>(items: Vec<watcher::Event<K>>) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>> {
        futures::stream::iter(items.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn initial_list_enqueues_every_node() {
        let queue = Arc::new(RateLimitedQueue::default());
        let stream = events(vec![
            watcher::Event::Init,
            watcher::Event::InitApply(healthy_node("node01")),
            watcher::Event::InitApply(healthy_node("node02")),
            watcher::Event::InitDone,
        ]);

        drive("Node", stream, queue.clone(), node_key, CancellationToken::new()).await;

        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn node_deletion_enqueues_its_name() {
        let queue = Arc::new(RateLimitedQueue::default());
        let stream = events(vec![watcher::Event::Delete(healthy_node("node01"))]);

        drive("Node", stream, queue.clone(), node_key, CancellationToken::new()).await;

        assert_eq!(queue.dequeue().await.as_deref(), Some("node01"));
    }

    #[tokio::test]
    async fn repeated_updates_coalesce() {
        let queue = Arc::new(RateLimitedQueue::default());
        let node = healthy_node("node01");
        let vm = running_vm("vm1", &node);
        let stream = events(vec![
            watcher::Event::Apply(vm.clone()),
            watcher::Event::Apply(vm.clone()),
            watcher::Event::Apply(vm),
        ]);

        drive("VirtualMachine", stream, queue.clone(), vm_key, CancellationToken::new()).await;

        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn pod_events_map_to_owning_vm_node() {
        let queue = Arc::new(RateLimitedQueue::default());
        let node = healthy_node("node01");
        let vm = running_vm("vm1", &node);
        let pod = pod_for_vm("launcher", &vm);
        let (vms, _writer) = store_with(vec![vm]);
        let stream = events(vec![watcher::Event::Delete(pod)]);

        drive(
            "Pod",
            stream,
            queue.clone(),
            move |pod: &Pod| pod_key(pod, &vms),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(queue.dequeue().await.as_deref(), Some("node01"));
    }

    #[tokio::test]
    async fn cancelled_watch_stops() {
        let queue = Arc::new(RateLimitedQueue::default());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        drive(
            "Node",
            futures::stream::pending::<Result<watcher::Event<Node>, watcher::Error>>(),
            queue.clone(),
            node_key,
            shutdown,
        )
        .await;

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn wait_for_sync_returns_once_stores_are_ready() {
        let (nodes, _node_writer) = store_with(vec![healthy_node("node01")]);
        let (vms, _vm_writer) = store_with::<VirtualMachine>(vec![]);

        wait_for_sync(&nodes, &vms)
            .await
            .expect("stores are ready after InitDone");
    }
}
