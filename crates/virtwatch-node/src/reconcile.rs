//! One reconciliation cycle for one node
//!
//! A cycle:
//! 1. looks the node up in the local cache (a missing node means it was
//!    deleted; the cycle continues with the name from the key)
//! 2. evaluates its heartbeat and brings the schedulable label in line
//! 3. stops there if the node is healthy
//! 4. otherwise lists the VMs assigned to it and the launcher pods on it
//! 5. moves every stuck VM to `Failed`, attempting each exactly once
//!
//! List failures abort the cycle. Patch failures are collected in the
//! [`CycleOutcome`] so every mutation is attempted before the cycle reports
//! failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use virtwatch_common::crd::VirtualMachine;
use virtwatch_common::{metrics, Error};

use crate::cache::ObjectCache;
use crate::client::{fail_vm_patch, schedulable_label_patch, VirtClient};
use crate::health::{self, NodeHealth};
use crate::selector::{is_failure_candidate, is_live, select_stuck};

/// Shared state handed to every reconciliation cycle
pub struct Context {
    /// Remote API (trait object for testability)
    pub client: Arc<dyn VirtClient>,
    /// Local Node mirror
    pub nodes: Arc<dyn ObjectCache<Node>>,
    /// Heartbeat age after which a node is unresponsive
    pub heartbeat_timeout: Duration,
}

impl Context {
    /// Create a context
    pub fn new(
        client: Arc<dyn VirtClient>,
        nodes: Arc<dyn ObjectCache<Node>>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            client,
            nodes,
            heartbeat_timeout,
        }
    }
}

/// What happened to the schedulable label during a cycle
#[derive(Debug, Default)]
pub enum NodePatchOutcome {
    /// Label already matched the node's health, or the node is gone
    #[default]
    NotNeeded,
    /// Label was set to the given value
    Applied {
        /// New label value
        schedulable: bool,
    },
    /// Patching the label failed
    Failed {
        /// Value that was attempted
        schedulable: bool,
        /// Why it failed
        error: Error,
    },
}

impl NodePatchOutcome {
    /// True if the patch was needed and failed
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Typed result of one cycle: node patch outcome plus one entry per VM patch
#[derive(Debug)]
pub struct CycleOutcome {
    /// Node the cycle ran for
    pub node: String,
    /// Health at evaluation time; `None` if the node no longer exists
    pub health: Option<NodeHealth>,
    /// Outcome of the schedulable label patch
    pub node_patch: NodePatchOutcome,
    /// Outcome of each VM failure patch, keyed by `namespace/name`
    pub vm_patches: BTreeMap<String, Result<(), Error>>,
}

impl CycleOutcome {
    fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            health: None,
            node_patch: NodePatchOutcome::NotNeeded,
            vm_patches: BTreeMap::new(),
        }
    }

    /// `namespace/name` of every VM whose patch failed
    pub fn failed_vms(&self) -> Vec<String> {
        self.vm_patches
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// True if every required mutation succeeded
    pub fn is_success(&self) -> bool {
        !self.node_patch.is_failed() && self.vm_patches.values().all(Result::is_ok)
    }

    /// Collapse into a single result for the queue's retry decision
    pub fn into_result(self) -> Result<(), Error> {
        if self.is_success() {
            return Ok(());
        }
        let failed_vms = self.failed_vms();
        Err(Error::PartialFailure {
            node_patch_failed: self.node_patch.is_failed(),
            node: self.node,
            failed_vms,
        })
    }
}

/// Run one reconciliation cycle for `node_name`
#[instrument(skip_all, fields(node = %node_name))]
pub async fn reconcile(node_name: &str, ctx: &Context) -> Result<CycleOutcome, Error> {
    let mut outcome = CycleOutcome::new(node_name);

    match ctx.nodes.lookup(node_name, None) {
        Some(node) => {
            let health = health::evaluate_node(&node, Utc::now(), ctx.heartbeat_timeout);
            outcome.health = Some(health);
            debug!(node = %node_name, %health, heartbeat = ?health::heartbeat(&node), "evaluated node");

            if let Some(schedulable) = health::desired_label_change(&node, health) {
                outcome.node_patch = patch_schedulable(node_name, schedulable, ctx).await;
            }

            if health.is_schedulable() {
                return Ok(outcome);
            }
        }
        None => {
            info!(node = %node_name, "node no longer exists, checking VMs still assigned to it");
        }
    }

    outcome.vm_patches = fail_stuck_vms(node_name, ctx).await?;
    Ok(outcome)
}

async fn patch_schedulable(node_name: &str, schedulable: bool, ctx: &Context) -> NodePatchOutcome {
    let patch = schedulable_label_patch(schedulable);
    let result = ctx.client.patch_node(node_name, &patch).await;
    metrics::record_schedulable_patch(schedulable, result.is_ok());

    match result {
        Ok(()) => {
            info!(node = %node_name, schedulable, "updated node schedulable label");
            NodePatchOutcome::Applied { schedulable }
        }
        Err(error) => {
            warn!(node = %node_name, schedulable, error = %error, "failed to update node schedulable label");
            NodePatchOutcome::Failed { schedulable, error }
        }
    }
}

async fn fail_stuck_vms(
    node_name: &str,
    ctx: &Context,
) -> Result<BTreeMap<String, Result<(), Error>>, Error> {
    let candidates: Vec<VirtualMachine> = ctx
        .client
        .list_virtual_machines(node_name)
        .await?
        .into_iter()
        .filter(|vm| is_failure_candidate(vm, node_name))
        .collect();

    if candidates.is_empty() {
        debug!(node = %node_name, "no placed VMs on node");
        return Ok(BTreeMap::new());
    }

    let pods: Vec<Pod> = ctx
        .client
        .list_pods(node_name)
        .await?
        .into_iter()
        .filter(|pod| is_live(pod))
        .collect();

    let stuck = select_stuck(&candidates, &pods);
    debug!(
        node = %node_name,
        candidates = candidates.len(),
        live_pods = pods.len(),
        stuck = stuck.len(),
        "selected stuck VMs"
    );

    let mut results = BTreeMap::new();
    for vm in stuck {
        let result = fail_vm(vm, node_name, ctx).await;
        results.insert(vm.key(), result);
    }
    Ok(results)
}

async fn fail_vm(vm: &VirtualMachine, node_name: &str, ctx: &Context) -> Result<(), Error> {
    let key = vm.key();
    let phase = vm.phase();
    let namespace = vm.namespace().unwrap_or_default();
    let patch = fail_vm_patch(node_name, phase)?;

    let result = ctx
        .client
        .patch_virtual_machine(&vm.name_any(), &namespace, &patch)
        .await;
    metrics::record_vm_failure_transition(result.is_ok());

    match &result {
        Ok(()) => info!(node = %node_name, vm = %key, from = %phase, "moved VM without launcher pod to Failed"),
        Err(e) => warn!(node = %node_name, vm = %key, error = %e, "failed to move VM to Failed"),
    }
    result
}
