//! Stuck-VM selection (pure functions)
//!
//! A VM is stuck when it sits on an unresponsive node, has not reached a
//! terminal phase, and no live launcher pod backs it any more.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use virtwatch_common::crd::VirtualMachine;
use virtwatch_common::DOMAIN_LABEL;

/// Filter `vms` down to the ones without a backing pod in `pods`.
///
/// Terminal VMs are always dropped. A pod backs a VM only if its domain label
/// names the VM, it lives in the VM's namespace, and it runs on the VM's node.
/// Callers apply [`is_failure_candidate`] first; this function does not look
/// at pre-placement phases.
pub fn select_stuck<'a>(vms: &'a [VirtualMachine], pods: &[Pod]) -> Vec<&'a VirtualMachine> {
    vms.iter()
        .filter(|vm| !vm.phase().is_final())
        .filter(|vm| !pods.iter().any(|pod| backs(pod, vm)))
        .collect()
}

/// Whether `vm` may be forced to `Failed` on behalf of `node_name`.
///
/// Only VMs that were actually placed there (Scheduled or Running) and whose
/// initial scheduling completed qualify; earlier phases stay with the
/// scheduler.
pub fn is_failure_candidate(vm: &VirtualMachine, node_name: &str) -> bool {
    vm.node_name() == Some(node_name) && vm.phase().is_placed() && vm.is_initialized()
}

/// Whether a launcher pod still occupies resources on its node
pub fn is_live(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some("Succeeded") | Some("Failed"))
}

fn backs(pod: &Pod, vm: &VirtualMachine) -> bool {
    let Some(domain) = pod.labels().get(DOMAIN_LABEL) else {
        return false;
    };
    let pod_node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());

    *domain == vm.name_any() && pod.namespace() == vm.namespace() && pod_node == vm.node_name()
}
