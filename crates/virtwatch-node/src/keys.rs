//! Key extraction: which node has to be reconciled after a change
//!
//! Every notification (Node, VirtualMachine or launcher Pod) is reduced to the
//! name of the node whose state may have changed. Returning `None` means the
//! change is irrelevant to node health.

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

use virtwatch_common::crd::VirtualMachine;
use virtwatch_common::DOMAIN_LABEL;

use crate::cache::ObjectCache;

/// Key of a node notification (add, update or delete)
pub fn node_key(node: &Node) -> Option<String> {
    node.metadata.name.clone().filter(|n| !n.is_empty())
}

/// Key of a VM notification: the node the VM is assigned to
pub fn vm_key(vm: &VirtualMachine) -> Option<String> {
    vm.node_name().map(str::to_string)
}

/// Key of a launcher pod notification.
///
/// The owning VM (same namespace, named by the domain label) is looked up in
/// the VM cache and its node is used. When the VM is not cached the pod's own
/// node assignment is used instead. Pods without a domain label are ignored.
pub fn pod_key(pod: &Pod, vms: &dyn ObjectCache<VirtualMachine>) -> Option<String> {
    let vm_name = pod.labels().get(DOMAIN_LABEL)?;
    let namespace = pod.namespace();

    if let Some(vm) = vms.lookup(vm_name, namespace.as_deref()) {
        if let Some(node) = vm_key(&vm) {
            return Some(node);
        }
    }

    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .filter(|n| !n.is_empty())
}
