//! Test fixtures shared by the unit tests of this crate

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use k8s_openapi::api::core::v1::{Node, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher;
use kube::ResourceExt;

use virtwatch_common::crd::{
    VirtualMachine, VirtualMachinePhase, VirtualMachineSpec, VirtualMachineStatus,
};
use virtwatch_common::{
    APP_LABEL_KEY, DOMAIN_LABEL, HEARTBEAT_ANNOTATION, INITIALIZED_ANNOTATION, LAUNCHER_APP,
    NODE_NAME_LABEL, SCHEDULABLE_LABEL,
};

/// Heartbeat timestamp `offset` away from now
pub fn heartbeat_with_offset(offset: TimeDelta) -> String {
    (Utc::now() + offset).to_rfc3339()
}

/// Node with a fresh heartbeat, labeled schedulable
pub fn healthy_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(BTreeMap::from([(
                HEARTBEAT_ANNOTATION.to_string(),
                heartbeat_with_offset(TimeDelta::zero()),
            )])),
            labels: Some(BTreeMap::from([(
                SCHEDULABLE_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Node whose heartbeat is 10 minutes old and that is already labeled unschedulable
pub fn unhealthy_node(name: &str) -> Node {
    let mut node = healthy_node(name);
    node.annotations_mut().insert(
        HEARTBEAT_ANNOTATION.to_string(),
        heartbeat_with_offset(TimeDelta::minutes(-10)),
    );
    node.labels_mut()
        .insert(SCHEDULABLE_LABEL.to_string(), "false".to_string());
    node
}

/// Initialized VM running on `node` in the default namespace
pub fn running_vm(name: &str, node: &Node) -> VirtualMachine {
    let node_name = node.name_any();
    let mut vm = VirtualMachine::new(name, VirtualMachineSpec::default());
    vm.metadata.namespace = Some("default".to_string());
    vm.metadata.uid = Some("1234".to_string());
    vm.metadata.annotations = Some(BTreeMap::from([(
        INITIALIZED_ANNOTATION.to_string(),
        "true".to_string(),
    )]));
    vm.metadata.labels = Some(BTreeMap::from([(
        NODE_NAME_LABEL.to_string(),
        node_name.clone(),
    )]));
    vm.status = Some(VirtualMachineStatus {
        phase: VirtualMachinePhase::Running,
        node_name: Some(node_name),
    });
    vm
}

/// Running VM with a different phase
pub fn vm_in_phase(name: &str, node: &Node, phase: VirtualMachinePhase) -> VirtualMachine {
    let mut vm = running_vm(name, node);
    if let Some(status) = vm.status.as_mut() {
        status.phase = phase;
    }
    vm
}

/// Launcher pod backing `vm` on its node
pub fn pod_for_vm(name: &str, vm: &VirtualMachine) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(BTreeMap::from([
                (DOMAIN_LABEL.to_string(), vm.name_any()),
                (APP_LABEL_KEY.to_string(), LAUNCHER_APP.to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: vm.node_name().map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Reflector store pre-filled with `objects`, as after an initial list
pub fn store_with<K>(objects: Vec<K>) -> (Store<K>, reflector::store::Writer<K>)
where
    K: kube::Resource + Clone + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (store, mut writer) = reflector::store();
    writer.apply_watcher_event(&watcher::Event::Init);
    for obj in objects {
        writer.apply_watcher_event(&watcher::Event::InitApply(obj));
    }
    writer.apply_watcher_event(&watcher::Event::InitDone);
    (store, writer)
}

/// Node store pre-filled with `nodes`, shared as the controller sees it
pub fn node_store(nodes: Vec<Node>) -> (Arc<Store<Node>>, reflector::store::Writer<Node>) {
    let (store, writer) = store_with(nodes);
    (Arc::new(store), writer)
}
