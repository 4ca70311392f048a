//! Remote API seam for the node controller
//!
//! All reads that drive a decision and all writes go through [`VirtClient`],
//! so reconciliation logic can be tested against a mock while production
//! uses the kube-rs client.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use virtwatch_common::crd::{VirtualMachine, VirtualMachinePhase};
use virtwatch_common::{
    Error, CONTROLLER_NAME, LAUNCHER_LABEL_SELECTOR, NODE_NAME_LABEL, SCHEDULABLE_LABEL,
};

/// Trait abstracting the Kubernetes API calls made by the node controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VirtClient: Send + Sync {
    /// List VirtualMachines labeled as assigned to `node_name`
    async fn list_virtual_machines(&self, node_name: &str) -> Result<Vec<VirtualMachine>, Error>;

    /// List launcher pods scheduled on `node_name`
    async fn list_pods(&self, node_name: &str) -> Result<Vec<Pod>, Error>;

    /// Apply a merge patch to a Node's metadata
    async fn patch_node(&self, node_name: &str, patch: &serde_json::Value) -> Result<(), Error>;

    /// Apply a JSON patch to a VirtualMachine's status subresource
    async fn patch_virtual_machine(
        &self,
        name: &str,
        namespace: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error>;
}

/// Merge patch setting only the schedulable label of a node
///
/// Restricted to the single label so concurrent writers of other node fields
/// are not clobbered.
pub fn schedulable_label_patch(schedulable: bool) -> serde_json::Value {
    let value = if schedulable { "true" } else { "false" };
    json!({
        "metadata": {
            "labels": {
                SCHEDULABLE_LABEL: value
            }
        }
    })
}

/// JSON patch moving a VM to `Failed`
///
/// The `test` operations make the API server reject the patch if the VM was
/// moved to another node or changed phase since it was listed.
pub fn fail_vm_patch(
    node_name: &str,
    observed_phase: VirtualMachinePhase,
) -> Result<json_patch::Patch, Error> {
    let ops = json!([
        { "op": "test", "path": "/status/nodeName", "value": node_name },
        { "op": "test", "path": "/status/phase", "value": observed_phase.as_str() },
        { "op": "replace", "path": "/status/phase", "value": VirtualMachinePhase::Failed.as_str() }
    ]);
    serde_json::from_value(ops)
        .map_err(|e| Error::serialization_for("VirtualMachine", e.to_string()))
}

/// Real Kubernetes client implementation
pub struct KubeVirtClient {
    client: Client,
    namespace: Option<String>,
}

impl KubeVirtClient {
    /// Create a client listing across all namespaces
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: None,
        }
    }

    /// Create a client whose VM and pod lists are restricted to `namespace`
    pub fn namespaced(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: Some(namespace.into()),
        }
    }

    fn scoped<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl VirtClient for KubeVirtClient {
    async fn list_virtual_machines(&self, node_name: &str) -> Result<Vec<VirtualMachine>, Error> {
        let api: Api<VirtualMachine> = self.scoped();
        let params = ListParams::default().labels(&format!("{}={}", NODE_NAME_LABEL, node_name));
        let list = api.list(&params).await?;
        debug!(node = %node_name, count = list.items.len(), "listed virtual machines");
        Ok(list.items)
    }

    async fn list_pods(&self, node_name: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = self.scoped();
        let params = ListParams::default()
            .labels(LAUNCHER_LABEL_SELECTOR)
            .fields(&format!("spec.nodeName={}", node_name));
        let list = api.list(&params).await?;
        debug!(node = %node_name, count = list.items.len(), "listed launcher pods");
        Ok(list.items)
    }

    async fn patch_node(&self, node_name: &str, patch: &serde_json::Value) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(
            node_name,
            &PatchParams {
                field_manager: Some(CONTROLLER_NAME.to_string()),
                ..Default::default()
            },
            &Patch::Merge(patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_virtual_machine(
        &self,
        name: &str,
        namespace: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams {
                field_manager: Some(CONTROLLER_NAME.to_string()),
                ..Default::default()
            },
            &Patch::Json::<()>(patch.clone()),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unschedulable_patch_touches_only_the_label() {
        let patch = schedulable_label_patch(false);
        assert_eq!(
            patch,
            json!({"metadata": {"labels": {"kubevirt.io/schedulable": "false"}}})
        );
    }

    #[test]
    fn schedulable_patch_restores_label() {
        let patch = schedulable_label_patch(true);
        assert_eq!(patch["metadata"]["labels"][SCHEDULABLE_LABEL], "true");
        assert_eq!(patch.as_object().map(|o| o.len()), Some(1));
    }

    #[test]
    fn fail_vm_patch_guards_node_and_phase() {
        let patch = fail_vm_patch("node01", VirtualMachinePhase::Running).unwrap();
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            value,
            json!([
                { "op": "test", "path": "/status/nodeName", "value": "node01" },
                { "op": "test", "path": "/status/phase", "value": "Running" },
                { "op": "replace", "path": "/status/phase", "value": "Failed" }
            ])
        );
    }
}
