//! VirtualMachine CRD types
//!
//! Only the fields the node controller consumes are modelled: the assigned node,
//! the lifecycle phase, and the initialized marker. Unknown fields round-trip
//! through the API server untouched because the controller only ever sends
//! targeted patches.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::INITIALIZED_ANNOTATION;

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a VirtualMachine
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum VirtualMachinePhase {
    /// Not yet processed by any controller
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Accepted, waiting to be scheduled
    Pending,
    /// A launcher pod is being scheduled
    Scheduling,
    /// Placed on a node, not yet running
    Scheduled,
    /// Running on its node
    Running,
    /// Completed successfully
    Succeeded,
    /// Terminated with an error, or lost together with its node
    Failed,
}

impl VirtualMachinePhase {
    /// Returns the phase as it appears in `status.phase`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Pending => "Pending",
            Self::Scheduling => "Scheduling",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    /// Terminal phases are never left again
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// The VM was actually placed on a node and has not terminated
    pub fn is_placed(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

impl std::fmt::Display for VirtualMachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "Unset"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Virtual machine managed by the cluster's VM stack
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    namespaced,
    status = "VirtualMachineStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Node labels the VM must be placed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Grace period for the VM's launcher pod on shutdown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

/// Observed state of a VirtualMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: VirtualMachinePhase,

    /// Node the VM was assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl VirtualMachine {
    /// Current phase, `Unset` when the VM has no status yet
    pub fn phase(&self) -> VirtualMachinePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Node the VM is assigned to, if any
    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .filter(|n| !n.is_empty())
    }

    /// Whether initial scheduling completed for this VM
    pub fn is_initialized(&self) -> bool {
        self.annotations().contains_key(INITIALIZED_ANNOTATION)
    }

    /// `namespace/name` identity used in logs and error reports
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_with_status(phase: VirtualMachinePhase, node: Option<&str>) -> VirtualMachine {
        let mut vm = VirtualMachine::new("vm1", VirtualMachineSpec::default());
        vm.metadata.namespace = Some("default".to_string());
        vm.status = Some(VirtualMachineStatus {
            phase,
            node_name: node.map(str::to_string),
        });
        vm
    }

    #[test]
    fn unset_phase_serializes_as_empty_string() {
        let json = serde_json::to_value(VirtualMachinePhase::Unset).unwrap();
        assert_eq!(json, serde_json::json!(""));
        let parsed: VirtualMachinePhase = serde_json::from_value(serde_json::json!("")).unwrap();
        assert_eq!(parsed, VirtualMachinePhase::Unset);
    }

    #[test]
    fn status_deserializes_from_api_shape() {
        let status: VirtualMachineStatus = serde_json::from_value(serde_json::json!({
            "phase": "Running",
            "nodeName": "node01"
        }))
        .unwrap();
        assert_eq!(status.phase, VirtualMachinePhase::Running);
        assert_eq!(status.node_name.as_deref(), Some("node01"));
    }

    #[test]
    fn missing_phase_defaults_to_unset() {
        let status: VirtualMachineStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(status.phase, VirtualMachinePhase::Unset);
    }

    #[test]
    fn final_and_placed_phases() {
        use VirtualMachinePhase::*;
        for phase in [Succeeded, Failed] {
            assert!(phase.is_final());
            assert!(!phase.is_placed());
        }
        for phase in [Scheduled, Running] {
            assert!(phase.is_placed());
            assert!(!phase.is_final());
        }
        for phase in [Unset, Pending, Scheduling] {
            assert!(!phase.is_placed());
            assert!(!phase.is_final());
        }
    }

    #[test]
    fn phase_display() {
        assert_eq!(VirtualMachinePhase::Unset.to_string(), "Unset");
        assert_eq!(VirtualMachinePhase::Running.to_string(), "Running");
        assert_eq!(VirtualMachinePhase::Failed.to_string(), "Failed");
    }

    #[test]
    fn accessors_read_status_and_metadata() {
        let mut vm = vm_with_status(VirtualMachinePhase::Running, Some("node01"));
        assert_eq!(vm.phase(), VirtualMachinePhase::Running);
        assert_eq!(vm.node_name(), Some("node01"));
        assert!(!vm.is_initialized());
        assert_eq!(vm.key(), "default/vm1");

        vm.annotations_mut()
            .insert(INITIALIZED_ANNOTATION.to_string(), "true".to_string());
        assert!(vm.is_initialized());
    }

    #[test]
    fn empty_node_name_counts_as_unassigned() {
        let vm = vm_with_status(VirtualMachinePhase::Pending, Some(""));
        assert_eq!(vm.node_name(), None);

        let bare = VirtualMachine::new("bare", VirtualMachineSpec::default());
        assert_eq!(bare.phase(), VirtualMachinePhase::Unset);
        assert_eq!(bare.node_name(), None);
    }
}
