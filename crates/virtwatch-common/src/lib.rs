//! Common types for virtwatch: the VirtualMachine CRD, well-known keys, errors,
//! Kubernetes Events, metrics, and telemetry setup

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Node label controlling whether new VMs may be placed on the node
pub const SCHEDULABLE_LABEL: &str = "kubevirt.io/schedulable";

/// Node annotation refreshed periodically by the node agent (RFC3339 timestamp)
pub const HEARTBEAT_ANNOTATION: &str = "kubevirt.io/heartbeat";

/// VirtualMachine label mirroring the node the VM was assigned to
pub const NODE_NAME_LABEL: &str = "kubevirt.io/nodeName";

/// VirtualMachine annotation set once initial scheduling has completed
pub const INITIALIZED_ANNOTATION: &str = "kubevirt.io/initialized";

/// Pod label carrying the name of the VirtualMachine the pod runs
pub const DOMAIN_LABEL: &str = "kubevirt.io/domain";

/// Label key identifying pods created for VirtualMachines
pub const APP_LABEL_KEY: &str = "kubevirt.io";

/// Value of [`APP_LABEL_KEY`] on VM launcher pods
pub const LAUNCHER_APP: &str = "virt-launcher";

/// Label selector matching VM launcher pods (for Kubernetes API queries)
pub const LAUNCHER_LABEL_SELECTOR: &str = "kubevirt.io=virt-launcher";

/// Field manager / reporting component name used for patches and Events
pub const CONTROLLER_NAME: &str = "virtwatch-node-controller";
