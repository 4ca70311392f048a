//! Custom Resource Definitions consumed by virtwatch
//!
//! The VirtualMachine CRD is owned by the VM admission/scheduling path; this
//! crate only mirrors the fields the node controller reads and patches.

mod virtual_machine;

pub use virtual_machine::{
    VirtualMachine, VirtualMachinePhase, VirtualMachineSpec, VirtualMachineStatus,
};
