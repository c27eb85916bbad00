//! The per-VM schedule executor.
//!
//! One agent drives one VM: it confirms guest liveness, pulls the VM's
//! schedule from the schedule store, executes timed entries through the
//! guest-agent channel, publishes state transitions to the coordination
//! service, and participates in the cluster-wide start barrier.

pub mod guest;
pub mod handler;

pub use guest::{ExecHandle, ExecStatus, FileStat, GuestAgent, GuestError};
pub use handler::{ControlEvent, HandlerError, VmDescriptor, VmResourceHandler};

use std::sync::Arc;

use crate::coordination::{ClientError, CoordinationClient, VmMapping};
use crate::types::VmState;

/// Register a VM with the coordination service.
///
/// The VM starts in the configured default state; VMs that opt out of the
/// resource manager are registered as `N/A` and ignored by readiness
/// calculations.
pub async fn register_vm(
    client: &Arc<CoordinationClient>,
    vm: &VmDescriptor,
    use_vm_manager: bool,
    default_state: VmState,
) -> Result<VmMapping, ClientError> {
    let state = if use_vm_manager {
        default_state
    } else {
        VmState::NotApplicable
    };
    let mapping = VmMapping {
        server_uuid: vm.uuid.clone(),
        server_name: vm.name.clone(),
        control_ip: vm.control_ip.clone(),
        state: state.encode().to_string(),
        current_time: String::new(),
    };
    tracing::debug!(uuid = %vm.uuid, name = %vm.name, %state, "registering VM mapping");
    client.set_vm_mapping(mapping).await
}
