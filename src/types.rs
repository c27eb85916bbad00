//! Core types for the Embermesh orchestration system.
//!
//! This module defines the fundamental types shared across the resolver,
//! the schedule executor, and the coordination service: the VM lifecycle
//! state machine and the guest exit-code conventions.
//!
//! # Key Types
//!
//! - [`VmState`]: Lifecycle state of a VM as tracked by the coordination service
//! - [`ExitDisposition`]: Classification of a guest program's exit code
//!
//! # Examples
//!
//! ```rust
//! use embermesh::types::VmState;
//!
//! let state = VmState::Configuring;
//! assert_eq!(state.encode(), "configuring");
//! assert_eq!(VmState::decode("configuring"), VmState::Configuring);
//! assert!(!state.is_ready());
//! assert!(VmState::Configured.is_ready());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exit code signalling success.
pub const EXIT_SUCCESS: i32 = 0;

/// Reserved exit code meaning "already installed / skip".
///
/// A guest program returning this code is treated as a successful no-op:
/// the entry completes without a failure record.
pub const EXIT_ALREADY_INSTALLED: i32 = 117;

/// Default reboot exit code used when a guest-agent driver does not
/// document its own. Drivers may override via
/// [`GuestAgent::reboot_exit_code`](crate::agent::GuestAgent::reboot_exit_code).
pub const DEFAULT_REBOOT_EXIT_CODE: i32 = 164;

/// Lifecycle state of a VM as tracked by the coordination service.
///
/// The states form a small machine:
///
/// ```text
/// uninitialized → configuring → configured → running ⇄ rebooting
///                                      ↓         ↓
///                                    exited    exited
/// ```
///
/// `NotApplicable` marks VMs with no agent attached; they are ignored for
/// readiness calculations such as the not-ready count that gates the
/// experiment start barrier.
///
/// # Persistence
///
/// `VmState` travels over the coordination wire protocol as its encoded
/// string form (see [`encode`](Self::encode)/[`decode`](Self::decode)) and
/// also supports serde for embedding in JSON payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Initial state before any agent has attached.
    #[default]
    Uninitialized,
    /// The agent is executing negative-time (configuration-phase) entries.
    Configuring,
    /// All configuration entries are done; the VM is waiting at the
    /// cluster-wide start barrier.
    Configured,
    /// Positive-time (experiment-phase) entries are executing.
    Running,
    /// The guest rebooted; the agent is re-establishing its session.
    Rebooting,
    /// The schedule drained or the agent was cancelled.
    Exited,
    /// No agent manages this VM; excluded from readiness calculations.
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl VmState {
    /// Encode a state into its persisted string form.
    ///
    /// The encoding matches the wire protocol: lowercase words, with
    /// `NotApplicable` spelled `"N/A"`.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            VmState::Uninitialized => "uninitialized",
            VmState::Configuring => "configuring",
            VmState::Configured => "configured",
            VmState::Running => "running",
            VmState::Rebooting => "rebooting",
            VmState::Exited => "exited",
            VmState::NotApplicable => "N/A",
        }
    }

    /// Decode a persisted string form back into a state.
    ///
    /// Unknown strings decode to [`Uninitialized`](Self::Uninitialized) so
    /// that a newer peer cannot wedge an older reader.
    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "configuring" => VmState::Configuring,
            "configured" => VmState::Configured,
            "running" => VmState::Running,
            "rebooting" => VmState::Rebooting,
            "exited" => VmState::Exited,
            "N/A" => VmState::NotApplicable,
            _ => VmState::Uninitialized,
        }
    }

    /// Returns `true` if the state counts as ready for the experiment
    /// start barrier (`configured` or `N/A`).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, VmState::Configured | VmState::NotApplicable)
    }

    /// Returns `true` if the agent has terminated.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmState::Exited)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl From<&str> for VmState {
    fn from(s: &str) -> Self {
        VmState::decode(s)
    }
}

/// Classification of a guest program's exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Exit code 0.
    Success,
    /// Reserved "already installed" code; the entry is a successful no-op.
    Skipped,
    /// The driver's reboot code; the agent must reconnect and resume.
    Reboot,
    /// Non-zero exit with `ignore_failure` set on the entry.
    Warning,
    /// Non-zero exit; fatal for the entry.
    Failure,
}

impl ExitDisposition {
    /// Classify an exit code under the standard convention.
    ///
    /// `reboot_code` comes from the guest-agent driver;
    /// `ignore_failure` comes from the schedule entry.
    #[must_use]
    pub fn classify(code: i32, reboot_code: i32, ignore_failure: bool) -> Self {
        if code == EXIT_SUCCESS {
            ExitDisposition::Success
        } else if code == EXIT_ALREADY_INSTALLED {
            ExitDisposition::Skipped
        } else if code == reboot_code {
            ExitDisposition::Reboot
        } else if ignore_failure {
            ExitDisposition::Warning
        } else {
            ExitDisposition::Failure
        }
    }
}
