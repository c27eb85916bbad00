//! The guest-agent capability channel.
//!
//! [`GuestAgent`] is the narrow contract between the executor and whatever
//! drives the VM (QEMU guest agent, SSH, a test double). A driver that
//! cannot provide a capability must return
//! [`GuestError::Unavailable`] rather than faking success: the executor
//! treats unavailable capabilities as entry failures, never as silent
//! no-ops.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::types::DEFAULT_REBOOT_EXIT_CODE;

/// Stat result for an in-VM path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    pub exists: bool,
    /// Modification time, milliseconds since the epoch. Zero when the
    /// path does not exist.
    pub mtime_ms: i64,
    pub size: u64,
}

/// Opaque handle for a dispatched program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExecHandle(pub u64);

/// Poll result for a dispatched program.
#[derive(Clone, Debug, Default)]
pub struct ExecStatus {
    pub running: bool,
    /// Present once `running` is false.
    pub exit_code: Option<i32>,
    /// Stdout produced since the previous poll.
    pub stdout: String,
    /// Stderr produced since the previous poll.
    pub stderr: String,
}

/// Errors raised by guest-agent drivers.
#[derive(Debug, Error, Diagnostic)]
pub enum GuestError {
    #[error("guest agent does not provide the \"{capability}\" capability")]
    #[diagnostic(
        code(embermesh::guest::unavailable),
        help("The driver must signal unavailable capabilities instead of faking success.")
    )]
    Unavailable { capability: &'static str },

    #[error("guest agent timed out during \"{capability}\"")]
    #[diagnostic(code(embermesh::guest::timeout))]
    Timeout { capability: &'static str },

    #[error("guest agent is not connected")]
    #[diagnostic(code(embermesh::guest::disconnected))]
    Disconnected,

    #[error("unknown exec handle {handle}")]
    #[diagnostic(code(embermesh::guest::unknown_handle))]
    UnknownHandle { handle: u64 },

    #[error("guest I/O failed: {message}")]
    #[diagnostic(code(embermesh::guest::io))]
    Io { message: String },
}

impl GuestError {
    /// Whether a reconnect-and-retry could succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GuestError::Timeout { .. } | GuestError::Disconnected | GuestError::Io { .. }
        )
    }
}

/// The capability set the executor consumes.
#[async_trait]
pub trait GuestAgent: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), GuestError>;

    /// Synchronize the channel after (re)connection; completes only once
    /// the guest side is responsive.
    async fn sync(&self) -> Result<(), GuestError>;

    /// Write bytes to an in-VM path, setting the executable bit when
    /// asked.
    async fn file_write(
        &self,
        path: &str,
        bytes: &[u8],
        executable: bool,
    ) -> Result<(), GuestError>;

    /// Read an in-VM file.
    async fn file_read(&self, path: &str) -> Result<Vec<u8>, GuestError>;

    /// Stat an in-VM path. A missing path is `exists: false`, not an
    /// error.
    async fn file_stat(&self, path: &str) -> Result<FileStat, GuestError>;

    /// Remove an in-VM file. A missing path is a no-op.
    async fn file_remove(&self, path: &str) -> Result<(), GuestError>;

    /// Dispatch a program asynchronously.
    async fn exec(&self, path: &str, args: &str) -> Result<ExecHandle, GuestError>;

    /// Poll a dispatched program.
    async fn exec_status(&self, handle: ExecHandle) -> Result<ExecStatus, GuestError>;

    /// Ask the guest to reboot.
    async fn reboot(&self) -> Result<(), GuestError>;

    /// The exit code this driver's guests use to signal a reboot request.
    fn reboot_exit_code(&self) -> i32 {
        DEFAULT_REBOOT_EXIT_CODE
    }
}
