//! # Error Types
//!
//! The error taxonomy of the IPC manager. Every crate in the workspace reports
//! failures through [`IpcmError`].

use thiserror::Error;

use crate::entities::{CorrelationId, PortId, ProcessId};
use crate::events::EventTag;

/// Errors surfaced by the registry, correlator, dispatcher and facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpcmError {
    /// An IPC process with this id already exists.
    #[error("Duplicate entity: {0} already exists")]
    DuplicateEntity(ProcessId),

    /// No IPC process with this id is known.
    #[error("Unknown entity: {0}")]
    UnknownEntity(ProcessId),

    /// The process still owns open flows and force was not requested.
    #[error("Entity busy: {process_id} still owns {open_flows} open flow(s)")]
    EntityBusy { process_id: ProcessId, open_flows: usize },

    /// The port id is already used by a non-closed flow.
    #[error("Duplicate port: {port_id} already in use by {owner}")]
    DuplicatePort { port_id: PortId, owner: ProcessId },

    /// No flow is known for this port id.
    #[error("Unknown port: {0}")]
    UnknownPort(PortId),

    /// The handler table has no entry for this event tag.
    #[error("Unhandled event type: {0:?}")]
    UnhandledEventType(EventTag),

    /// No pending request matches this correlation id (duplicate or late event).
    #[error("Unknown correlation: {0}")]
    UnknownCorrelation(CorrelationId),

    /// The request did not complete in time.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The request was cancelled by a shutdown.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The native runtime failed or misbehaved.
    #[error("Runtime adapter failure: {0}")]
    RuntimeAdapterFailure(String),

    /// The entity is not in a state that allows the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No active IPC process can serve the request.
    #[error("No IPC process available{}", dif_suffix(.dif))]
    NoProcessAvailable { dif: Option<String> },

    /// The peer application or IPC process refused the operation.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// `start()` raced with another in-progress `start()`.
    #[error("Manager start already in progress")]
    AlreadyRunning,

    /// The manager has not been started.
    #[error("Manager is not running")]
    NotRunning,

    /// The manager has been stopped and cannot be reused.
    #[error("Manager has been shut down")]
    ShutDown,

    /// Fewer workers than the configured minimum could be spawned.
    #[error("Startup failure: {0}")]
    StartupFailure(String),
}

impl IpcmError {
    /// Errors expected in normal operation (duplicate or late events).
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            IpcmError::UnknownCorrelation(_) | IpcmError::UnhandledEventType(_)
        )
    }
}

fn dif_suffix(dif: &Option<String>) -> String {
    dif.as_ref()
        .map(|d| format!(" in DIF {d}"))
        .unwrap_or_default()
}

/// Result alias used across the workspace.
pub type IpcmResult<T> = Result<T, IpcmError>;
