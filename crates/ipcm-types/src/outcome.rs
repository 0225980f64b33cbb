//! Outcomes delivered to callers waiting on a pending request.

use serde::Serialize;

use crate::entities::{ApplicationRegistration, FlowRecord, IpcProcessHandle};
use crate::errors::IpcmError;

/// What a successful request produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Resolution {
    /// The operation completed with nothing to return.
    Done,
    Process(IpcProcessHandle),
    Flow(FlowRecord),
    Registration(ApplicationRegistration),
}

/// Final state of a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Resolution),
    Failed(IpcmError),
    /// Evicted by the correlator sweep or the caller's wait expired.
    Timeout,
    /// Resolved by a shutdown before completion.
    Cancelled,
}

impl Outcome {
    /// Collapse the outcome into a `Result`, naming `what` in timeout and
    /// cancellation errors.
    pub fn into_result(self, what: &str) -> Result<Resolution, IpcmError> {
        match self {
            Outcome::Success(resolution) => Ok(resolution),
            Outcome::Failed(err) => Err(err),
            Outcome::Timeout => Err(IpcmError::Timeout(what.to_string())),
            Outcome::Cancelled => Err(IpcmError::Cancelled(what.to_string())),
        }
    }
}
