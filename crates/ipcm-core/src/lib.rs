//! # IPC Manager Core - Domain Services
//!
//! The two pieces of shared state the dispatcher workers operate on:
//!
//! - [`EntityRegistry`]: IPC processes, their flows and application
//!   registrations, with per-process locking
//! - [`Correlator`]: pending asynchronous requests awaiting a native
//!   completion, with timeout eviction
//!
//! Neither owns a thread. Both are constructed once by the manager facade
//! and shared with the workers behind an `Arc`.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod correlator;
pub mod registry;

pub use correlator::{
    Claim, Correlator, CorrelatorStats, OperationKind, PendingRequest, RequestContext,
    RequestOrigin, Ticket, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SWEEP_INTERVAL,
};
pub use registry::EntityRegistry;
