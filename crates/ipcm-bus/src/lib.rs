//! # IPC Manager Bus - Native Runtime Boundary
//!
//! Everything between the network-stack runtime and the dispatcher.
//!
//! ```text
//! ┌──────────────────┐  wait_event()   ┌─────────────────────┐  next_event()
//! │  Native runtime  │ ──────────────→ │ EventSourceAdapter  │ ─────────────→ workers
//! │ (kernel/loopback)│                 │  normalize + inject │
//! │                  │ ←────────────── │                     │
//! └──────────────────┘ issue()/notify()└─────────────────────┘
//! ```
//!
//! - [`native`]: the two native ports and the raw record set
//! - [`source`]: the shutdown-aware, normalizing event source
//! - [`loopback`]: an in-process runtime for the binary and for tests

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod loopback;
pub mod native;
pub mod source;

pub use loopback::LoopbackRuntime;
pub use native::{
    normalize, NativeAck, NativeCall, NativeError, NativeEvent, NativeEventSource, NativeRuntime,
    Notification,
};
pub use source::{EventSourceAdapter, SourceItem, SourceState, SourceStats};

/// Default bound on locally injected events waiting for a reader.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default bound on one blocking wait for a native record, in milliseconds.
pub const DEFAULT_IDLE_POLL_MS: u64 = 50;
