//! # IPC Manager Runtime
//!
//! The event dispatch and lifecycle core of the IPC manager. The `ipcm`
//! binary in `main.rs` is a thin bootstrap over [`IpcManager`].
//!
//! ## Wiring
//!
//! ```text
//!                      ┌────────────── IpcManager ───────────────┐
//!  management calls ──→│ create/destroy process, allocate flow.. │
//!                      │         │ issue()        ▲ outcome       │
//!                      │         ▼                │               │
//!                      │   Correlator ←──claim── handlers         │
//!                      │                           ▲              │
//!                      │   EntityRegistry ←────────┤              │
//!                      │                           │ route()      │
//!  native runtime ────→│ EventSourceAdapter ──→ WorkerPool ──→ DispatchRouter
//!                      └──────────────────────────────────────────┘
//! ```
//!
//! - [`config`]: manager configuration and environment overrides
//! - [`router`]: handler table and ordering key resolution
//! - [`workers`]: per-key lanes and the worker pool
//! - [`handlers`]: one handler per event tag
//! - [`manager`]: the facade and its lifecycle

#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod handlers;
pub mod manager;
pub mod router;
pub mod workers;

pub use config::{
    ConfigError, CorrelatorConfig, LoopbackConfig, ManagerConfig, SourceConfig, WorkerConfig,
};
pub use manager::{IpcManager, IpcManagerBuilder, Lifecycle, ManagerState, ShutdownHandle};
pub use router::{DispatchRouter, EventHandler, HandlerTable, HandlerTableBuilder, Routed};
pub use workers::{PoolStats, ShutdownOutcome, ShutdownReport, WorkerPool};
