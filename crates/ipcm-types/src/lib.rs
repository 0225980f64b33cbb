//! # IPC Manager Types
//!
//! This crate contains the domain entities, the management-plane event set and
//! the error taxonomy shared by every crate of the IPC manager.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All cross-crate types are defined here.
//! - **Closed Event Set**: Native records are normalized into one tagged
//!   [`Event`] type; handlers are keyed by [`EventTag`].
//! - **Weak References**: Flows refer to their IPC process by id, never by
//!   pointer; the registry enforces referential integrity.

pub mod entities;
pub mod errors;
pub mod events;
pub mod outcome;

pub use entities::*;
pub use errors::*;
pub use events::*;
pub use outcome::*;
