//! # Core Domain Entities
//!
//! Identifiers, names and the management-plane records the IPC manager keeps
//! for every IPC process and flow it supervises.
//!
//! ## Clusters
//!
//! - **Identity**: `ProcessId`, `PortId`, `CorrelationId`, `DifName`, `ApplicationName`
//! - **IPC processes**: `ProcessSpec`, `IpcProcessHandle`, `ProcessState`
//! - **Flows**: `FlowRecord`, `FlowState`
//! - **Registrations**: `ApplicationRegistration`

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// CLUSTER A: IDENTITY
// =============================================================================

/// Numeric id of a managed IPC process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub u16);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipcp-{}", self.0)
    }
}

/// Port id that locally identifies a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub u32);

impl PortId {
    /// Interpret a native port id, where any negative value means "no port".
    #[must_use]
    pub fn from_native(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(PortId)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port-{}", self.0)
    }
}

/// Sequence number linking an issued native call to its completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u32);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Name of a DIF (the layer an IPC process is a member of).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DifName(pub String);

impl DifName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DifName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Naming information of an application process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationName {
    /// Application process name.
    pub process_name: String,
    /// Application process instance (may be empty).
    pub process_instance: String,
}

impl ApplicationName {
    /// Name without an instance qualifier.
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            process_instance: String::new(),
        }
    }

    pub fn with_instance(process_name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            process_instance: instance.into(),
        }
    }
}

impl fmt::Display for ApplicationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.process_instance.is_empty() {
            f.write_str(&self.process_name)
        } else {
            write!(f, "{}/{}", self.process_name, self.process_instance)
        }
    }
}

// =============================================================================
// CLUSTER B: IPC PROCESSES
// =============================================================================

/// Kind of IPC process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpcProcessType {
    /// Full recursive-network IPC process.
    Normal,
    /// Shim process wrapping a legacy medium (Ethernet VLAN, TCP/UDP, ...).
    Shim,
}

/// Lifecycle of a managed IPC process.
///
/// ```text
/// CREATING ──confirmed──→ ACTIVE ──teardown──→ TERMINATING ──confirmed──→ DESTROYED
///     │                                                                      ↑
///     └──────────────────────── failed / died ───────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    Creating,
    Active,
    Terminating,
    Destroyed,
}

impl ProcessState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Creating, Active)
                | (Creating, Destroyed)
                | (Active, Terminating)
                | (Active, Destroyed)
                | (Terminating, Destroyed)
        )
    }
}

/// Parameters of a "create IPC process" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub id: ProcessId,
    pub process_type: IpcProcessType,
    /// Naming information of the IPC process itself.
    pub name: ApplicationName,
    /// DIF the process is assigned to, once known.
    pub dif: Option<DifName>,
}

impl ProcessSpec {
    /// A normal IPC process member of `dif`.
    pub fn normal(id: u16, name: impl Into<String>, dif: impl Into<String>) -> Self {
        Self {
            id: ProcessId(id),
            process_type: IpcProcessType::Normal,
            name: ApplicationName::new(name),
            dif: Some(DifName::new(dif)),
        }
    }

    /// A shim IPC process over `dif`.
    pub fn shim(id: u16, name: impl Into<String>, dif: impl Into<String>) -> Self {
        Self {
            id: ProcessId(id),
            process_type: IpcProcessType::Shim,
            name: ApplicationName::new(name),
            dif: Some(DifName::new(dif)),
        }
    }
}

/// Snapshot of one managed IPC process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcProcessHandle {
    pub id: ProcessId,
    pub process_type: IpcProcessType,
    pub name: ApplicationName,
    pub dif: Option<DifName>,
    pub state: ProcessState,
    /// Ports of the non-closed flows this process owns.
    pub ports: BTreeSet<PortId>,
}

impl IpcProcessHandle {
    /// A fresh handle in `CREATING` state.
    #[must_use]
    pub fn from_spec(spec: &ProcessSpec) -> Self {
        Self {
            id: spec.id,
            process_type: spec.process_type,
            name: spec.name.clone(),
            dif: spec.dif.clone(),
            state: ProcessState::Creating,
            ports: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == ProcessState::Active
    }

    /// Whether this process is a member of `dif`.
    #[must_use]
    pub fn serves(&self, dif: &DifName) -> bool {
        self.dif.as_ref() == Some(dif)
    }
}

// =============================================================================
// CLUSTER C: FLOWS
// =============================================================================

/// Lifecycle of a flow.
///
/// ```text
/// ALLOCATING ──accepted──→ ALLOCATED ──deallocate──→ DEALLOCATING ──→ CLOSED
///      │                       │                                       ↑
///      └──────── rejected ─────┴──────────── died / forced ────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowState {
    Allocating,
    Allocated,
    Deallocating,
    Closed,
}

impl FlowState {
    #[must_use]
    pub fn can_transition_to(self, next: FlowState) -> bool {
        use FlowState::*;
        matches!(
            (self, next),
            (Allocating, Allocated)
                | (Allocating, Closed)
                | (Allocated, Deallocating)
                | (Allocated, Closed)
                | (Deallocating, Closed)
        )
    }
}

/// One allocated (or allocating) communication flow.
///
/// The owning process is referenced by id only; the registry guarantees it
/// exists and is not destroyed while the flow is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub port_id: PortId,
    pub process_id: ProcessId,
    /// Local application using the flow, when known.
    pub local_application: Option<ApplicationName>,
    pub remote_application: ApplicationName,
    pub state: FlowState,
}

// =============================================================================
// CLUSTER D: REGISTRATIONS
// =============================================================================

/// An application registered in one or more DIFs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRegistration {
    pub application: ApplicationName,
    pub difs: BTreeSet<DifName>,
}
