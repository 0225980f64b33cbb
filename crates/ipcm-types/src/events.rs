//! # Management-Plane Events
//!
//! The closed set of events the IPC manager reacts to. Native records from the
//! runtime are normalized into [`Event`] by the event source adapter; every
//! variant carries only what is needed to resolve it against the registry
//! and the correlator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entities::{ApplicationName, CorrelationId, DifName, PortId, ProcessId};

/// Result reported by the runtime for a completed operation.
pub type NativeResult = Result<(), String>;

/// A flow allocation request, coming either from a local application or from
/// a remote one through an IPC process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRequest {
    /// Sequence number chosen by the runtime for this request.
    pub sequence: u32,
    pub local_application: ApplicationName,
    pub remote_application: ApplicationName,
    /// DIF named by the requester, if any.
    pub dif: Option<DifName>,
    /// IPC process that received the request (remote requests only).
    pub process_id: Option<ProcessId>,
    /// Port already assigned by the IPC process (remote requests only).
    pub port_id: Option<PortId>,
    /// `true` when a local application asked for the flow.
    pub local: bool,
}

/// Every event the dispatcher can route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// The runtime finished creating an IPC process.
    ProcessCreated {
        correlation_id: CorrelationId,
        process_id: ProcessId,
        result: NativeResult,
    },

    /// An IPC process went away: either a confirmed teardown
    /// (`correlation_id` set) or an unsolicited termination.
    ProcessTerminated {
        correlation_id: Option<CorrelationId>,
        process_id: ProcessId,
        result: NativeResult,
    },

    /// An application wants a flow.
    FlowAllocationRequested(FlowRequest),

    /// A pending flow allocation finished (granted by an IPC process or
    /// accepted/refused by the target application).
    FlowAllocationCompleted {
        correlation_id: CorrelationId,
        process_id: Option<ProcessId>,
        port_id: Option<PortId>,
        result: NativeResult,
    },

    /// A flow is gone: either a confirmed deallocation (`correlation_id` set)
    /// or an unsolicited one.
    FlowDeallocated {
        correlation_id: Option<CorrelationId>,
        process_id: Option<ProcessId>,
        port_id: PortId,
        result: NativeResult,
    },

    /// An application asked to be registered in a DIF.
    RegistrationRequested {
        application: ApplicationName,
        dif: Option<DifName>,
    },

    /// An IPC process finished a registration or unregistration.
    RegistrationCompleted {
        correlation_id: CorrelationId,
        process_id: ProcessId,
        application: ApplicationName,
        dif: DifName,
        unregister: bool,
        result: NativeResult,
    },

    /// The runtime can no longer deliver events.
    Error { message: String },
}

/// Discriminant of [`Event`], used as the handler table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventTag {
    ProcessCreated,
    ProcessTerminated,
    FlowAllocationRequested,
    FlowAllocationCompleted,
    FlowDeallocated,
    RegistrationRequested,
    RegistrationCompleted,
    Error,
}

impl EventTag {
    /// All tags, in declaration order.
    pub const ALL: [EventTag; 8] = [
        EventTag::ProcessCreated,
        EventTag::ProcessTerminated,
        EventTag::FlowAllocationRequested,
        EventTag::FlowAllocationCompleted,
        EventTag::FlowDeallocated,
        EventTag::RegistrationRequested,
        EventTag::RegistrationCompleted,
        EventTag::Error,
    ];
}

impl Event {
    #[must_use]
    pub fn tag(&self) -> EventTag {
        match self {
            Event::ProcessCreated { .. } => EventTag::ProcessCreated,
            Event::ProcessTerminated { .. } => EventTag::ProcessTerminated,
            Event::FlowAllocationRequested(_) => EventTag::FlowAllocationRequested,
            Event::FlowAllocationCompleted { .. } => EventTag::FlowAllocationCompleted,
            Event::FlowDeallocated { .. } => EventTag::FlowDeallocated,
            Event::RegistrationRequested { .. } => EventTag::RegistrationRequested,
            Event::RegistrationCompleted { .. } => EventTag::RegistrationCompleted,
            Event::Error { .. } => EventTag::Error,
        }
    }

    /// The IPC process this event concerns, if it names one.
    #[must_use]
    pub fn process_id(&self) -> Option<ProcessId> {
        match self {
            Event::ProcessCreated { process_id, .. }
            | Event::ProcessTerminated { process_id, .. }
            | Event::RegistrationCompleted { process_id, .. } => Some(*process_id),
            Event::FlowAllocationRequested(request) => request.process_id,
            Event::FlowAllocationCompleted { process_id, .. }
            | Event::FlowDeallocated { process_id, .. } => *process_id,
            Event::RegistrationRequested { .. } | Event::Error { .. } => None,
        }
    }

    /// The port this event concerns, if it names one.
    #[must_use]
    pub fn port_id(&self) -> Option<PortId> {
        match self {
            Event::FlowAllocationRequested(request) => request.port_id,
            Event::FlowAllocationCompleted { port_id, .. } => *port_id,
            Event::FlowDeallocated { port_id, .. } => Some(*port_id),
            _ => None,
        }
    }

    /// The application this event concerns, if it names one.
    #[must_use]
    pub fn application(&self) -> Option<&ApplicationName> {
        match self {
            Event::FlowAllocationRequested(request) => Some(&request.local_application),
            Event::RegistrationRequested { application, .. }
            | Event::RegistrationCompleted { application, .. } => Some(application),
            _ => None,
        }
    }

    /// Correlation id of the pending request this event completes, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Event::ProcessCreated { correlation_id, .. }
            | Event::FlowAllocationCompleted { correlation_id, .. }
            | Event::RegistrationCompleted { correlation_id, .. } => Some(*correlation_id),
            Event::ProcessTerminated { correlation_id, .. }
            | Event::FlowDeallocated { correlation_id, .. } => *correlation_id,
            _ => None,
        }
    }
}

/// The entity used to serialize handling of events that concern it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderingKey {
    Process(ProcessId),
    Port(PortId),
    Application(ApplicationName),
    /// Events about the runtime itself.
    Runtime,
}

impl fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderingKey::Process(id) => write!(f, "{id}"),
            OrderingKey::Port(port) => write!(f, "{port}"),
            OrderingKey::Application(app) => write!(f, "app:{app}"),
            OrderingKey::Runtime => f.write_str("runtime"),
        }
    }
}
