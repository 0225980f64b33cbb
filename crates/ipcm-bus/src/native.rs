//! # Native Runtime Ports
//!
//! Contracts between the IPC manager and the network-stack runtime it
//! supervises.
//!
//! ## Inbound (runtime → manager)
//!
//! - [`NativeEventSource`]: blocking retrieval of raw [`NativeEvent`] records.
//!
//! ## Outbound (manager → runtime)
//!
//! - [`NativeRuntime::issue`]: correlated action calls whose completion comes
//!   back later as a native event echoing the correlation id.
//! - [`NativeRuntime::notify`]: fire-and-forget notifications with no completion.
//!
//! Raw records use the runtime's conventions (integer result codes where 0 is
//! success, port id `-1` for "no port"). [`normalize`] turns them into the
//! typed [`Event`] set.

use std::time::Duration;

use ipcm_types::{
    ApplicationName, CorrelationId, DifName, Event, FlowRequest, IpcmError, NativeResult, PortId,
    ProcessId, ProcessSpec,
};
use thiserror::Error;

/// Errors raised by the native layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NativeError {
    /// The channel to the runtime is gone.
    #[error("Native runtime disconnected: {0}")]
    Disconnected(String),

    /// The runtime refused to accept a call.
    #[error("Native call {call} rejected: {reason}")]
    Rejected { call: &'static str, reason: String },

    /// A record could not be interpreted.
    #[error("Malformed native record: {0}")]
    Malformed(String),

    /// The queue feeding the runtime was closed.
    #[error("Native queue closed")]
    QueueClosed,
}

impl From<NativeError> for IpcmError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::Rejected { call, reason } => {
                IpcmError::Rejected(format!("{call}: {reason}"))
            }
            other => IpcmError::RuntimeAdapterFailure(other.to_string()),
        }
    }
}

/// Raw event records as delivered by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    IpcProcessCreateResult {
        sequence: u32,
        ipcp_id: u16,
        result: i32,
    },
    IpcProcessDestroyResult {
        sequence: u32,
        ipcp_id: u16,
        result: i32,
    },
    /// The daemon of an IPC process exited on its own.
    IpcProcessDaemonTerminated { ipcp_id: u16 },
    FlowRequestArrived {
        sequence: u32,
        ipcp_id: Option<u16>,
        local_application: ApplicationName,
        remote_application: ApplicationName,
        dif: Option<String>,
        port_id: i32,
        local_request: bool,
    },
    /// An IPC process answered an allocate-flow call.
    AllocateFlowRequestResult {
        sequence: u32,
        ipcp_id: u16,
        port_id: i32,
        result: i32,
    },
    /// An application accepted (0) or refused a flow offered to it.
    AllocateFlowResponse {
        sequence: u32,
        ipcp_id: Option<u16>,
        port_id: i32,
        result: i32,
    },
    FlowDeallocatedNotification {
        ipcp_id: Option<u16>,
        port_id: i32,
        code: i32,
    },
    DeallocateFlowResponse {
        sequence: u32,
        ipcp_id: u16,
        port_id: i32,
        result: i32,
    },
    ApplicationRegistrationRequest {
        application: ApplicationName,
        dif: Option<String>,
    },
    RegisterApplicationResponse {
        sequence: u32,
        ipcp_id: u16,
        application: ApplicationName,
        dif: String,
        result: i32,
    },
    UnregisterApplicationResponse {
        sequence: u32,
        ipcp_id: u16,
        application: ApplicationName,
        dif: String,
        result: i32,
    },
}

/// Correlated action calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCall {
    CreateIpcProcess(ProcessSpec),
    DestroyIpcProcess {
        process_id: ProcessId,
    },
    AllocateFlow {
        process_id: ProcessId,
        local_application: ApplicationName,
        remote_application: ApplicationName,
        dif: Option<DifName>,
    },
    /// Ask a local application whether it accepts a flow from a remote one.
    NotifyFlowRequest {
        process_id: ProcessId,
        port_id: PortId,
        local_application: ApplicationName,
        remote_application: ApplicationName,
    },
    DeallocateFlow {
        process_id: ProcessId,
        port_id: PortId,
    },
    RegisterApplication {
        process_id: ProcessId,
        application: ApplicationName,
        dif: DifName,
    },
    UnregisterApplication {
        process_id: ProcessId,
        application: ApplicationName,
        dif: DifName,
    },
}

impl NativeCall {
    /// Short name used in logs and errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            NativeCall::CreateIpcProcess(_) => "create_ipcp",
            NativeCall::DestroyIpcProcess { .. } => "destroy_ipcp",
            NativeCall::AllocateFlow { .. } => "allocate_flow",
            NativeCall::NotifyFlowRequest { .. } => "notify_flow_request",
            NativeCall::DeallocateFlow { .. } => "deallocate_flow",
            NativeCall::RegisterApplication { .. } => "register_app",
            NativeCall::UnregisterApplication { .. } => "unregister_app",
        }
    }
}

/// Fire-and-forget notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Tell an application the result of its flow request (`None` = failed).
    FlowAllocated {
        application: ApplicationName,
        remote_application: ApplicationName,
        port_id: Option<PortId>,
    },
    /// Tell an IPC process the outcome of a flow allocation it carried out.
    FlowAllocationResult {
        process_id: ProcessId,
        port_id: Option<PortId>,
        success: bool,
    },
    /// Tell an IPC process whether the local application took the flow.
    FlowAllocationResponse {
        process_id: ProcessId,
        port_id: PortId,
        accepted: bool,
    },
    /// Tell an application its flow is gone.
    FlowDeallocated {
        application: Option<ApplicationName>,
        port_id: PortId,
    },
    /// Tell an application the result of a registration it asked for.
    RegistrationResult {
        application: ApplicationName,
        dif: Option<DifName>,
        success: bool,
    },
}

/// Acknowledgement of an issued call; must echo the correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeAck {
    pub correlation_id: CorrelationId,
}

/// Blocking source of raw runtime events.
pub trait NativeEventSource: Send + Sync {
    /// Wait up to `timeout` for the next record.
    ///
    /// `Ok(None)` means the wait timed out with nothing to deliver.
    fn wait_event(&self, timeout: Duration) -> Result<Option<NativeEvent>, NativeError>;
}

/// Action primitives offered by the runtime.
pub trait NativeRuntime: Send + Sync {
    /// Issue a correlated call. Completion arrives later as an event.
    fn issue(&self, correlation_id: CorrelationId, call: NativeCall)
        -> Result<NativeAck, NativeError>;

    /// Send a notification that has no completion.
    fn notify(&self, notification: Notification) -> Result<(), NativeError>;
}

fn native_result(code: i32, what: &str) -> NativeResult {
    if code == 0 {
        Ok(())
    } else {
        Err(format!("{what} failed with code {code}"))
    }
}

fn required_port(raw: i32, what: &str) -> Result<PortId, NativeError> {
    PortId::from_native(raw)
        .ok_or_else(|| NativeError::Malformed(format!("{what} without a valid port id ({raw})")))
}

/// Translate a raw record into the typed event set.
///
/// Several raw kinds collapse into one event tag: both the IPC process's
/// allocate-flow result and an application's allocate-flow response complete
/// a flow allocation; a deallocate response and an unsolicited deallocation
/// both report a deallocated flow.
pub fn normalize(raw: NativeEvent) -> Result<Event, NativeError> {
    let event = match raw {
        NativeEvent::IpcProcessCreateResult {
            sequence,
            ipcp_id,
            result,
        } => Event::ProcessCreated {
            correlation_id: CorrelationId(sequence),
            process_id: ProcessId(ipcp_id),
            result: native_result(result, "create IPC process"),
        },
        NativeEvent::IpcProcessDestroyResult {
            sequence,
            ipcp_id,
            result,
        } => Event::ProcessTerminated {
            correlation_id: Some(CorrelationId(sequence)),
            process_id: ProcessId(ipcp_id),
            result: native_result(result, "destroy IPC process"),
        },
        NativeEvent::IpcProcessDaemonTerminated { ipcp_id } => Event::ProcessTerminated {
            correlation_id: None,
            process_id: ProcessId(ipcp_id),
            result: Ok(()),
        },
        NativeEvent::FlowRequestArrived {
            sequence,
            ipcp_id,
            local_application,
            remote_application,
            dif,
            port_id,
            local_request,
        } => {
            let port_id = PortId::from_native(port_id);
            let process_id = ipcp_id.map(ProcessId);
            if !local_request && (process_id.is_none() || port_id.is_none()) {
                return Err(NativeError::Malformed(format!(
                    "remote flow request {sequence} must name an IPC process and a port"
                )));
            }
            Event::FlowAllocationRequested(FlowRequest {
                sequence,
                local_application,
                remote_application,
                dif: dif.map(DifName),
                process_id,
                port_id,
                local: local_request,
            })
        }
        NativeEvent::AllocateFlowRequestResult {
            sequence,
            ipcp_id,
            port_id,
            result,
        } => {
            let port_id = PortId::from_native(port_id);
            let result = match (native_result(result, "allocate flow"), port_id) {
                (Ok(()), None) => Err("allocate flow granted without a port id".to_string()),
                (other, _) => other,
            };
            Event::FlowAllocationCompleted {
                correlation_id: CorrelationId(sequence),
                process_id: Some(ProcessId(ipcp_id)),
                port_id,
                result,
            }
        }
        NativeEvent::AllocateFlowResponse {
            sequence,
            ipcp_id,
            port_id,
            result,
        } => Event::FlowAllocationCompleted {
            correlation_id: CorrelationId(sequence),
            process_id: ipcp_id.map(ProcessId),
            port_id: PortId::from_native(port_id),
            result: native_result(result, "flow accept"),
        },
        NativeEvent::FlowDeallocatedNotification {
            ipcp_id,
            port_id,
            code,
        } => Event::FlowDeallocated {
            correlation_id: None,
            process_id: ipcp_id.map(ProcessId),
            port_id: required_port(port_id, "flow deallocation")?,
            result: native_result(code, "flow"),
        },
        NativeEvent::DeallocateFlowResponse {
            sequence,
            ipcp_id,
            port_id,
            result,
        } => Event::FlowDeallocated {
            correlation_id: Some(CorrelationId(sequence)),
            process_id: Some(ProcessId(ipcp_id)),
            port_id: required_port(port_id, "deallocate response")?,
            result: native_result(result, "deallocate flow"),
        },
        NativeEvent::ApplicationRegistrationRequest { application, dif } => {
            Event::RegistrationRequested {
                application,
                dif: dif.map(DifName),
            }
        }
        NativeEvent::RegisterApplicationResponse {
            sequence,
            ipcp_id,
            application,
            dif,
            result,
        } => Event::RegistrationCompleted {
            correlation_id: CorrelationId(sequence),
            process_id: ProcessId(ipcp_id),
            application,
            dif: DifName(dif),
            unregister: false,
            result: native_result(result, "register application"),
        },
        NativeEvent::UnregisterApplicationResponse {
            sequence,
            ipcp_id,
            application,
            dif,
            result,
        } => Event::RegistrationCompleted {
            correlation_id: CorrelationId(sequence),
            process_id: ProcessId(ipcp_id),
            application,
            dif: DifName(dif),
            unregister: true,
            result: native_result(result, "unregister application"),
        },
    };
    Ok(event)
}
