//! # Event Handlers
//!
//! One handler per event tag, all sharing a [`ManagerCore`].
//!
//! ## Completion Flow
//!
//! ```text
//! facade / handler ──issue(kind, ctx)──→ Correlator ──ticket id──→ NativeRuntime::issue
//!                                                                        │
//!                          native completion echoing the id ←────────────┘
//!                                        │
//!               handler ──claim(id)──→ registry update ──→ Claim::complete(outcome)
//!                                                                │
//!                               waiting caller (if any) ←────────┘
//! ```
//!
//! Requests issued by handlers on the runtime's behalf have nobody waiting;
//! their result goes back to the application as a notification instead.

mod flow;
mod process;
mod registration;

use std::sync::Arc;

use ipcm_bus::{EventSourceAdapter, NativeCall, NativeRuntime, Notification};
use ipcm_core::{Claim, Correlator, EntityRegistry, OperationKind, RequestContext, Ticket};
use ipcm_types::{CorrelationId, Event, EventTag, FlowRecord, IpcmError, IpcmResult, Outcome};
use tracing::{debug, error, warn};

use crate::config::ManagerConfig;
use crate::manager::Lifecycle;
use crate::router::{EventHandler, HandlerTableBuilder};

/// Services shared by the facade and every handler.
pub struct ManagerCore {
    pub(crate) registry: Arc<EntityRegistry>,
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) native: Arc<dyn NativeRuntime>,
    pub(crate) source: Arc<EventSourceAdapter>,
    pub(crate) config: Arc<ManagerConfig>,
    pub(crate) lifecycle: Arc<Lifecycle>,
}

impl ManagerCore {
    /// Send `call` to the runtime under `ticket`'s correlation id.
    ///
    /// # Errors
    ///
    /// - `Rejected` if the runtime refused the call
    /// - `RuntimeAdapterFailure` if the call failed or the ack did not echo the id
    pub(crate) fn call_native(&self, ticket: &Ticket, call: NativeCall) -> IpcmResult<()> {
        let kind = call.kind();
        let ack = self.native.issue(ticket.id(), call).map_err(|e| {
            warn!(call = kind, correlation_id = %ticket.id(), error = %e, "[ipcm] Native call failed");
            IpcmError::from(e)
        })?;
        if ack.correlation_id != ticket.id() {
            error!(
                call = kind,
                expected = %ticket.id(),
                received = %ack.correlation_id,
                "[ipcm] Native ack does not echo the correlation id"
            );
            return Err(IpcmError::RuntimeAdapterFailure(format!(
                "{kind} acknowledged as {} instead of {}",
                ack.correlation_id,
                ticket.id()
            )));
        }
        Ok(())
    }

    /// Register a pending request and send its native call. If the call
    /// fails the request is withdrawn before returning the error.
    pub(crate) fn issue_call(
        &self,
        kind: OperationKind,
        context: RequestContext,
        call: NativeCall,
    ) -> IpcmResult<Ticket> {
        let ticket = self.correlator.issue(kind, context);
        match self.call_native(&ticket, call) {
            Ok(()) => Ok(ticket),
            Err(e) => {
                self.withdraw(ticket.id(), &e);
                Err(e)
            }
        }
    }

    fn withdraw(&self, id: CorrelationId, err: &IpcmError) {
        if let Ok(claim) = self.correlator.claim(id) {
            claim.complete(Outcome::Failed(err.clone()));
        }
    }

    /// Best-effort notification; failures are logged.
    pub(crate) fn notify(&self, notification: Notification) {
        if let Err(e) = self.native.notify(notification) {
            warn!(error = %e, "[ipcm] Notification not delivered");
        }
    }

    /// Tell the applications of `flows` that their flows are gone.
    pub(crate) fn notify_closed(&self, flows: &[FlowRecord]) {
        for flow in flows {
            self.notify(Notification::FlowDeallocated {
                application: flow.local_application.clone(),
                port_id: flow.port_id,
            });
        }
    }

    /// The runtime can no longer be trusted: stop reading and fail every
    /// pending request.
    pub(crate) fn escalate(&self, message: &str) {
        let stopping = self.lifecycle.begin_stopping();
        self.source.request_shutdown();
        let failed = self.correlator.cancel_all(&Outcome::Failed(
            IpcmError::RuntimeAdapterFailure(message.to_string()),
        ));
        error!(
            reason = message,
            failed_requests = failed,
            stopping,
            "[ipcm] Runtime adapter failure, manager stopping"
        );
    }
}

/// Reject a claim whose request kind does not match the completion.
fn expect_kind(claim: Claim, expected: &[OperationKind]) -> IpcmResult<Claim> {
    if expected.contains(&claim.kind()) {
        return Ok(claim);
    }
    let err = IpcmError::InvalidState(format!(
        "{} is a {} request, expected {:?}",
        claim.correlation_id(),
        claim.kind(),
        expected
    ));
    claim.complete(Outcome::Failed(err.clone()));
    Err(err)
}

fn unexpected(tag: EventTag) -> IpcmError {
    IpcmError::InvalidState(format!("handler received {tag:?} event"))
}

/// Structured event-flow line, one per handled event.
fn log_event_flow(event_type: &str, correlation_id: Option<CorrelationId>, metadata: serde_json::Value) {
    debug!(
        "EVENT_FLOW_JSON {}",
        serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            "component": "ipcm",
            "event_type": event_type,
            "correlation_id": correlation_id.map(|id| id.0),
            "metadata": metadata,
        })
    );
}

fn bind(
    core: &Arc<ManagerCore>,
    handler: fn(&ManagerCore, Event) -> IpcmResult<()>,
) -> impl EventHandler + 'static {
    let core = Arc::clone(core);
    move |event: Event| handler(&core, event)
}

/// Handler table covering every event tag.
#[must_use]
pub fn default_handlers(core: &Arc<ManagerCore>) -> HandlerTableBuilder {
    crate::router::HandlerTable::builder()
        .on(EventTag::ProcessCreated, bind(core, process::on_process_created))
        .on(EventTag::ProcessTerminated, bind(core, process::on_process_terminated))
        .on(EventTag::FlowAllocationRequested, bind(core, flow::on_flow_requested))
        .on(EventTag::FlowAllocationCompleted, bind(core, flow::on_flow_completed))
        .on(EventTag::FlowDeallocated, bind(core, flow::on_flow_deallocated))
        .on(EventTag::RegistrationRequested, bind(core, registration::on_registration_requested))
        .on(EventTag::RegistrationCompleted, bind(core, registration::on_registration_completed))
        .on(EventTag::Error, bind(core, on_error))
}

fn on_error(core: &ManagerCore, event: Event) -> IpcmResult<()> {
    let tag = event.tag();
    let Event::Error { message } = event else {
        return Err(unexpected(tag));
    };
    log_event_flow("RuntimeError", None, serde_json::json!({ "message": message }));
    core.escalate(&message);
    Ok(())
}
