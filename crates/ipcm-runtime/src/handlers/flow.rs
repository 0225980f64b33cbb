//! # Flow Handlers
//!
//! ## Local request (an application here wants a flow)
//!
//! ```text
//! FlowAllocationRequested(local) → pick IPC process by DIF → AllocateFlow call
//! FlowAllocationCompleted        → record ALLOCATED flow → FlowAllocated(port) to app
//! ```
//!
//! ## Remote request (a peer wants a flow to an application here)
//!
//! ```text
//! FlowAllocationRequested(remote) → reserve port (ALLOCATING) → NotifyFlowRequest call
//! FlowAllocationCompleted         → ALLOCATED or closed → FlowAllocationResponse to IPC process
//! ```

use ipcm_bus::{NativeCall, Notification};
use ipcm_core::{Claim, OperationKind, RequestContext, RequestOrigin};
use ipcm_types::{
    Event, FlowRecord, FlowRequest, IpcmError, IpcmResult, NativeResult, Outcome, PortId,
    ProcessId, Resolution,
};
use tracing::{debug, info, warn};

use super::{expect_kind, log_event_flow, unexpected, ManagerCore};

pub(super) fn on_flow_requested(core: &ManagerCore, event: Event) -> IpcmResult<()> {
    let tag = event.tag();
    let Event::FlowAllocationRequested(request) = event else {
        return Err(unexpected(tag));
    };
    log_event_flow(
        "FlowAllocationRequested",
        None,
        serde_json::json!({
            "sequence": request.sequence,
            "local": request.local,
            "local_application": request.local_application.to_string(),
            "remote_application": request.remote_application.to_string(),
        }),
    );

    if request.local {
        allocate_for_local(core, request)
    } else {
        offer_to_local(core, request)
    }
}

fn allocate_for_local(core: &ManagerCore, request: FlowRequest) -> IpcmResult<()> {
    let FlowRequest {
        local_application,
        remote_application,
        dif,
        ..
    } = request;
    let dif = core.config.dif_for(&local_application).or(dif);
    let refuse = |core: &ManagerCore| {
        core.notify(Notification::FlowAllocated {
            application: local_application.clone(),
            remote_application: remote_application.clone(),
            port_id: None,
        });
    };

    let process = match core.registry.select_process(dif.as_ref()) {
        Ok(process) => process,
        Err(e) => {
            warn!(
                application = %local_application,
                error = %e,
                "[ipcm] No IPC process for flow request"
            );
            refuse(core);
            return Ok(());
        }
    };

    let context = RequestContext::runtime()
        .with_process(process.id)
        .with_application(local_application.clone())
        .with_remote(remote_application.clone())
        .with_dif(dif.clone());
    let call = NativeCall::AllocateFlow {
        process_id: process.id,
        local_application: local_application.clone(),
        remote_application: remote_application.clone(),
        dif,
    };
    match core.issue_call(OperationKind::AllocateFlow, context, call) {
        Ok(ticket) => {
            debug!(
                correlation_id = %ticket.id(),
                process_id = %process.id,
                application = %local_application,
                "[ipcm] Flow allocation forwarded"
            );
            Ok(())
        }
        Err(e) => {
            refuse(core);
            Err(e)
        }
    }
}

fn offer_to_local(core: &ManagerCore, request: FlowRequest) -> IpcmResult<()> {
    let (Some(process_id), Some(port_id)) = (request.process_id, request.port_id) else {
        return Err(IpcmError::InvalidState(format!(
            "remote flow request {} names no IPC process or port",
            request.sequence
        )));
    };
    let refuse = |core: &ManagerCore| {
        core.notify(Notification::FlowAllocationResponse {
            process_id,
            port_id,
            accepted: false,
        });
    };

    if let Err(e) = core.registry.reserve_flow(
        process_id,
        port_id,
        Some(request.local_application.clone()),
        request.remote_application.clone(),
    ) {
        refuse(core);
        return Err(e);
    }

    let context = RequestContext::runtime()
        .with_process(process_id)
        .with_port(port_id)
        .with_application(request.local_application.clone())
        .with_remote(request.remote_application.clone())
        .with_dif(request.dif);
    let call = NativeCall::NotifyFlowRequest {
        process_id,
        port_id,
        local_application: request.local_application,
        remote_application: request.remote_application,
    };
    if let Err(e) = core.issue_call(OperationKind::AcceptFlow, context, call) {
        let _ = core.registry.close_flow(port_id);
        refuse(core);
        return Err(e);
    }
    Ok(())
}

pub(super) fn on_flow_completed(core: &ManagerCore, event: Event) -> IpcmResult<()> {
    let tag = event.tag();
    let Event::FlowAllocationCompleted {
        correlation_id,
        process_id,
        port_id,
        result,
    } = event
    else {
        return Err(unexpected(tag));
    };
    let claim = expect_kind(
        core.correlator.claim(correlation_id)?,
        &[OperationKind::AllocateFlow, OperationKind::AcceptFlow],
    )?;
    log_event_flow(
        "FlowAllocationCompleted",
        Some(correlation_id),
        serde_json::json!({
            "kind": claim.kind().to_string(),
            "port_id": port_id.map(|p| p.0),
            "success": result.is_ok(),
        }),
    );

    if claim.kind() == OperationKind::AllocateFlow {
        complete_allocation(core, claim, process_id, port_id, result)
    } else {
        complete_accept(core, claim, port_id, result)
    }
}

fn complete_allocation(
    core: &ManagerCore,
    claim: Claim,
    process_id: Option<ProcessId>,
    port_id: Option<PortId>,
    result: NativeResult,
) -> IpcmResult<()> {
    let context = claim.context().clone();
    let recorded: IpcmResult<FlowRecord> = (|| {
        result.map_err(IpcmError::Rejected)?;
        let port_id = port_id
            .ok_or_else(|| IpcmError::InvalidState("flow granted without a port".into()))?;
        let process_id = process_id.or(context.process_id).ok_or_else(|| {
            IpcmError::InvalidState(format!("{port_id} granted by no IPC process"))
        })?;
        let remote = context.remote_application.clone().ok_or_else(|| {
            IpcmError::InvalidState(format!("{port_id} has no remote application"))
        })?;
        core.registry
            .allocate_flow(process_id, port_id, context.application.clone(), remote)
    })();

    // The IPC process hears the result before the application does.
    if let Some(process_id) = process_id.or(context.process_id) {
        core.notify(Notification::FlowAllocationResult {
            process_id,
            port_id,
            success: recorded.is_ok(),
        });
    }
    if context.origin == RequestOrigin::Runtime {
        if let (Some(application), Some(remote)) =
            (context.application.clone(), context.remote_application.clone())
        {
            core.notify(Notification::FlowAllocated {
                application,
                remote_application: remote,
                port_id: recorded.as_ref().ok().map(|flow| flow.port_id),
            });
        }
    }

    match recorded {
        Ok(flow) => {
            info!(
                port_id = %flow.port_id,
                process_id = %flow.process_id,
                remote = %flow.remote_application,
                "[ipcm] Flow allocated"
            );
            claim.complete(Outcome::Success(Resolution::Flow(flow)));
            Ok(())
        }
        Err(IpcmError::Rejected(reason)) => {
            warn!(%reason, "[ipcm] Flow allocation refused by IPC process");
            claim.complete(Outcome::Failed(IpcmError::Rejected(reason)));
            Ok(())
        }
        Err(e) => {
            claim.complete(Outcome::Failed(e.clone()));
            Err(e)
        }
    }
}

fn complete_accept(
    core: &ManagerCore,
    claim: Claim,
    port_id: Option<PortId>,
    result: NativeResult,
) -> IpcmResult<()> {
    let context = claim.context().clone();
    let (Some(process_id), Some(port_id)) = (context.process_id, context.port_id.or(port_id))
    else {
        let err = IpcmError::InvalidState(format!(
            "{} accept completion without process or port",
            claim.correlation_id()
        ));
        claim.complete(Outcome::Failed(err.clone()));
        return Err(err);
    };
    let respond = |accepted: bool| {
        core.notify(Notification::FlowAllocationResponse {
            process_id,
            port_id,
            accepted,
        });
    };

    if let Err(reason) = result {
        let _ = core.registry.close_flow(port_id);
        respond(false);
        info!(%port_id, %reason, "[ipcm] Application declined flow");
        claim.complete(Outcome::Failed(IpcmError::Rejected(reason)));
        return Ok(());
    }

    match core.registry.confirm_flow(port_id) {
        Ok(flow) => {
            respond(true);
            info!(%port_id, %process_id, "[ipcm] Incoming flow accepted");
            claim.complete(Outcome::Success(Resolution::Flow(flow)));
            Ok(())
        }
        Err(e) => {
            respond(false);
            claim.complete(Outcome::Failed(e.clone()));
            Err(e)
        }
    }
}

pub(super) fn on_flow_deallocated(core: &ManagerCore, event: Event) -> IpcmResult<()> {
    let tag = event.tag();
    let Event::FlowDeallocated {
        correlation_id,
        port_id,
        result,
        ..
    } = event
    else {
        return Err(unexpected(tag));
    };
    log_event_flow(
        "FlowDeallocated",
        correlation_id,
        serde_json::json!({ "port_id": port_id.0, "success": result.is_ok() }),
    );

    let Some(correlation_id) = correlation_id else {
        let flow = core.registry.close_flow(port_id)?;
        if let Err(reason) = &result {
            warn!(%port_id, %reason, "[ipcm] Flow lost");
        } else {
            info!(%port_id, "[ipcm] Flow deallocated by peer");
        }
        core.notify_closed(&[flow]);
        return Ok(());
    };

    let claim = expect_kind(
        core.correlator.claim(correlation_id)?,
        &[OperationKind::DeallocateFlow],
    )?;
    if let Err(reason) = result {
        // Left DEALLOCATING; deallocate may be retried.
        warn!(%port_id, %reason, "[ipcm] Flow deallocation failed");
        claim.complete(Outcome::Failed(IpcmError::Rejected(reason)));
        return Ok(());
    }
    match core.registry.close_flow(port_id) {
        Ok(flow) => {
            info!(%port_id, "[ipcm] Flow deallocated");
            claim.complete(Outcome::Success(Resolution::Flow(flow)));
            Ok(())
        }
        Err(e) => {
            claim.complete(Outcome::Failed(e.clone()));
            Err(e)
        }
    }
}
