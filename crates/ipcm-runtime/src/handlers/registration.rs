//! Application registration in DIFs.

use ipcm_bus::{NativeCall, Notification};
use ipcm_core::{OperationKind, RequestContext, RequestOrigin};
use ipcm_types::{Event, IpcmError, IpcmResult, Outcome, Resolution};
use tracing::{info, warn};

use super::{expect_kind, log_event_flow, unexpected, ManagerCore};

pub(super) fn on_registration_requested(core: &ManagerCore, event: Event) -> IpcmResult<()> {
    let tag = event.tag();
    let Event::RegistrationRequested { application, dif } = event else {
        return Err(unexpected(tag));
    };
    log_event_flow(
        "RegistrationRequested",
        None,
        serde_json::json!({
            "application": application.to_string(),
            "dif": dif.as_ref().map(|d| d.0.clone()),
        }),
    );

    let requested = dif.or_else(|| core.config.dif_for(&application));
    let refuse = || {
        core.notify(Notification::RegistrationResult {
            application: application.clone(),
            dif: requested.clone(),
            success: false,
        });
    };

    let process = match core.registry.select_process(requested.as_ref()) {
        Ok(process) => process,
        Err(e) => {
            warn!(%application, error = %e, "[ipcm] Registration has no IPC process");
            refuse();
            return Ok(());
        }
    };
    let Some(dif) = requested.clone().or_else(|| process.dif.clone()) else {
        refuse();
        return Err(IpcmError::InvalidState(format!(
            "{} is not assigned to a DIF",
            process.id
        )));
    };

    let context = RequestContext::runtime()
        .with_process(process.id)
        .with_application(application.clone())
        .with_dif(Some(dif.clone()));
    let call = NativeCall::RegisterApplication {
        process_id: process.id,
        application: application.clone(),
        dif,
    };
    if let Err(e) = core.issue_call(OperationKind::RegisterApplication, context, call) {
        refuse();
        return Err(e);
    }
    Ok(())
}

pub(super) fn on_registration_completed(core: &ManagerCore, event: Event) -> IpcmResult<()> {
    let tag = event.tag();
    let Event::RegistrationCompleted {
        correlation_id,
        process_id,
        application,
        dif,
        unregister,
        result,
    } = event
    else {
        return Err(unexpected(tag));
    };
    let expected = if unregister {
        OperationKind::UnregisterApplication
    } else {
        OperationKind::RegisterApplication
    };
    let claim = expect_kind(core.correlator.claim(correlation_id)?, &[expected])?;
    log_event_flow(
        "RegistrationCompleted",
        Some(correlation_id),
        serde_json::json!({
            "process_id": process_id.0,
            "application": application.to_string(),
            "dif": dif.as_str(),
            "unregister": unregister,
            "success": result.is_ok(),
        }),
    );

    let updated = match result {
        Err(reason) => Err(IpcmError::Rejected(reason)),
        Ok(()) if unregister => core.registry.unregister_application(&application, &dif),
        Ok(()) => Ok(core.registry.register_application(&application, &dif)),
    };

    if claim.context().origin == RequestOrigin::Runtime {
        core.notify(Notification::RegistrationResult {
            application: application.clone(),
            dif: Some(dif.clone()),
            success: updated.is_ok(),
        });
    }

    match updated {
        Ok(registration) => {
            info!(%application, %dif, %process_id, unregister, "[ipcm] Registration updated");
            claim.complete(Outcome::Success(Resolution::Registration(registration)));
            Ok(())
        }
        Err(IpcmError::Rejected(reason)) => {
            warn!(%application, %dif, %reason, "[ipcm] Registration refused");
            claim.complete(Outcome::Failed(IpcmError::Rejected(reason)));
            Ok(())
        }
        Err(e) => {
            claim.complete(Outcome::Failed(e.clone()));
            Err(e)
        }
    }
}
