//! IPC process lifecycle completions.
//!
//! ```text
//! CREATING ──ProcessCreated(ok)────→ ACTIVE
//!    └──────ProcessCreated(failed)──→ discarded
//! TERMINATING ──ProcessTerminated(ok)──→ DESTROYED (flows closed)
//! any ──ProcessTerminated(unsolicited)──→ DESTROYED, dependent requests failed
//! ```

use ipcm_core::OperationKind;
use ipcm_types::{Event, IpcmError, IpcmResult, Outcome, Resolution};
use tracing::{info, warn};

use super::{expect_kind, log_event_flow, unexpected, ManagerCore};

pub(super) fn on_process_created(core: &ManagerCore, event: Event) -> IpcmResult<()> {
    let tag = event.tag();
    let Event::ProcessCreated {
        correlation_id,
        process_id,
        result,
    } = event
    else {
        return Err(unexpected(tag));
    };
    let claim = expect_kind(
        core.correlator.claim(correlation_id)?,
        &[OperationKind::CreateProcess],
    )?;
    log_event_flow(
        "ProcessCreated",
        Some(correlation_id),
        serde_json::json!({ "process_id": process_id.0, "success": result.is_ok() }),
    );

    if let Err(reason) = result {
        core.registry.discard_process(process_id);
        warn!(%process_id, %reason, "[ipcm] IPC process creation failed");
        claim.complete(Outcome::Failed(IpcmError::Rejected(reason)));
        return Ok(());
    }

    match core.registry.activate_process(process_id) {
        Ok(handle) => {
            info!(%process_id, dif = ?handle.dif, "[ipcm] IPC process active");
            claim.complete(Outcome::Success(Resolution::Process(handle)));
            Ok(())
        }
        Err(e) => {
            claim.complete(Outcome::Failed(e.clone()));
            Err(e)
        }
    }
}

pub(super) fn on_process_terminated(core: &ManagerCore, event: Event) -> IpcmResult<()> {
    let tag = event.tag();
    let Event::ProcessTerminated {
        correlation_id,
        process_id,
        result,
    } = event
    else {
        return Err(unexpected(tag));
    };
    log_event_flow(
        "ProcessTerminated",
        correlation_id,
        serde_json::json!({ "process_id": process_id.0, "success": result.is_ok() }),
    );

    let Some(correlation_id) = correlation_id else {
        // The daemon died on its own.
        let closed = core.registry.destroy_process(process_id, true)?;
        warn!(%process_id, closed_flows = closed.len(), "[ipcm] IPC process terminated unexpectedly");
        core.notify_closed(&closed);

        let destroyed = core.correlator.fail_where(
            |r| r.context.references(process_id) && r.kind == OperationKind::DestroyProcess,
            &Outcome::Success(Resolution::Done),
        );
        let failed = core.correlator.fail_where(
            |r| r.context.references(process_id),
            &Outcome::Failed(IpcmError::UnknownEntity(process_id)),
        );
        if destroyed + failed > 0 {
            info!(%process_id, destroyed, failed, "[ipcm] Resolved requests of terminated process");
        }
        return Ok(());
    };

    let claim = expect_kind(
        core.correlator.claim(correlation_id)?,
        &[OperationKind::DestroyProcess],
    )?;
    if let Err(reason) = result {
        // Still TERMINATING; a later destroy may retry.
        warn!(%process_id, %reason, "[ipcm] IPC process destruction failed");
        claim.complete(Outcome::Failed(IpcmError::Rejected(reason)));
        return Ok(());
    }

    match core.registry.destroy_process(process_id, true) {
        Ok(closed) => {
            info!(%process_id, closed_flows = closed.len(), "[ipcm] IPC process destroyed");
            core.notify_closed(&closed);
            claim.complete(Outcome::Success(Resolution::Done));
            Ok(())
        }
        Err(e) => {
            claim.complete(Outcome::Failed(e.clone()));
            Err(e)
        }
    }
}
