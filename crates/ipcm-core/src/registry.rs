//! # Entity Registry
//!
//! In-memory directory of the IPC processes the manager supervises, the flows
//! each one owns, and the application registrations it brokered.
//!
//! ## Locking
//!
//! ```text
//! processes: RwLock<HashMap<ProcessId, Arc<Mutex<ProcessEntry>>>>   (short-held)
//!                                         │
//!                                         └─ per-process Mutex     (all mutations)
//! ports:     Mutex<HashMap<PortId, ProcessId>>                     (port uniqueness)
//! ```
//!
//! Lock order is always: process map, process entry, port index. The map lock
//! is held in write mode only to insert or remove a top-level entry, so
//! mutations of different processes never serialize on one another.
//!
//! ## Invariants
//!
//! - One handle per process id.
//! - A port id maps to at most one non-closed flow.
//! - A flow never outlives its owning process: destroying a process closes
//!   all of its flows in the same critical section.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use ipcm_types::{
    ApplicationName, ApplicationRegistration, DifName, FlowRecord, FlowState, IpcProcessHandle,
    IpcmError, IpcmResult, PortId, ProcessId, ProcessSpec, ProcessState,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

struct ProcessEntry {
    handle: IpcProcessHandle,
    flows: BTreeMap<PortId, FlowRecord>,
}

impl ProcessEntry {
    fn open_flows(&self) -> usize {
        self.flows.len()
    }

    fn transition(&mut self, next: ProcessState) -> IpcmResult<()> {
        let current = self.handle.state;
        if !current.can_transition_to(next) {
            return Err(IpcmError::InvalidState(format!(
                "{} cannot move from {:?} to {:?}",
                self.handle.id, current, next
            )));
        }
        self.handle.state = next;
        Ok(())
    }
}

/// Owned, constructor-injected registry of IPC processes and flows.
#[derive(Default)]
pub struct EntityRegistry {
    processes: RwLock<HashMap<ProcessId, Arc<Mutex<ProcessEntry>>>>,
    ports: Mutex<HashMap<PortId, ProcessId>>,
    registrations: RwLock<BTreeMap<ApplicationName, BTreeSet<DifName>>>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: ProcessId) -> IpcmResult<Arc<Mutex<ProcessEntry>>> {
        self.processes
            .read()
            .get(&id)
            .cloned()
            .ok_or(IpcmError::UnknownEntity(id))
    }

    // =========================================================================
    // IPC PROCESSES
    // =========================================================================

    /// Register a new process in `CREATING` state.
    ///
    /// # Errors
    ///
    /// `DuplicateEntity` if the id is already known.
    pub fn create_process(&self, spec: &ProcessSpec) -> IpcmResult<IpcProcessHandle> {
        let mut processes = self.processes.write();
        if processes.contains_key(&spec.id) {
            return Err(IpcmError::DuplicateEntity(spec.id));
        }
        let handle = IpcProcessHandle::from_spec(spec);
        processes.insert(
            spec.id,
            Arc::new(Mutex::new(ProcessEntry {
                handle: handle.clone(),
                flows: BTreeMap::new(),
            })),
        );
        debug!(process_id = %spec.id, "[registry] Process registered (creating)");
        Ok(handle)
    }

    /// Mark a process whose creation the runtime confirmed as `ACTIVE`.
    pub fn activate_process(&self, id: ProcessId) -> IpcmResult<IpcProcessHandle> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        entry.transition(ProcessState::Active)?;
        info!(process_id = %id, "[registry] Process active");
        Ok(entry.handle.clone())
    }

    /// Move an `ACTIVE` process to `TERMINATING` ahead of a destroy call.
    ///
    /// A process already terminating is returned unchanged.
    ///
    /// # Errors
    ///
    /// `EntityBusy` if the process still owns flows and `force` is false.
    pub fn begin_teardown(&self, id: ProcessId, force: bool) -> IpcmResult<IpcProcessHandle> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        if entry.handle.state == ProcessState::Terminating {
            return Ok(entry.handle.clone());
        }
        if !force && entry.open_flows() > 0 {
            return Err(IpcmError::EntityBusy {
                process_id: id,
                open_flows: entry.open_flows(),
            });
        }
        entry.transition(ProcessState::Terminating)?;
        Ok(entry.handle.clone())
    }

    /// Remove a process. With `force`, its flows are closed first.
    ///
    /// Returns the flows that were closed by the cascade.
    ///
    /// # Errors
    ///
    /// - `UnknownEntity` if the id is absent
    /// - `EntityBusy` if flows remain and `force` is false
    pub fn destroy_process(&self, id: ProcessId, force: bool) -> IpcmResult<Vec<FlowRecord>> {
        let mut processes = self.processes.write();
        let entry = processes
            .get(&id)
            .cloned()
            .ok_or(IpcmError::UnknownEntity(id))?;
        let mut entry = entry.lock();

        if !force && entry.open_flows() > 0 {
            return Err(IpcmError::EntityBusy {
                process_id: id,
                open_flows: entry.open_flows(),
            });
        }

        let closed = {
            let mut ports = self.ports.lock();
            let flows = std::mem::take(&mut entry.flows);
            flows
                .into_values()
                .map(|mut flow| {
                    ports.remove(&flow.port_id);
                    flow.state = FlowState::Closed;
                    flow
                })
                .collect::<Vec<_>>()
        };
        entry.handle.ports.clear();
        entry.handle.state = ProcessState::Destroyed;
        processes.remove(&id);

        if closed.is_empty() {
            info!(process_id = %id, "[registry] Process destroyed");
        } else {
            warn!(
                process_id = %id,
                closed_flows = closed.len(),
                "[registry] Process destroyed, flows closed"
            );
        }
        Ok(closed)
    }

    /// Drop a process whose creation failed. Returns the discarded handle.
    pub fn discard_process(&self, id: ProcessId) -> Option<IpcProcessHandle> {
        let mut processes = self.processes.write();
        let entry = processes.get(&id)?.clone();
        let mut entry = entry.lock();
        if entry.handle.state != ProcessState::Creating {
            return None;
        }
        entry.handle.state = ProcessState::Destroyed;
        processes.remove(&id);
        debug!(process_id = %id, "[registry] Process discarded");
        Some(entry.handle.clone())
    }

    /// Snapshot of one process.
    #[must_use]
    pub fn lookup(&self, id: ProcessId) -> Option<IpcProcessHandle> {
        let entry = self.processes.read().get(&id).cloned()?;
        let handle = entry.lock().handle.clone();
        Some(handle)
    }

    /// Snapshots of every known process, ordered by id.
    #[must_use]
    pub fn list_processes(&self) -> Vec<IpcProcessHandle> {
        let entries: Vec<_> = self.processes.read().values().cloned().collect();
        let mut handles: Vec<_> = entries.iter().map(|e| e.lock().handle.clone()).collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.processes.read().len()
    }

    /// First `ACTIVE` process serving `dif`, or any `ACTIVE` process when
    /// `dif` is `None`. Lowest id wins.
    pub fn select_process(&self, dif: Option<&DifName>) -> IpcmResult<IpcProcessHandle> {
        self.list_processes()
            .into_iter()
            .find(|h| h.is_active() && dif.map_or(true, |d| h.serves(d)))
            .ok_or_else(|| IpcmError::NoProcessAvailable {
                dif: dif.map(|d| d.0.clone()),
            })
    }

    // =========================================================================
    // FLOWS
    // =========================================================================

    fn insert_flow(
        &self,
        process_id: ProcessId,
        port_id: PortId,
        local_application: Option<ApplicationName>,
        remote_application: ApplicationName,
        state: FlowState,
    ) -> IpcmResult<FlowRecord> {
        let entry = self.entry(process_id)?;
        let mut entry = entry.lock();
        if !entry.handle.is_active() {
            return Err(IpcmError::InvalidState(format!(
                "{process_id} is {:?}, flows need an active process",
                entry.handle.state
            )));
        }

        let mut ports = self.ports.lock();
        if let Some(owner) = ports.get(&port_id) {
            return Err(IpcmError::DuplicatePort {
                port_id,
                owner: *owner,
            });
        }
        let record = FlowRecord {
            port_id,
            process_id,
            local_application,
            remote_application,
            state,
        };
        ports.insert(port_id, process_id);
        drop(ports);

        entry.flows.insert(port_id, record.clone());
        entry.handle.ports.insert(port_id);
        debug!(%process_id, %port_id, ?state, "[registry] Flow added");
        Ok(record)
    }

    /// Record a flow the runtime already allocated (`ALLOCATED`).
    ///
    /// # Errors
    ///
    /// - `UnknownEntity` if the process is absent
    /// - `DuplicatePort` if the port is in use; the existing record is untouched
    pub fn allocate_flow(
        &self,
        process_id: ProcessId,
        port_id: PortId,
        local_application: Option<ApplicationName>,
        remote_application: ApplicationName,
    ) -> IpcmResult<FlowRecord> {
        self.insert_flow(
            process_id,
            port_id,
            local_application,
            remote_application,
            FlowState::Allocated,
        )
    }

    /// Record a flow awaiting the local application's answer (`ALLOCATING`).
    pub fn reserve_flow(
        &self,
        process_id: ProcessId,
        port_id: PortId,
        local_application: Option<ApplicationName>,
        remote_application: ApplicationName,
    ) -> IpcmResult<FlowRecord> {
        self.insert_flow(
            process_id,
            port_id,
            local_application,
            remote_application,
            FlowState::Allocating,
        )
    }

    fn update_flow(&self, port_id: PortId, next: FlowState) -> IpcmResult<FlowRecord> {
        let owner = self.owner_of(port_id).ok_or(IpcmError::UnknownPort(port_id))?;
        let entry = self.entry(owner)?;
        let mut entry = entry.lock();
        let flow = entry
            .flows
            .get_mut(&port_id)
            .ok_or(IpcmError::UnknownPort(port_id))?;
        if !flow.state.can_transition_to(next) {
            return Err(IpcmError::InvalidState(format!(
                "{port_id} cannot move from {:?} to {:?}",
                flow.state, next
            )));
        }
        flow.state = next;
        Ok(flow.clone())
    }

    /// `ALLOCATING` → `ALLOCATED`.
    pub fn confirm_flow(&self, port_id: PortId) -> IpcmResult<FlowRecord> {
        self.update_flow(port_id, FlowState::Allocated)
    }

    /// `ALLOCATED` → `DEALLOCATING`.
    pub fn begin_deallocation(&self, port_id: PortId) -> IpcmResult<FlowRecord> {
        self.update_flow(port_id, FlowState::Deallocating)
    }

    /// Close a flow and free its port id. Returns the closed record.
    pub fn close_flow(&self, port_id: PortId) -> IpcmResult<FlowRecord> {
        let owner = self.owner_of(port_id).ok_or(IpcmError::UnknownPort(port_id))?;
        let entry = self.entry(owner)?;
        let mut entry = entry.lock();
        let mut flow = entry
            .flows
            .remove(&port_id)
            .ok_or(IpcmError::UnknownPort(port_id))?;
        entry.handle.ports.remove(&port_id);
        self.ports.lock().remove(&port_id);
        flow.state = FlowState::Closed;
        debug!(process_id = %owner, %port_id, "[registry] Flow closed");
        Ok(flow)
    }

    /// Flows owned by one process, ordered by port id.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` if the process is absent.
    pub fn list_flows(&self, process_id: ProcessId) -> IpcmResult<Vec<FlowRecord>> {
        let entry = self.entry(process_id)?;
        let flows = entry.lock().flows.values().cloned().collect();
        Ok(flows)
    }

    /// Every non-closed flow across all processes.
    #[must_use]
    pub fn all_flows(&self) -> Vec<FlowRecord> {
        self.list_processes()
            .iter()
            .filter_map(|h| self.list_flows(h.id).ok())
            .flatten()
            .collect()
    }

    #[must_use]
    pub fn flow(&self, port_id: PortId) -> Option<FlowRecord> {
        let owner = self.owner_of(port_id)?;
        let entry = self.entry(owner).ok()?;
        let flow = entry.lock().flows.get(&port_id).cloned();
        flow
    }

    /// Process currently owning `port_id`.
    #[must_use]
    pub fn owner_of(&self, port_id: PortId) -> Option<ProcessId> {
        self.ports.lock().get(&port_id).copied()
    }

    // =========================================================================
    // APPLICATION REGISTRATIONS
    // =========================================================================

    /// Record that `application` is registered in `dif`.
    pub fn register_application(
        &self,
        application: &ApplicationName,
        dif: &DifName,
    ) -> ApplicationRegistration {
        let mut registrations = self.registrations.write();
        let difs = registrations.entry(application.clone()).or_default();
        difs.insert(dif.clone());
        info!(%application, %dif, "[registry] Application registered");
        ApplicationRegistration {
            application: application.clone(),
            difs: difs.clone(),
        }
    }

    /// Remove `application` from `dif`. The remaining registration is returned.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the application is not registered in `dif`.
    pub fn unregister_application(
        &self,
        application: &ApplicationName,
        dif: &DifName,
    ) -> IpcmResult<ApplicationRegistration> {
        let mut registrations = self.registrations.write();
        let removed = registrations
            .get_mut(application)
            .map_or(false, |difs| difs.remove(dif));
        if !removed {
            return Err(IpcmError::InvalidState(format!(
                "{application} is not registered in {dif}"
            )));
        }
        let difs = registrations.get(application).cloned().unwrap_or_default();
        if difs.is_empty() {
            registrations.remove(application);
        }
        info!(%application, %dif, "[registry] Application unregistered");
        Ok(ApplicationRegistration {
            application: application.clone(),
            difs,
        })
    }

    #[must_use]
    pub fn registration(&self, application: &ApplicationName) -> Option<ApplicationRegistration> {
        self.registrations
            .read()
            .get(application)
            .map(|difs| ApplicationRegistration {
                application: application.clone(),
                difs: difs.clone(),
            })
    }

    /// All registrations, ordered by application name.
    #[must_use]
    pub fn registrations(&self) -> Vec<ApplicationRegistration> {
        self.registrations
            .read()
            .iter()
            .map(|(application, difs)| ApplicationRegistration {
                application: application.clone(),
                difs: difs.clone(),
            })
            .collect()
    }
}
