//! # IPC Manager Facade
//!
//! Owns the registry, the correlator and the worker pool, and exposes the
//! management operations as blocking calls over the correlated request
//! pattern.
//!
//! ## Lifecycle
//!
//! ```text
//! IDLE ──start()──→ STARTING ──workers up──→ RUNNING
//!   │                  │                        │
//!   │                  └──spawn failure──┐      ├── request_shutdown() / runtime failure
//!   │                                    ▼      ▼
//!   └────────────stop()────────────→ STOPPED ←── STOPPING ──stop()──┘
//! ```
//!
//! `start()` on a running manager returns immediately; a second `start()`
//! racing an in-progress one fails with `AlreadyRunning`. A stopped manager
//! cannot be restarted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ipcm_bus::{
    EventSourceAdapter, LoopbackRuntime, NativeCall, NativeEventSource, NativeRuntime,
};
use ipcm_core::{
    Correlator, CorrelatorStats, EntityRegistry, OperationKind, PendingRequest, RequestContext,
};
use ipcm_types::{
    ApplicationName, ApplicationRegistration, DifName, Event, EventTag, FlowRecord, FlowState,
    IpcProcessHandle, IpcmError, IpcmResult, Outcome, PortId, ProcessId, ProcessSpec, Resolution,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ManagerConfig};
use crate::handlers::{self, ManagerCore};
use crate::router::{DispatchRouter, EventHandler};
use crate::workers::{PoolStats, ShutdownReport, WorkerPool};

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Manager lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Starting,
    Running,
    /// Shutdown requested or runtime failed; workers may still be draining.
    Stopping,
    Stopped,
}

/// Shared lifecycle state with change notification.
pub struct Lifecycle {
    state: Mutex<ManagerState>,
    changed: Condvar,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState::Idle),
            changed: Condvar::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    pub(crate) fn set(&self, next: ManagerState) {
        *self.state.lock() = next;
        self.changed.notify_all();
    }

    /// `Idle → Starting`. `Ok(false)` if already running.
    fn try_begin_start(&self) -> IpcmResult<bool> {
        let mut state = self.state.lock();
        match *state {
            ManagerState::Idle => {
                *state = ManagerState::Starting;
                Ok(true)
            }
            ManagerState::Running => Ok(false),
            ManagerState::Starting => Err(IpcmError::AlreadyRunning),
            ManagerState::Stopping | ManagerState::Stopped => Err(IpcmError::ShutDown),
        }
    }

    /// `Starting → Running`, unless a shutdown was requested meanwhile.
    fn finish_start(&self) -> bool {
        let mut state = self.state.lock();
        let started = *state == ManagerState::Starting;
        if started {
            *state = ManagerState::Running;
        }
        drop(state);
        self.changed.notify_all();
        started
    }

    /// Move a starting or running manager to `Stopping`.
    pub(crate) fn begin_stopping(&self) -> bool {
        let mut state = self.state.lock();
        let moved = matches!(*state, ManagerState::Starting | ManagerState::Running);
        if moved {
            *state = ManagerState::Stopping;
        }
        drop(state);
        self.changed.notify_all();
        moved
    }

    fn wait_while_starting(&self) {
        let mut state = self.state.lock();
        while *state == ManagerState::Starting {
            self.changed.wait(&mut state);
        }
    }

    /// Wait up to `timeout` for the manager to leave `Idle`/`Starting`/`Running`.
    /// Returns whether it is stopping or stopped.
    pub fn wait_until_stopping(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !matches!(*state, ManagerState::Stopping | ManagerState::Stopped) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        matches!(*state, ManagerState::Stopping | ManagerState::Stopped)
    }

    fn require_running(&self) -> IpcmResult<()> {
        match self.state() {
            ManagerState::Running => Ok(()),
            ManagerState::Idle | ManagerState::Starting => Err(IpcmError::NotRunning),
            ManagerState::Stopping | ManagerState::Stopped => Err(IpcmError::ShutDown),
        }
    }
}

/// Cloneable handle that asks a manager to shut down.
#[derive(Clone)]
pub struct ShutdownHandle {
    lifecycle: Arc<Lifecycle>,
    source: Arc<EventSourceAdapter>,
}

impl ShutdownHandle {
    /// Stop reading events. The owner still calls `stop()` to join workers.
    pub fn request(&self) {
        if self.lifecycle.begin_stopping() {
            info!("[ipcm] Shutdown requested");
        }
        self.source.request_shutdown();
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        matches!(
            self.lifecycle.state(),
            ManagerState::Stopping | ManagerState::Stopped
        )
    }

    /// Wait up to `timeout` for a shutdown request. Returns whether one arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.lifecycle.wait_until_stopping(timeout)
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for [`IpcManager`].
#[derive(Default)]
pub struct IpcManagerBuilder {
    config: ManagerConfig,
    event_source: Option<Arc<dyn NativeEventSource>>,
    runtime: Option<Arc<dyn NativeRuntime>>,
    loopback: Option<Arc<LoopbackRuntime>>,
    handlers: Vec<(EventTag, Arc<dyn EventHandler>)>,
}

impl IpcManagerBuilder {
    #[must_use]
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn event_source(mut self, source: Arc<dyn NativeEventSource>) -> Self {
        self.event_source = Some(source);
        self
    }

    #[must_use]
    pub fn runtime(mut self, runtime: Arc<dyn NativeRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Use `loopback` for whichever native port is not set explicitly.
    #[must_use]
    pub fn loopback(mut self, loopback: Arc<LoopbackRuntime>) -> Self {
        self.loopback = Some(loopback);
        self
    }

    /// Replace the built-in handler for `tag`.
    #[must_use]
    pub fn handler<H>(mut self, tag: EventTag, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.handlers.push((tag, Arc::new(handler)));
        self
    }

    /// Validate the configuration and wire the manager. Native ports not
    /// supplied are served by a loopback runtime built from `config.loopback`.
    pub fn build(self) -> Result<IpcManager, ConfigError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let mut loopback = self.loopback;
        let mut fallback = || -> Arc<LoopbackRuntime> {
            Arc::clone(loopback.get_or_insert_with(|| {
                let runtime = LoopbackRuntime::new(config.loopback.event_capacity);
                runtime.set_auto_complete(config.loopback.auto_complete);
                debug!("[ipcm] No native runtime attached, using loopback");
                Arc::new(runtime)
            }))
        };
        let native_source: Arc<dyn NativeEventSource> = match self.event_source {
            Some(source) => source,
            None => fallback(),
        };
        let native: Arc<dyn NativeRuntime> = match self.runtime {
            Some(runtime) => runtime,
            None => fallback(),
        };

        let registry = Arc::new(EntityRegistry::new());
        let correlator = Arc::new(Correlator::new(
            config.correlator.request_timeout,
            config.correlator.sweep_interval,
        ));
        let source = Arc::new(EventSourceAdapter::new(
            native_source,
            config.source.queue_capacity,
            config.workers.idle_poll,
        ));
        let core = Arc::new(ManagerCore {
            registry: Arc::clone(&registry),
            correlator,
            native,
            source,
            config: Arc::clone(&config),
            lifecycle: Arc::new(Lifecycle::new()),
        });

        let mut table = handlers::default_handlers(&core);
        for (tag, handler) in self.handlers {
            table = table.on_shared(tag, handler);
        }
        let router = Arc::new(DispatchRouter::new(table.build(), registry));

        Ok(IpcManager {
            core,
            router,
            loopback,
            pool: Mutex::new(None),
            last_report: Mutex::new(None),
            stop_serial: Mutex::new(()),
        })
    }
}

// =============================================================================
// FACADE
// =============================================================================

/// The IPC manager.
pub struct IpcManager {
    core: Arc<ManagerCore>,
    router: Arc<DispatchRouter>,
    loopback: Option<Arc<LoopbackRuntime>>,
    pool: Mutex<Option<WorkerPool>>,
    last_report: Mutex<Option<ShutdownReport>>,
    stop_serial: Mutex<()>,
}

impl IpcManager {
    #[must_use]
    pub fn builder() -> IpcManagerBuilder {
        IpcManagerBuilder::default()
    }

    /// Spawn the workers and begin dispatching events.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if another `start()` is in progress
    /// - `ShutDown` if the manager was stopped
    /// - `StartupFailure` if too few workers could be spawned
    pub fn start(&self) -> IpcmResult<()> {
        let lifecycle = &self.core.lifecycle;
        if !lifecycle.try_begin_start()? {
            debug!("[ipcm] Already running");
            return Ok(());
        }

        let config = &self.core.config;
        let pool = match WorkerPool::start(
            &config.workers,
            config.source.max_buffered_events,
            Arc::clone(&self.core.source),
            Arc::clone(&self.router),
            Arc::clone(&self.core.correlator),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "[ipcm] Start failed");
                *self.last_report.lock() = Some(ShutdownReport::idle());
                lifecycle.set(ManagerState::Stopped);
                return Err(e);
            }
        };

        let workers = pool.worker_count();
        *self.pool.lock() = Some(pool);
        if lifecycle.finish_start() {
            info!(workers, "[ipcm] IPC manager running");
        } else {
            warn!("[ipcm] Shutdown requested during start");
        }
        Ok(())
    }

    /// Stop reading events, let the workers drain and join them within
    /// `timeout`. Pending requests are resolved as `Cancelled`.
    ///
    /// Repeated calls return the first report.
    pub fn stop(&self, timeout: Duration) -> ShutdownReport {
        let _serial = self.stop_serial.lock();
        if let Some(report) = *self.last_report.lock() {
            return report;
        }
        let lifecycle = &self.core.lifecycle;
        lifecycle.wait_while_starting();
        lifecycle.begin_stopping();
        info!(timeout_ms = timeout.as_millis() as u64, "[ipcm] Stopping");

        let pool = self.pool.lock().take();
        let report = match pool {
            Some(pool) => pool.stop(timeout),
            None => {
                self.core.source.request_shutdown();
                ShutdownReport::idle()
            }
        };
        let cancelled = self.core.correlator.cancel_all(&Outcome::Cancelled);

        *self.last_report.lock() = Some(report);
        lifecycle.set(ManagerState::Stopped);
        info!(?report.outcome, cancelled, "[ipcm] IPC manager stopped");
        report
    }

    /// Ask the manager to stop reading events (runtime-facing signal).
    pub fn request_shutdown(&self) {
        self.shutdown_handle().request();
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            lifecycle: Arc::clone(&self.core.lifecycle),
            source: Arc::clone(&self.core.source),
        }
    }

    #[must_use]
    pub fn state(&self) -> ManagerState {
        self.core.lifecycle.state()
    }

    /// Queue an event for dispatch as if the runtime had delivered it.
    /// Blocks while the injection queue is full.
    ///
    /// # Errors
    ///
    /// `ShutDown` once the event source is closed.
    pub fn submit(&self, event: Event) -> IpcmResult<()> {
        self.core.source.inject(event)
    }

    // =========================================================================
    // MANAGEMENT OPERATIONS
    // =========================================================================

    fn await_resolution(
        &self,
        kind: OperationKind,
        context: RequestContext,
        call: NativeCall,
        what: &str,
    ) -> IpcmResult<Resolution> {
        let ticket = self.core.issue_call(kind, context, call)?;
        let timeout = self.core.correlator.request_timeout();
        self.core
            .correlator
            .await_outcome(ticket, timeout)
            .into_result(what)
    }

    /// Create an IPC process and wait for the runtime to confirm it.
    #[tracing::instrument(skip_all, fields(process_id = %spec.id))]
    pub fn create_process(&self, spec: ProcessSpec) -> IpcmResult<IpcProcessHandle> {
        self.core.lifecycle.require_running()?;
        self.core.registry.create_process(&spec)?;

        let context = RequestContext::management()
            .with_process(spec.id)
            .with_dif(spec.dif.clone());
        let what = format!("create {}", spec.id);
        let id = spec.id;
        let result = self.await_resolution(
            OperationKind::CreateProcess,
            context,
            NativeCall::CreateIpcProcess(spec),
            &what,
        );
        match result {
            Ok(Resolution::Process(handle)) => Ok(handle),
            Ok(other) => {
                self.core.registry.discard_process(id);
                Err(unexpected_resolution(&what, &other))
            }
            Err(e) => {
                if self.core.registry.discard_process(id).is_some() {
                    warn!(process_id = %id, error = %e, "[ipcm] Creation abandoned");
                }
                Err(e)
            }
        }
    }

    /// Destroy an IPC process. Without `force`, a process with open flows
    /// is refused with `EntityBusy`.
    #[tracing::instrument(skip(self))]
    pub fn destroy_process(&self, id: ProcessId, force: bool) -> IpcmResult<()> {
        self.core.lifecycle.require_running()?;
        self.core.registry.begin_teardown(id, force)?;

        let context = RequestContext::management().with_process(id);
        self.await_resolution(
            OperationKind::DestroyProcess,
            context,
            NativeCall::DestroyIpcProcess { process_id: id },
            &format!("destroy {id}"),
        )
        .map(|_| ())
    }

    /// Allocate a flow from `local` to `remote`, served by an IPC process
    /// of `dif` (or of the DIF configured for `local`).
    #[tracing::instrument(skip_all, fields(local = %local, remote = %remote, dif = ?dif))]
    pub fn allocate_flow(
        &self,
        local: ApplicationName,
        remote: ApplicationName,
        dif: Option<DifName>,
    ) -> IpcmResult<FlowRecord> {
        self.core.lifecycle.require_running()?;
        let dif = dif.or_else(|| self.core.config.dif_for(&local));
        let process = self.core.registry.select_process(dif.as_ref())?;

        let context = RequestContext::management()
            .with_process(process.id)
            .with_application(local.clone())
            .with_remote(remote.clone())
            .with_dif(dif.clone());
        let what = format!("allocate flow {local} -> {remote}");
        let call = NativeCall::AllocateFlow {
            process_id: process.id,
            local_application: local,
            remote_application: remote,
            dif,
        };
        match self.await_resolution(OperationKind::AllocateFlow, context, call, &what)? {
            Resolution::Flow(flow) => Ok(flow),
            other => Err(unexpected_resolution(&what, &other)),
        }
    }

    /// Deallocate the flow on `port_id`. Returns the closed record.
    ///
    /// A flow left `DEALLOCATING` by an earlier failed attempt may be retried.
    #[tracing::instrument(skip(self))]
    pub fn deallocate_flow(&self, port_id: PortId) -> IpcmResult<FlowRecord> {
        self.core.lifecycle.require_running()?;
        let flow = self
            .core
            .registry
            .flow(port_id)
            .ok_or(IpcmError::UnknownPort(port_id))?;
        if flow.state != FlowState::Deallocating {
            self.core.registry.begin_deallocation(port_id)?;
        }

        let mut context = RequestContext::management()
            .with_process(flow.process_id)
            .with_port(port_id);
        if let Some(local) = flow.local_application {
            context = context.with_application(local);
        }
        let what = format!("deallocate {port_id}");
        let call = NativeCall::DeallocateFlow {
            process_id: flow.process_id,
            port_id,
        };
        match self.await_resolution(OperationKind::DeallocateFlow, context, call, &what)? {
            Resolution::Flow(flow) => Ok(flow),
            other => Err(unexpected_resolution(&what, &other)),
        }
    }

    /// Register `application` in `dif`.
    #[tracing::instrument(skip_all, fields(application = %application, dif = %dif))]
    pub fn register_application(
        &self,
        application: ApplicationName,
        dif: DifName,
    ) -> IpcmResult<ApplicationRegistration> {
        self.core.lifecycle.require_running()?;
        let process = self.core.registry.select_process(Some(&dif))?;
        self.registration_call(process.id, application, dif, false)
    }

    /// Remove `application` from `dif`.
    #[tracing::instrument(skip_all, fields(application = %application, dif = %dif))]
    pub fn unregister_application(
        &self,
        application: ApplicationName,
        dif: DifName,
    ) -> IpcmResult<ApplicationRegistration> {
        self.core.lifecycle.require_running()?;
        let registered = self
            .core
            .registry
            .registration(&application)
            .map_or(false, |r| r.difs.contains(&dif));
        if !registered {
            return Err(IpcmError::InvalidState(format!(
                "{application} is not registered in {dif}"
            )));
        }
        let process = self.core.registry.select_process(Some(&dif))?;
        self.registration_call(process.id, application, dif, true)
    }

    fn registration_call(
        &self,
        process_id: ProcessId,
        application: ApplicationName,
        dif: DifName,
        unregister: bool,
    ) -> IpcmResult<ApplicationRegistration> {
        let context = RequestContext::management()
            .with_process(process_id)
            .with_application(application.clone())
            .with_dif(Some(dif.clone()));
        let (kind, call, what) = if unregister {
            (
                OperationKind::UnregisterApplication,
                NativeCall::UnregisterApplication {
                    process_id,
                    application: application.clone(),
                    dif: dif.clone(),
                },
                format!("unregister {application} from {dif}"),
            )
        } else {
            (
                OperationKind::RegisterApplication,
                NativeCall::RegisterApplication {
                    process_id,
                    application: application.clone(),
                    dif: dif.clone(),
                },
                format!("register {application} in {dif}"),
            )
        };
        match self.await_resolution(kind, context, call, &what)? {
            Resolution::Registration(registration) => Ok(registration),
            other => Err(unexpected_resolution(&what, &other)),
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    #[must_use]
    pub fn list_processes(&self) -> Vec<IpcProcessHandle> {
        self.core.registry.list_processes()
    }

    #[must_use]
    pub fn lookup_process(&self, id: ProcessId) -> Option<IpcProcessHandle> {
        self.core.registry.lookup(id)
    }

    /// Flows of one process.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` if the process is absent.
    pub fn list_flows(&self, process_id: ProcessId) -> IpcmResult<Vec<FlowRecord>> {
        self.core.registry.list_flows(process_id)
    }

    #[must_use]
    pub fn all_flows(&self) -> Vec<FlowRecord> {
        self.core.registry.all_flows()
    }

    #[must_use]
    pub fn list_registrations(&self) -> Vec<ApplicationRegistration> {
        self.core.registry.registrations()
    }

    #[must_use]
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.core.correlator.pending()
    }

    #[must_use]
    pub fn correlator_stats(&self) -> CorrelatorStats {
        self.core.correlator.stats()
    }

    /// Worker counters while running, or the final counters after `stop()`.
    #[must_use]
    pub fn pool_stats(&self) -> Option<PoolStats> {
        if let Some(pool) = self.pool.lock().as_ref() {
            return Some(pool.stats());
        }
        self.last_report.lock().map(|report| report.stats)
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.core.config
    }

    /// The loopback runtime, when the manager runs over one.
    #[must_use]
    pub fn loopback(&self) -> Option<&Arc<LoopbackRuntime>> {
        self.loopback.as_ref()
    }
}

impl Drop for IpcManager {
    fn drop(&mut self) {
        if self.pool.get_mut().is_some() {
            warn!("[ipcm] Manager dropped while running, stopping");
            let timeout = self.core.config.workers.join_timeout;
            let _ = self.stop(timeout);
        }
    }
}

fn unexpected_resolution(what: &str, resolution: &Resolution) -> IpcmError {
    IpcmError::InvalidState(format!("{what} resolved with {resolution:?}"))
}
