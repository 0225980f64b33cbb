//! # Request/Response Correlator
//!
//! Matches asynchronous native completions back to the operation that
//! triggered them.
//!
//! ## Flow
//!
//! ```text
//! caller                     correlator                      handler
//!   │ issue(kind, ctx) ───────→ pending[#n]                     │
//!   │ ←─────── Ticket(#n)                                        │
//!   │ await_outcome(ticket) ···                                  │
//!   │                           pending[#n] ←── claim(#n) ───────│
//!   │                                        Claim::complete(..) │
//!   │ ←────────── Outcome ──────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Correlation ids are unique among pending requests.
//! - An outcome is delivered at most once: the first `claim` removes the
//!   entry, so a duplicate or late completion gets `UnknownCorrelation`.
//! - A claimed request is always completed: dropping a [`Claim`] without
//!   completing it delivers `Cancelled`.
//! - Requests older than the configured timeout are evicted by
//!   [`Correlator::maybe_sweep`], which the dispatcher calls every cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ipcm_types::{
    ApplicationName, CorrelationId, DifName, IpcmError, IpcmResult, Outcome, PortId, ProcessId,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Default age after which a pending request is evicted.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default minimum spacing of opportunistic sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// REQUEST DESCRIPTION
// =============================================================================

/// The asynchronous operation a pending request stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateProcess,
    DestroyProcess,
    AllocateFlow,
    /// Waiting for a local application to accept a remote flow.
    AcceptFlow,
    DeallocateFlow,
    RegisterApplication,
    UnregisterApplication,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::CreateProcess => "create process",
            OperationKind::DestroyProcess => "destroy process",
            OperationKind::AllocateFlow => "allocate flow",
            OperationKind::AcceptFlow => "accept flow",
            OperationKind::DeallocateFlow => "deallocate flow",
            OperationKind::RegisterApplication => "register application",
            OperationKind::UnregisterApplication => "unregister application",
        };
        f.write_str(name)
    }
}

/// Who is waiting on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// A management caller blocked in a facade operation.
    Management,
    /// Issued by a handler on behalf of the runtime; nobody waits.
    Runtime,
}

/// Caller context carried with a pending request, handed back to the
/// completion handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub origin: RequestOrigin,
    pub process_id: Option<ProcessId>,
    pub port_id: Option<PortId>,
    pub application: Option<ApplicationName>,
    pub remote_application: Option<ApplicationName>,
    pub dif: Option<DifName>,
}

impl RequestContext {
    fn with_origin(origin: RequestOrigin) -> Self {
        Self {
            origin,
            process_id: None,
            port_id: None,
            application: None,
            remote_application: None,
            dif: None,
        }
    }

    #[must_use]
    pub fn management() -> Self {
        Self::with_origin(RequestOrigin::Management)
    }

    #[must_use]
    pub fn runtime() -> Self {
        Self::with_origin(RequestOrigin::Runtime)
    }

    #[must_use]
    pub fn with_process(mut self, process_id: ProcessId) -> Self {
        self.process_id = Some(process_id);
        self
    }

    #[must_use]
    pub fn with_port(mut self, port_id: PortId) -> Self {
        self.port_id = Some(port_id);
        self
    }

    #[must_use]
    pub fn with_application(mut self, application: ApplicationName) -> Self {
        self.application = Some(application);
        self
    }

    #[must_use]
    pub fn with_remote(mut self, remote: ApplicationName) -> Self {
        self.remote_application = Some(remote);
        self
    }

    #[must_use]
    pub fn with_dif(mut self, dif: Option<DifName>) -> Self {
        self.dif = dif;
        self
    }

    /// Whether this request depends on `process_id`.
    #[must_use]
    pub fn references(&self, process_id: ProcessId) -> bool {
        self.process_id == Some(process_id)
    }
}

/// Snapshot of one in-flight request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub correlation_id: CorrelationId,
    pub kind: OperationKind,
    pub context: RequestContext,
    pub issued_at: Instant,
    /// Wall-clock issue time, for diagnostics.
    pub issued_wall: DateTime<Utc>,
}

impl PendingRequest {
    #[must_use]
    pub fn age(&self) -> Duration {
        self.issued_at.elapsed()
    }
}

// =============================================================================
// COMPLETION SLOTS
// =============================================================================

#[derive(Default)]
struct Slot {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl Slot {
    /// First delivery wins.
    fn deliver(&self, outcome: Outcome) -> bool {
        let mut guard = self.outcome.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(outcome);
        self.ready.notify_all();
        true
    }

    fn wait_until(&self, deadline: Instant) -> Option<Outcome> {
        let mut guard = self.outcome.lock();
        while guard.is_none() {
            if self.ready.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        guard.take()
    }
}

/// Handle returned by [`Correlator::issue`]; redeem it with
/// [`Correlator::await_outcome`].
pub struct Ticket {
    id: CorrelationId,
    kind: OperationKind,
    slot: Arc<Slot>,
}

impl Ticket {
    /// Correlation id to embed in the native call.
    #[must_use]
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Exclusive right to complete one pending request.
pub struct Claim {
    request: PendingRequest,
    slot: Option<Arc<Slot>>,
}

impl Claim {
    #[must_use]
    pub fn request(&self) -> &PendingRequest {
        &self.request
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.request.kind
    }

    #[must_use]
    pub fn context(&self) -> &RequestContext {
        &self.request.context
    }

    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.request.correlation_id
    }

    /// Deliver `outcome` to the waiting caller, if any.
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(slot) = self.slot.take() {
            slot.deliver(outcome);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            warn!(
                correlation_id = %self.request.correlation_id,
                kind = %self.request.kind,
                "[correlator] Claim dropped without completion"
            );
            slot.deliver(Outcome::Cancelled);
        }
    }
}

struct PendingEntry {
    request: PendingRequest,
    slot: Arc<Slot>,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub issued: u64,
    pub claimed: u64,
    pub expired: u64,
    pub unknown: u64,
}

// =============================================================================
// CORRELATOR
// =============================================================================

/// Table of pending requests with timeout eviction.
pub struct Correlator {
    next_id: AtomicU32,
    pending: Mutex<HashMap<CorrelationId, PendingEntry>>,
    request_timeout: Duration,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
    issued: AtomicU64,
    claimed: AtomicU64,
    expired: AtomicU64,
    unknown: AtomicU64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT, DEFAULT_SWEEP_INTERVAL)
    }
}

impl Correlator {
    #[must_use]
    pub fn new(request_timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            request_timeout,
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
            issued: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Register a pending request and return its ticket.
    pub fn issue(&self, kind: OperationKind, context: RequestContext) -> Ticket {
        let slot = Arc::new(Slot::default());
        let mut pending = self.pending.lock();
        let id = loop {
            // Zero is never handed out; wrapped ids still pending are skipped.
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
            let id = CorrelationId(raw);
            if raw != 0 && !pending.contains_key(&id) {
                break id;
            }
        };
        pending.insert(
            id,
            PendingEntry {
                request: PendingRequest {
                    correlation_id: id,
                    kind,
                    context,
                    issued_at: Instant::now(),
                    issued_wall: Utc::now(),
                },
                slot: Arc::clone(&slot),
            },
        );
        drop(pending);

        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %id, %kind, "[correlator] Request issued");
        Ticket { id, kind, slot }
    }

    /// Take the pending request `id` out of the table.
    ///
    /// # Errors
    ///
    /// `UnknownCorrelation` if no such request is pending (never issued,
    /// already completed, or evicted).
    pub fn claim(&self, id: CorrelationId) -> IpcmResult<Claim> {
        match self.pending.lock().remove(&id) {
            Some(entry) => {
                self.claimed.fetch_add(1, Ordering::Relaxed);
                Ok(Claim {
                    request: entry.request,
                    slot: Some(entry.slot),
                })
            }
            None => {
                self.unknown.fetch_add(1, Ordering::Relaxed);
                Err(IpcmError::UnknownCorrelation(id))
            }
        }
    }

    /// Claim and complete in one step.
    pub fn resolve(&self, id: CorrelationId, outcome: Outcome) -> IpcmResult<()> {
        self.claim(id)?.complete(outcome);
        Ok(())
    }

    /// Block until the ticket's request completes or `timeout` elapses.
    ///
    /// On timeout the request is withdrawn so a late completion is reported
    /// as `UnknownCorrelation`. If a handler already claimed it, the caller
    /// waits one more `timeout` for that handler to finish.
    pub fn await_outcome(&self, ticket: Ticket, timeout: Duration) -> Outcome {
        if let Some(outcome) = ticket.slot.wait_until(Instant::now() + timeout) {
            return outcome;
        }

        if self.pending.lock().remove(&ticket.id).is_some() {
            self.expired.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %ticket.id,
                kind = %ticket.kind,
                "[correlator] Caller timed out"
            );
            return Outcome::Timeout;
        }

        ticket
            .slot
            .wait_until(Instant::now() + timeout)
            .unwrap_or(Outcome::Timeout)
    }

    /// Evict every request older than the timeout, resolving it as `Timeout`.
    pub fn sweep_expired(&self, now: Instant) -> Vec<CorrelationId> {
        let expired: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, e)| {
                    now.saturating_duration_since(e.request.issued_at) >= self.request_timeout
                })
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let mut ids = Vec::with_capacity(expired.len());
        for entry in expired {
            warn!(
                correlation_id = %entry.request.correlation_id,
                kind = %entry.request.kind,
                "[correlator] Request timed out"
            );
            entry.slot.deliver(Outcome::Timeout);
            ids.push(entry.request.correlation_id);
        }
        self.expired.fetch_add(ids.len() as u64, Ordering::Relaxed);
        ids
    }

    /// Sweep if the sweep interval has passed and no other thread is
    /// sweeping. Never blocks. Returns the number of evicted requests.
    pub fn maybe_sweep(&self) -> usize {
        let now = Instant::now();
        {
            let Some(mut last) = self.last_sweep.try_lock() else {
                return 0;
            };
            if now.saturating_duration_since(*last) < self.sweep_interval {
                return 0;
            }
            *last = now;
        }
        self.sweep_expired(now).len()
    }

    /// Resolve every pending request matching `pred` with `outcome`.
    pub fn fail_where<F>(&self, pred: F, outcome: &Outcome) -> usize
    where
        F: Fn(&PendingRequest) -> bool,
    {
        let matched: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, e)| pred(&e.request))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for entry in &matched {
            entry.slot.deliver(outcome.clone());
        }
        matched.len()
    }

    /// Resolve every pending request with `outcome`.
    pub fn cancel_all(&self, outcome: &Outcome) -> usize {
        let count = self.fail_where(|_| true, outcome);
        if count > 0 {
            warn!(count, ?outcome, "[correlator] Pending requests resolved on shutdown");
        }
        count
    }

    /// Snapshots of the pending requests, ordered by correlation id.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<_> = self
            .pending
            .lock()
            .values()
            .map(|e| e.request.clone())
            .collect();
        requests.sort_by_key(|r| r.correlation_id);
        requests
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            issued: self.issued.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }
}
