//! # Loopback Runtime
//!
//! In-process stand-in for the network-stack runtime. Implements both native
//! ports over one bounded queue of raw records:
//!
//! ```text
//!  issue(call) ──auto-complete──┐
//!                               ▼
//!  push(raw) ──(blocks if full)──→ [ queue ] ──wait_event()──→ adapter
//! ```
//!
//! Used by the `ipcm` binary when no kernel runtime is attached, and by
//! tests to script native behaviour (result codes, refused calls, read
//! failures).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use ipcm_types::CorrelationId;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::native::{
    NativeAck, NativeCall, NativeError, NativeEvent, NativeEventSource, NativeRuntime, Notification,
};

/// First port id handed out by the loopback.
const FIRST_PORT: u32 = 1;

struct LoopbackQueue {
    events: VecDeque<NativeEvent>,
    closed: bool,
    /// Read failure to surface on the next `wait_event`.
    failure: Option<String>,
}

/// Scriptable in-memory native runtime.
pub struct LoopbackRuntime {
    queue: Mutex<LoopbackQueue>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,

    auto_complete: AtomicBool,
    mangle_acks: AtomicBool,
    refusal: Mutex<Option<String>>,
    result_codes: Mutex<HashMap<&'static str, i32>>,
    next_port: AtomicU32,

    calls: Mutex<Vec<(CorrelationId, NativeCall)>>,
    notifications: Mutex<Vec<Notification>>,
}

impl LoopbackRuntime {
    /// Create a loopback whose event queue holds at most `capacity` records.
    ///
    /// Auto-completion starts disabled.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(LoopbackQueue {
                events: VecDeque::with_capacity(capacity),
                closed: false,
                failure: None,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            auto_complete: AtomicBool::new(false),
            mangle_acks: AtomicBool::new(false),
            refusal: Mutex::new(None),
            result_codes: Mutex::new(HashMap::new()),
            next_port: AtomicU32::new(FIRST_PORT),
            calls: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        }
    }

    /// Answer every issued call with a completion record.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::SeqCst);
    }

    /// Result code auto-completions of `kind` (see [`NativeCall::kind`]) carry.
    pub fn set_result_code(&self, kind: &'static str, code: i32) {
        self.result_codes.lock().insert(kind, code);
    }

    /// Refuse every issued call with `reason` (`None` to accept again).
    pub fn set_refusal(&self, reason: Option<String>) {
        *self.refusal.lock() = reason;
    }

    /// Acknowledge calls with a correlation id that does not match.
    pub fn set_mangle_acks(&self, enabled: bool) {
        self.mangle_acks.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `wait_event` fail as if the runtime disconnected.
    pub fn fail_next_read(&self, reason: impl Into<String>) {
        let mut queue = self.queue.lock();
        queue.failure = Some(reason.into());
        self.not_empty.notify_all();
    }

    /// Hand out a fresh port id.
    pub fn allocate_port(&self) -> u32 {
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver a raw record, blocking while the queue is full.
    pub fn push(&self, event: NativeEvent) -> Result<(), NativeError> {
        let mut queue = self.queue.lock();
        loop {
            if queue.closed {
                return Err(NativeError::QueueClosed);
            }
            if queue.events.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut queue);
        }
        queue.events.push_back(event);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Like [`push`](Self::push) but gives up after `timeout`.
    #[cfg(test)]
    fn push_timeout(&self, event: NativeEvent, timeout: Duration) -> Result<bool, NativeError> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        while queue.events.len() >= self.capacity {
            if queue.closed {
                return Err(NativeError::QueueClosed);
            }
            if self.not_full.wait_until(&mut queue, deadline).timed_out() {
                return Ok(false);
            }
        }
        if queue.closed {
            return Err(NativeError::QueueClosed);
        }
        queue.events.push_back(event);
        self.not_empty.notify_one();
        Ok(true)
    }

    /// Close the queue. Blocked producers fail; the reader sees a disconnect
    /// once the backlog is consumed.
    pub fn close(&self) {
        let mut queue = self.queue.lock();
        queue.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Records waiting to be read.
    #[cfg(test)]
    fn backlog(&self) -> usize {
        self.queue.lock().events.len()
    }

    /// Every call issued so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(CorrelationId, NativeCall)> {
        self.calls.lock().clone()
    }

    /// Every notification sent so far, in order.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    fn result_code(&self, kind: &'static str) -> i32 {
        self.result_codes.lock().get(kind).copied().unwrap_or(0)
    }

    /// Completion record the runtime would send for `call`.
    fn completion_for(&self, id: CorrelationId, call: &NativeCall) -> NativeEvent {
        let sequence = id.0;
        let result = self.result_code(call.kind());
        match call {
            NativeCall::CreateIpcProcess(spec) => NativeEvent::IpcProcessCreateResult {
                sequence,
                ipcp_id: spec.id.0,
                result,
            },
            NativeCall::DestroyIpcProcess { process_id } => NativeEvent::IpcProcessDestroyResult {
                sequence,
                ipcp_id: process_id.0,
                result,
            },
            NativeCall::AllocateFlow { process_id, .. } => {
                let port_id = if result == 0 {
                    native_port(self.allocate_port())
                } else {
                    -1
                };
                NativeEvent::AllocateFlowRequestResult {
                    sequence,
                    ipcp_id: process_id.0,
                    port_id,
                    result,
                }
            }
            NativeCall::NotifyFlowRequest {
                process_id,
                port_id,
                ..
            } => NativeEvent::AllocateFlowResponse {
                sequence,
                ipcp_id: Some(process_id.0),
                port_id: native_port(port_id.0),
                result,
            },
            NativeCall::DeallocateFlow {
                process_id,
                port_id,
            } => NativeEvent::DeallocateFlowResponse {
                sequence,
                ipcp_id: process_id.0,
                port_id: native_port(port_id.0),
                result,
            },
            NativeCall::RegisterApplication {
                process_id,
                application,
                dif,
            } => NativeEvent::RegisterApplicationResponse {
                sequence,
                ipcp_id: process_id.0,
                application: application.clone(),
                dif: dif.0.clone(),
                result,
            },
            NativeCall::UnregisterApplication {
                process_id,
                application,
                dif,
            } => NativeEvent::UnregisterApplicationResponse {
                sequence,
                ipcp_id: process_id.0,
                application: application.clone(),
                dif: dif.0.clone(),
                result,
            },
        }
    }

    /// Completions skip the capacity bound: they are produced by dispatcher
    /// workers, which must never block on the queue they drain.
    fn push_completion(&self, event: NativeEvent) -> Result<(), NativeError> {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(NativeError::QueueClosed);
        }
        queue.events.push_back(event);
        self.not_empty.notify_one();
        Ok(())
    }
}

impl Default for LoopbackRuntime {
    fn default() -> Self {
        Self::new(crate::DEFAULT_QUEUE_CAPACITY)
    }
}

fn native_port(port: u32) -> i32 {
    i32::try_from(port).unwrap_or(-1)
}

impl NativeEventSource for LoopbackRuntime {
    fn wait_event(&self, timeout: Duration) -> Result<Option<NativeEvent>, NativeError> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(reason) = queue.failure.take() {
                return Err(NativeError::Disconnected(reason));
            }
            if let Some(event) = queue.events.pop_front() {
                self.not_full.notify_one();
                trace!(?event, "[loopback] Delivering record");
                return Ok(Some(event));
            }
            if queue.closed {
                return Err(NativeError::Disconnected("loopback queue closed".into()));
            }
            if self.not_empty.wait_until(&mut queue, deadline).timed_out() {
                return Ok(None);
            }
        }
    }
}

impl NativeRuntime for LoopbackRuntime {
    fn issue(
        &self,
        correlation_id: CorrelationId,
        call: NativeCall,
    ) -> Result<NativeAck, NativeError> {
        let kind = call.kind();
        self.calls.lock().push((correlation_id, call.clone()));

        if let Some(reason) = self.refusal.lock().clone() {
            return Err(NativeError::Rejected { call: kind, reason });
        }

        if self.auto_complete.load(Ordering::SeqCst) {
            let completion = self.completion_for(correlation_id, &call);
            self.push_completion(completion)?;
        }
        debug!(call = kind, correlation = %correlation_id, "[loopback] Call issued");

        let correlation_id = if self.mangle_acks.load(Ordering::SeqCst) {
            CorrelationId(correlation_id.0.wrapping_add(1))
        } else {
            correlation_id
        };
        Ok(NativeAck { correlation_id })
    }

    fn notify(&self, notification: Notification) -> Result<(), NativeError> {
        debug!(?notification, "[loopback] Notification");
        self.notifications.lock().push(notification);
        Ok(())
    }
}
