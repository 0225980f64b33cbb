//! # Event Source Adapter
//!
//! Wraps the runtime's blocking "next event" primitive and hands out typed
//! [`Event`]s to whichever worker is currently reading.
//!
//! ## Delivery Order
//!
//! 1. Locally injected events (bounded queue, injectors block when full)
//! 2. Native records, normalized by [`normalize`]
//!
//! ## States
//!
//! ```text
//! OPEN ──native failure──→ DRAINED   (one Error event, then Shutdown forever)
//!   │
//!   └──request_shutdown──→ STOPPED   (Shutdown forever)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipcm_types::{Event, IpcmError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::native::{normalize, NativeEventSource};

/// What a call to [`EventSourceAdapter::next_event`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceItem {
    Event(Event),
    /// Nothing arrived within the poll interval.
    Idle,
    /// The adapter is stopped or drained; no more events will come.
    Shutdown,
}

/// Lifecycle of the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Open,
    Drained,
    Stopped,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub delivered: u64,
    pub injected: u64,
    pub malformed: u64,
}

/// Normalizing, shutdown-aware front of the native event source.
pub struct EventSourceAdapter {
    native: Arc<dyn NativeEventSource>,
    state: Mutex<SourceState>,
    injected: Mutex<VecDeque<Event>>,
    not_full: Condvar,
    capacity: usize,
    idle_poll: Duration,
    delivered: AtomicU64,
    injected_total: AtomicU64,
    malformed: AtomicU64,
}

impl EventSourceAdapter {
    /// Create an adapter over `native`.
    ///
    /// `capacity` bounds the injected-event queue; `idle_poll` bounds each
    /// blocking wait on the native source.
    pub fn new(native: Arc<dyn NativeEventSource>, capacity: usize, idle_poll: Duration) -> Self {
        Self {
            native,
            state: Mutex::new(SourceState::Open),
            injected: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            idle_poll,
            delivered: AtomicU64::new(0),
            injected_total: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Block for the next event.
    ///
    /// Returns [`SourceItem::Idle`] when nothing arrived within the poll
    /// interval so the caller gets a chance to run housekeeping.
    pub fn next_event(&self) -> SourceItem {
        if self.state() != SourceState::Open {
            return SourceItem::Shutdown;
        }

        if let Some(event) = self.pop_injected() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            return SourceItem::Event(event);
        }

        match self.native.wait_event(self.idle_poll) {
            Ok(Some(raw)) => match normalize(raw) {
                Ok(event) => {
                    debug!(tag = ?event.tag(), "[source] Event received");
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    SourceItem::Event(event)
                }
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "[source] Skipping malformed native record");
                    SourceItem::Idle
                }
            },
            Ok(None) => SourceItem::Idle,
            Err(e) => self.enter_drained(e.to_string()),
        }
    }

    /// Queue a locally originated event ahead of native ones.
    ///
    /// Blocks while the queue is full. Fails with [`IpcmError::ShutDown`]
    /// once the adapter no longer delivers events.
    pub fn inject(&self, event: Event) -> Result<(), IpcmError> {
        let mut queue = self.injected.lock();
        loop {
            if self.state() != SourceState::Open {
                return Err(IpcmError::ShutDown);
            }
            if queue.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut queue);
        }
        queue.push_back(event);
        self.injected_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop delivering events. Every later `next_event` returns `Shutdown`.
    pub fn request_shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == SourceState::Open {
                *state = SourceState::Stopped;
                info!("[source] Shutdown requested");
            }
        }
        // Wake blocked injectors under the queue lock so none misses the signal.
        let _queue = self.injected.lock();
        self.not_full.notify_all();
    }

    #[must_use]
    pub fn state(&self) -> SourceState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.state() == SourceState::Drained
    }

    /// Events injected but not yet delivered.
    #[cfg(test)]
    fn backlog(&self) -> usize {
        self.injected.lock().len()
    }

    #[must_use]
    pub fn stats(&self) -> SourceStats {
        SourceStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            injected: self.injected_total.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    fn pop_injected(&self) -> Option<Event> {
        let mut queue = self.injected.lock();
        let event = queue.pop_front();
        if event.is_some() {
            self.not_full.notify_one();
        }
        event
    }

    fn enter_drained(&self, reason: String) -> SourceItem {
        {
            let mut state = self.state.lock();
            if *state != SourceState::Open {
                return SourceItem::Shutdown;
            }
            *state = SourceState::Drained;
        }
        error!(reason = %reason, "[source] Native event source failed, draining");
        let _queue = self.injected.lock();
        self.not_full.notify_all();
        SourceItem::Event(Event::Error { message: reason })
    }
}
