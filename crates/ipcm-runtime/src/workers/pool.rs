//! # Worker Pool
//!
//! A fixed set of OS threads sharing one blocking event source.
//!
//! ## Worker Loop
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   ready lane? ──yes──→ run oldest event of that lane ─────┤
//!      │ no                (key marked busy meanwhile)      │
//!   source closed? ──yes──→ exit                            │
//!      │ no                                                 │
//!   reader slot free and buffer not full?                   │
//!      │ yes                               │ no             │
//!   next_event() → route → buffer in lane  wait ────────────┘
//! ```
//!
//! Only one worker reads from the source at a time; the others run ready
//! lanes.
//!
//! ## Backpressure
//!
//! `max_buffered` bounds the events a worker could start right away. Events
//! queued behind a running handler of their own key do not count against it,
//! so a slow key never keeps other keys' events unread while workers idle.
//! Those queued events are bounded separately, at `BACKLOG_FACTOR` times
//! `max_buffered`. Reading stops when either bound is hit, which blocks
//! injectors upstream.
//!
//! ## Shutdown
//!
//! `stop(timeout)` closes the event source. Workers finish the handler they
//! are running, drain the events already buffered, and exit. Workers still
//! busy at the deadline are detached and the shutdown reported as degraded.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ipcm_bus::{EventSourceAdapter, SourceItem};
use ipcm_core::Correlator;
use ipcm_types::{IpcmError, IpcmResult};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::scheduler::{Dispatch, Scheduler};
use crate::config::WorkerConfig;
use crate::router::DispatchRouter;

/// Total buffered events allowed, as a multiple of `max_buffered`.
const BACKLOG_FACTOR: usize = 4;

/// Counters reported by the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Handler invocations, whatever their result.
    pub dispatched: u64,
    /// Handlers that returned an error.
    pub failed: u64,
    /// Handlers that panicked.
    pub panicked: u64,
    /// Events dropped because no handler was registered for their tag.
    pub unhandled: u64,
}

/// How a stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every worker exited before the deadline.
    Graceful,
    /// `abandoned` workers were still running at the deadline and were detached.
    Degraded { abandoned: usize },
}

/// Result of [`WorkerPool::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub outcome: ShutdownOutcome,
    pub elapsed: Duration,
    pub stats: PoolStats,
}

impl ShutdownReport {
    /// Report for a manager stopped before any worker was started.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            outcome: ShutdownOutcome::Graceful,
            elapsed: Duration::ZERO,
            stats: PoolStats::default(),
        }
    }

    #[must_use]
    pub fn is_graceful(&self) -> bool {
        self.outcome == ShutdownOutcome::Graceful
    }
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    unhandled: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
        }
    }
}

struct PoolState {
    scheduler: Scheduler,
    reader_active: bool,
    source_done: bool,
    started: usize,
    exited: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Signalled when a lane becomes ready, the reader slot frees up, or the
    /// source closes.
    work: Condvar,
    /// Signalled when a worker starts or exits.
    lifecycle: Condvar,
    source: Arc<EventSourceAdapter>,
    router: Arc<DispatchRouter>,
    correlator: Arc<Correlator>,
    max_buffered: usize,
    max_backlog: usize,
    counters: Counters,
}

enum Step {
    Run(Dispatch),
    Read,
    Exit,
}

impl PoolShared {
    fn next_step(&self) -> Step {
        let mut state = self.state.lock();
        loop {
            if let Some(dispatch) = state.scheduler.take_ready() {
                return Step::Run(dispatch);
            }
            if state.source_done {
                return Step::Exit;
            }
            if !state.reader_active && self.has_room(&state.scheduler) {
                state.reader_active = true;
                return Step::Read;
            }
            self.work.wait(&mut state);
        }
    }

    fn has_room(&self, scheduler: &Scheduler) -> bool {
        scheduler.runnable() < self.max_buffered && scheduler.buffered() < self.max_backlog
    }

    fn read(&self, worker: usize) {
        self.correlator.maybe_sweep();

        let item = panic::catch_unwind(AssertUnwindSafe(|| self.source.next_event()))
            .unwrap_or_else(|payload| {
                error!(
                    worker,
                    panic = %panic_message(payload.as_ref()),
                    "[worker-{}] Event source panicked",
                    worker
                );
                SourceItem::Idle
            });

        let closed = matches!(item, SourceItem::Shutdown);
        let routed = match item {
            SourceItem::Event(event) => match self.router.route(&event) {
                Ok(routed) => Some((event, routed)),
                Err(e) => {
                    self.counters.unhandled.fetch_add(1, Ordering::Relaxed);
                    warn!(worker, error = %e, "[worker-{}] Dropping event", worker);
                    None
                }
            },
            _ => None,
        };

        let mut state = self.state.lock();
        state.reader_active = false;
        if let Some((event, routed)) = routed {
            let key = routed.key.clone();
            let seq = state.scheduler.push(event, routed);
            trace!(worker, seq, %key, "[worker-{}] Event buffered", worker);
        } else if closed && !state.source_done {
            state.source_done = true;
            info!(
                worker,
                buffered = state.scheduler.buffered(),
                "[worker-{}] Event source closed, draining",
                worker
            );
        }
        drop(state);
        self.work.notify_all();
    }

    fn run(&self, worker: usize, dispatch: Dispatch) {
        self.correlator.maybe_sweep();

        let Dispatch { seq, event, routed } = dispatch;
        let key = routed.key.clone();
        let tag = routed.tag;
        let handler = routed.handler;

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(Ok(())) => {
                trace!(worker, seq, %key, ?tag, "[worker-{}] Event handled", worker);
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if e.is_benign() {
                    warn!(worker, seq, %key, ?tag, error = %e, "[worker-{}] Handler failed", worker);
                } else {
                    error!(worker, seq, %key, ?tag, error = %e, "[worker-{}] Handler failed", worker);
                }
            }
            Err(payload) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker,
                    seq,
                    %key,
                    ?tag,
                    panic = %panic_message(payload.as_ref()),
                    "[worker-{}] Handler panicked, worker continues",
                    worker
                );
            }
        }

        let mut state = self.state.lock();
        state.scheduler.finish(&key);
        drop(state);
        self.work.notify_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Counts the worker as exited however its loop ends.
struct ExitGuard {
    shared: Arc<PoolShared>,
    worker: usize,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.exited += 1;
        self.shared.lifecycle.notify_all();
        drop(state);
        debug!(worker = self.worker, "[worker-{}] Exited", self.worker);
    }
}

fn run_worker(shared: Arc<PoolShared>, worker: usize) {
    let _guard = ExitGuard {
        shared: Arc::clone(&shared),
        worker,
    };
    {
        let mut state = shared.state.lock();
        state.started += 1;
        shared.lifecycle.notify_all();
    }
    debug!(worker, "[worker-{}] Started", worker);

    loop {
        match shared.next_step() {
            Step::Run(dispatch) => shared.run(worker, dispatch),
            Step::Read => shared.read(worker),
            Step::Exit => break,
        }
    }
}

type SpawnFn<'a> =
    dyn FnMut(thread::Builder, Box<dyn FnOnce() + Send + 'static>) -> io::Result<JoinHandle<()>> + 'a;

/// Running worker threads.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.count` workers and return once they are all running.
    ///
    /// # Errors
    ///
    /// `StartupFailure` if fewer than `config.min_workers` could be spawned.
    /// The workers that did start are stopped again.
    pub fn start(
        config: &WorkerConfig,
        max_buffered: usize,
        source: Arc<EventSourceAdapter>,
        router: Arc<DispatchRouter>,
        correlator: Arc<Correlator>,
    ) -> IpcmResult<Self> {
        Self::start_with(
            config,
            max_buffered,
            source,
            router,
            correlator,
            &mut |builder, body| builder.spawn(body),
        )
    }

    fn start_with(
        config: &WorkerConfig,
        max_buffered: usize,
        source: Arc<EventSourceAdapter>,
        router: Arc<DispatchRouter>,
        correlator: Arc<Correlator>,
        spawn: &mut SpawnFn<'_>,
    ) -> IpcmResult<Self> {
        let max_buffered = max_buffered.max(1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                scheduler: Scheduler::new(),
                reader_active: false,
                source_done: false,
                started: 0,
                exited: 0,
            }),
            work: Condvar::new(),
            lifecycle: Condvar::new(),
            source,
            router,
            correlator,
            max_buffered,
            max_backlog: max_buffered.saturating_mul(BACKLOG_FACTOR),
            counters: Counters::default(),
        });

        let mut handles = Vec::with_capacity(config.count);
        for worker in 0..config.count {
            let worker_shared = Arc::clone(&shared);
            let builder = thread::Builder::new().name(format!("ipcm-worker-{worker}"));
            match spawn(builder, Box::new(move || run_worker(worker_shared, worker))) {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(worker, error = %e, "[pool] Failed to spawn worker"),
            }
        }

        let pool = Self { shared, handles };
        let spawned = pool.handles.len();
        let required = config.min_workers.max(1);
        if spawned < required {
            let report = pool.stop(config.join_timeout);
            error!(spawned, required, ?report.outcome, "[pool] Startup aborted");
            return Err(IpcmError::StartupFailure(format!(
                "spawned {spawned} of {} workers, at least {required} required",
                config.count
            )));
        }

        // Startup latch: wait until every spawned worker reached its loop.
        let deadline = Instant::now() + config.join_timeout;
        let started = {
            let mut state = pool.shared.state.lock();
            while state.started < spawned {
                if pool
                    .shared
                    .lifecycle
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            state.started
        };
        if started < required {
            let report = pool.stop(config.join_timeout);
            error!(started, required, ?report.outcome, "[pool] Workers did not come up");
            return Err(IpcmError::StartupFailure(format!(
                "only {started} of {spawned} workers confirmed running"
            )));
        }

        info!(workers = spawned, max_buffered, "[pool] Workers running");
        Ok(pool)
    }

    /// Close the source and join the workers, waiting at most `timeout`.
    pub fn stop(mut self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + timeout;
        let total = self.handles.len();
        self.shared.source.request_shutdown();

        let exited = {
            let mut state = self.shared.state.lock();
            // Wake idle workers so they observe the closed source promptly.
            self.shared.work.notify_all();
            while state.exited < total {
                if self
                    .shared
                    .lifecycle
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            state.exited
        };

        let abandoned = total.saturating_sub(exited);
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("ipcm-worker").to_string();
            if abandoned == 0 || handle.is_finished() {
                if handle.join().is_err() {
                    error!(thread = %name, "[pool] Worker thread panicked outside a handler");
                }
            } else {
                // Rust cannot kill a thread; a stuck worker is detached.
                warn!(thread = %name, "[pool] Worker did not exit in time, detaching");
            }
        }

        let outcome = if abandoned == 0 {
            ShutdownOutcome::Graceful
        } else {
            ShutdownOutcome::Degraded { abandoned }
        };
        let report = ShutdownReport {
            outcome,
            elapsed: started.elapsed(),
            stats: self.shared.counters.snapshot(),
        };
        info!(
            ?report.outcome,
            elapsed_ms = report.elapsed.as_millis() as u64,
            dispatched = report.stats.dispatched,
            "[pool] Stopped"
        );
        report
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.counters.snapshot()
    }

    /// Events read but not yet started.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().scheduler.buffered()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            // Dropped without stop(): let the workers wind down on their own.
            self.shared.source.request_shutdown();
        }
    }
}
