//! # Shutdown Tests
//!
//! Stop semantics of the manager with handlers still running.
//!
//! ```text
//! stop(5s)   + handler busy 2s  →  Graceful, every worker joined
//! stop(100ms)+ handler busy 5s  →  Degraded { abandoned: 1 },
//!                                  waiting callers get Cancelled
//! ```

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use ipcm_runtime::{IpcManager, ManagerConfig, ManagerState, ShutdownOutcome};
    use ipcm_types::{Event, EventTag, IpcmError, IpcmResult, ProcessSpec};

    // =========================================================================
    // TEST FIXTURES
    // =========================================================================

    fn config() -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config.workers.count = 2;
        config.workers.min_workers = 1;
        config.workers.idle_poll = Duration::from_millis(5);
        config.correlator.request_timeout = Duration::from_secs(30);
        config
    }

    fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    fn dispatched(manager: &IpcManager) -> u64 {
        manager.pool_stats().map_or(0, |stats| stats.dispatched)
    }

    // =========================================================================
    // GRACEFUL
    // =========================================================================

    #[test]
    fn test_stop_waits_for_running_handler() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let manager = IpcManager::builder()
            .config(config())
            .handler(EventTag::Error, move |_: Event| -> IpcmResult<()> {
                thread::sleep(Duration::from_secs(2));
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();
        manager.start().unwrap();

        manager
            .submit(Event::Error {
                message: "slow".into(),
            })
            .unwrap();
        assert!(wait_for(Duration::from_secs(1), || dispatched(&manager) == 1));

        let report = manager.stop(Duration::from_secs(5));
        assert_eq!(report.outcome, ShutdownOutcome::Graceful);
        assert!(report.elapsed >= Duration::from_millis(500));
        assert!(report.elapsed < Duration::from_secs(5));
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[test]
    fn test_idle_stop_is_prompt() {
        let manager = IpcManager::builder().config(config()).build().unwrap();
        manager.start().unwrap();

        let report = manager.stop(Duration::from_secs(5));
        assert!(report.is_graceful());
        assert!(report.elapsed < Duration::from_secs(1));
        assert_eq!(report.stats.dispatched, 0);
    }

    // =========================================================================
    // DEGRADED
    // =========================================================================

    #[test]
    fn test_stop_deadline_abandons_stuck_worker_and_cancels_callers() {
        let manager = Arc::new(
            IpcManager::builder()
                .config(config())
                .handler(EventTag::ProcessCreated, |_: Event| -> IpcmResult<()> {
                    thread::sleep(Duration::from_secs(5));
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        manager.start().unwrap();

        let caller = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.create_process(ProcessSpec::normal(1, "ipcp.1", "normal.DIF")))
        };
        assert!(wait_for(Duration::from_secs(2), || dispatched(&manager) == 1));
        assert_eq!(manager.pending_requests().len(), 1);

        let report = manager.stop(Duration::from_millis(100));
        assert_eq!(report.outcome, ShutdownOutcome::Degraded { abandoned: 1 });
        assert!(report.elapsed < Duration::from_secs(2));

        let result = caller.join().unwrap();
        assert!(matches!(result, Err(IpcmError::Cancelled(_))));
        assert!(manager.pending_requests().is_empty());
        assert!(manager.lookup_process(ipcm_types::ProcessId(1)).is_none());
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[test]
    fn test_operations_after_stop_report_shut_down() {
        let manager = IpcManager::builder().config(config()).build().unwrap();
        manager.start().unwrap();
        manager.stop(Duration::from_secs(1));

        assert_eq!(
            manager.create_process(ProcessSpec::normal(1, "ipcp.1", "normal.DIF")),
            Err(IpcmError::ShutDown)
        );
        assert_eq!(manager.start(), Err(IpcmError::ShutDown));
        assert!(manager.list_processes().is_empty());
    }
}
