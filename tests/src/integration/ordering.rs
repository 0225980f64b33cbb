//! # Dispatch Ordering Tests
//!
//! Drives a [`WorkerPool`] directly through the event source adapter and
//! records, per ordering key, the order in which handlers ran.
//!
//! ## Properties
//!
//! - Events of one key run one at a time, in arrival order
//! - Events naming one port run in arrival order, whether the router keyed
//!   them by process or by port
//! - A slow handler holds back only its own key, even once its backlog
//!   fills the buffer
//! - A failing or panicking handler releases its key for the next event

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use ipcm_bus::{EventSourceAdapter, LoopbackRuntime};
    use ipcm_core::{Correlator, EntityRegistry};
    use ipcm_runtime::{
        DispatchRouter, EventHandler, HandlerTable, ShutdownOutcome, WorkerConfig, WorkerPool,
    };
    use ipcm_types::{
        ApplicationName, CorrelationId, Event, EventTag, IpcmError, IpcmResult, PortId,
        ProcessId, ProcessSpec,
    };
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    // =========================================================================
    // TEST FIXTURES
    // =========================================================================

    /// Per-key execution trace shared with the handler.
    #[derive(Default)]
    struct Trace {
        order: Mutex<Vec<(u16, u32)>>,
        running: Mutex<HashSet<u16>>,
        overlaps: AtomicUsize,
    }

    impl Trace {
        fn record(&self, event: &Event, work: Duration) {
            self.record_as(key_and_seq(event), work);
        }

        fn record_as(&self, (key, seq): (u16, u32), work: Duration) {
            if !self.running.lock().insert(key) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            if !work.is_zero() {
                thread::sleep(work);
            }
            self.order.lock().push((key, seq));
            self.running.lock().remove(&key);
        }

        fn len(&self) -> usize {
            self.order.lock().len()
        }

        fn count_for(&self, key: u16) -> usize {
            self.order.lock().iter().filter(|(k, _)| *k == key).count()
        }

        /// Sequence numbers grouped by key, in execution order.
        fn by_key(&self) -> BTreeMap<u16, Vec<u32>> {
            let mut grouped: BTreeMap<u16, Vec<u32>> = BTreeMap::new();
            for (key, seq) in self.order.lock().iter() {
                grouped.entry(*key).or_default().push(*seq);
            }
            grouped
        }

        fn assert_in_arrival_order(&self) {
            assert_eq!(self.overlaps.load(Ordering::SeqCst), 0, "a key ran concurrently");
            for (key, seqs) in self.by_key() {
                assert!(
                    seqs.windows(2).all(|pair| pair[0] < pair[1]),
                    "key {key} ran out of order: {seqs:?}"
                );
            }
        }
    }

    /// An event keyed by process `key`, carrying its arrival number.
    fn keyed(key: u16, seq: u32) -> Event {
        Event::ProcessTerminated {
            correlation_id: Some(CorrelationId(seq)),
            process_id: ProcessId(key),
            result: Ok(()),
        }
    }

    fn key_and_seq(event: &Event) -> (u16, u32) {
        match event {
            Event::ProcessTerminated {
                correlation_id: Some(seq),
                process_id,
                ..
            } => (process_id.0, seq.0),
            other => panic!("unexpected event {other:?}"),
        }
    }

    /// A flow event for `port`, carrying its arrival number. `owner` set means
    /// an allocation completed by that process; `None` a port-only
    /// deallocation.
    fn port_event(owner: Option<u16>, port: u16, seq: u32) -> Event {
        match owner {
            Some(process) => Event::FlowAllocationCompleted {
                correlation_id: CorrelationId(seq),
                process_id: Some(ProcessId(process)),
                port_id: Some(PortId(u32::from(port))),
                result: Ok(()),
            },
            None => Event::FlowDeallocated {
                correlation_id: Some(CorrelationId(seq)),
                process_id: None,
                port_id: PortId(u32::from(port)),
                result: Ok(()),
            },
        }
    }

    fn port_and_seq(event: &Event) -> (u16, u32) {
        match event {
            Event::FlowAllocationCompleted {
                correlation_id,
                port_id: Some(port),
                ..
            } => (port.0 as u16, correlation_id.0),
            Event::FlowDeallocated {
                correlation_id: Some(seq),
                port_id,
                ..
            } => (port_id.0 as u16, seq.0),
            other => panic!("unexpected event {other:?}"),
        }
    }

    /// Registry with IPC processes 1 to 3 active, and port 9 owned by 3.
    fn flow_registry() -> Arc<EntityRegistry> {
        let registry = Arc::new(EntityRegistry::new());
        for id in 1..=3 {
            let spec = ProcessSpec::normal(id, format!("ipcp.{id}"), "normal.DIF");
            registry.create_process(&spec).unwrap();
            registry.activate_process(spec.id).unwrap();
        }
        registry
            .allocate_flow(
                ProcessId(3),
                PortId(9),
                None,
                ApplicationName::new("rina.apps.peer"),
            )
            .unwrap();
        registry
    }

    fn start_pool<H>(workers: usize, handler: H) -> (WorkerPool, Arc<EventSourceAdapter>)
    where
        H: EventHandler + 'static,
    {
        let table = HandlerTable::builder()
            .on(EventTag::ProcessTerminated, handler)
            .build();
        start_pool_with(workers, 16, DispatchRouter::standalone(table))
    }

    fn start_pool_with(
        workers: usize,
        max_buffered: usize,
        router: DispatchRouter,
    ) -> (WorkerPool, Arc<EventSourceAdapter>) {
        let loopback = Arc::new(LoopbackRuntime::new(64));
        let source = Arc::new(EventSourceAdapter::new(
            loopback,
            64,
            Duration::from_millis(5),
        ));
        let router = Arc::new(router);
        let correlator = Arc::new(Correlator::new(
            Duration::from_secs(30),
            Duration::from_secs(1),
        ));
        let config = WorkerConfig {
            count: workers,
            min_workers: 1,
            join_timeout: Duration::from_secs(5),
            idle_poll: Duration::from_millis(5),
        };
        let pool = WorkerPool::start(&config, max_buffered, Arc::clone(&source), router, correlator)
            .expect("pool starts");
        (pool, source)
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

    // =========================================================================
    // ORDERING
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn test_per_key_order_holds_for_any_interleaving(
            keys in proptest::collection::vec(0u16..6, 1..120),
            workers in 1usize..6,
        ) {
            let trace = Arc::new(Trace::default());
            let recorder = Arc::clone(&trace);
            let (pool, source) = start_pool(workers, move |event: Event| -> IpcmResult<()> {
                recorder.record(&event, Duration::ZERO);
                Ok(())
            });

            for (seq, key) in keys.iter().enumerate() {
                source.inject(keyed(*key, seq as u32)).expect("source open");
            }
            prop_assert!(wait_for(Duration::from_secs(10), || trace.len() == keys.len()));

            let report = pool.stop(Duration::from_secs(5));
            prop_assert!(report.is_graceful());
            prop_assert_eq!(report.stats.dispatched, keys.len() as u64);
            prop_assert_eq!(trace.overlaps.load(Ordering::SeqCst), 0);
            for (key, seqs) in trace.by_key() {
                prop_assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]), "key {} out of order", key);
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn test_per_port_order_holds_across_process_and_port_keys(
            events in proptest::collection::vec(
                (proptest::option::of(1u16..=3), prop_oneof![0u16..4, Just(9u16)]),
                1..80,
            ),
            workers in 2usize..6,
        ) {
            let trace = Arc::new(Trace::default());
            let on_alloc = Arc::clone(&trace);
            let on_dealloc = Arc::clone(&trace);
            let table = HandlerTable::builder()
                .on(EventTag::FlowAllocationCompleted, move |event: Event| -> IpcmResult<()> {
                    on_alloc.record_as(port_and_seq(&event), Duration::from_micros(200));
                    Ok(())
                })
                .on(EventTag::FlowDeallocated, move |event: Event| -> IpcmResult<()> {
                    on_dealloc.record_as(port_and_seq(&event), Duration::from_micros(200));
                    Ok(())
                })
                .build();
            let (pool, source) =
                start_pool_with(workers, 16, DispatchRouter::new(table, flow_registry()));

            for (seq, (owner, port)) in events.iter().enumerate() {
                source.inject(port_event(*owner, *port, seq as u32 + 1)).expect("source open");
            }
            prop_assert!(wait_for(Duration::from_secs(10), || trace.len() == events.len()));

            let report = pool.stop(Duration::from_secs(5));
            prop_assert!(report.is_graceful());
            prop_assert_eq!(report.stats.dispatched, events.len() as u64);
            prop_assert_eq!(trace.overlaps.load(Ordering::SeqCst), 0);
            for (port, seqs) in trace.by_key() {
                prop_assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]), "port {} out of order", port);
            }
        }
    }

    #[test]
    fn test_thousand_events_over_ten_entities() {
        let mut rng = StdRng::seed_from_u64(0x1bc);
        let keys: Vec<u16> = (0..1000).map(|_| rng.gen_range(0..10)).collect();

        let trace = Arc::new(Trace::default());
        let recorder = Arc::clone(&trace);
        let (pool, source) = start_pool(4, move |event: Event| -> IpcmResult<()> {
            recorder.record(&event, Duration::ZERO);
            Ok(())
        });

        for (seq, key) in keys.iter().enumerate() {
            source.inject(keyed(*key, seq as u32)).unwrap();
        }
        assert!(wait_for(Duration::from_secs(20), || trace.len() == 1000));

        let report = pool.stop(Duration::from_secs(5));
        assert!(report.is_graceful());
        assert_eq!(report.stats.dispatched, 1000);
        assert_eq!(report.stats.failed, 0);
        assert_eq!(report.stats.panicked, 0);
        trace.assert_in_arrival_order();
        for key in 0..10 {
            let expected = keys.iter().filter(|k| **k == key).count();
            assert_eq!(trace.count_for(key), expected, "key {key}");
        }
    }

    // =========================================================================
    // LIVENESS
    // =========================================================================

    #[test]
    fn test_slow_handler_does_not_block_other_keys() {
        let trace = Arc::new(Trace::default());
        let slow_done = Arc::new(AtomicBool::new(false));
        let recorder = Arc::clone(&trace);
        let flag = Arc::clone(&slow_done);
        let (pool, source) = start_pool(2, move |event: Event| -> IpcmResult<()> {
            let (key, _) = key_and_seq(&event);
            if key == 0 {
                recorder.record(&event, Duration::from_secs(2));
                flag.store(true, Ordering::SeqCst);
            } else {
                recorder.record(&event, Duration::ZERO);
            }
            Ok(())
        });

        source.inject(keyed(0, 0)).unwrap();
        for seq in 1..=50 {
            source.inject(keyed(1, seq)).unwrap();
        }

        assert!(wait_for(Duration::from_millis(1500), || trace.count_for(1) == 50));
        assert!(!slow_done.load(Ordering::SeqCst));

        let report = pool.stop(Duration::from_secs(5));
        assert!(report.is_graceful());
        assert!(slow_done.load(Ordering::SeqCst));
        trace.assert_in_arrival_order();
    }

    #[test]
    fn test_full_buffer_of_one_key_does_not_starve_others() {
        let trace = Arc::new(Trace::default());
        let release = Arc::new(AtomicBool::new(false));
        let recorder = Arc::clone(&trace);
        let gate = Arc::clone(&release);
        let table = HandlerTable::builder()
            .on(EventTag::ProcessTerminated, move |event: Event| -> IpcmResult<()> {
                let (key, _) = key_and_seq(&event);
                if key == 0 {
                    while !gate.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(2));
                    }
                }
                recorder.record(&event, Duration::ZERO);
                Ok(())
            })
            .build();
        let (pool, source) = start_pool_with(4, 4, DispatchRouter::standalone(table));

        // Key 0 alone holds more events than the buffer bound.
        for seq in 0..10 {
            source.inject(keyed(0, seq)).unwrap();
        }
        for seq in 10..40 {
            source.inject(keyed(1 + (seq % 5) as u16, seq)).unwrap();
        }

        let others_done = wait_for(Duration::from_secs(2), || trace.len() == 30);
        assert_eq!(trace.count_for(0), 0);
        release.store(true, Ordering::SeqCst);
        assert!(others_done, "keys 1-5 stalled behind key 0");

        assert!(wait_for(Duration::from_secs(5), || trace.len() == 40));
        let report = pool.stop(Duration::from_secs(5));
        assert!(report.is_graceful());
        assert_eq!(report.stats.dispatched, 40);
        trace.assert_in_arrival_order();
    }

    #[test]
    fn test_failing_handlers_release_their_key() {
        let trace = Arc::new(Trace::default());
        let recorder = Arc::clone(&trace);
        let (pool, source) = start_pool(3, move |event: Event| -> IpcmResult<()> {
            let (_, seq) = key_and_seq(&event);
            recorder.record(&event, Duration::ZERO);
            match seq % 10 {
                3 => panic!("handler panicked on {seq}"),
                7 => Err(IpcmError::InvalidState(format!("refused {seq}"))),
                _ => Ok(()),
            }
        });

        for seq in 0..60u32 {
            source.inject(keyed((seq % 2) as u16, seq)).unwrap();
        }
        assert!(wait_for(Duration::from_secs(5), || trace.len() == 60));

        let report = pool.stop(Duration::from_secs(5));
        assert_eq!(report.outcome, ShutdownOutcome::Graceful);
        assert_eq!(report.stats.dispatched, 60);
        assert_eq!(report.stats.panicked, 6);
        assert_eq!(report.stats.failed, 6);
        trace.assert_in_arrival_order();
    }

    #[test]
    fn test_unhandled_tags_are_counted_and_skipped() {
        let trace = Arc::new(Trace::default());
        let recorder = Arc::clone(&trace);
        let (pool, source) = start_pool(2, move |event: Event| -> IpcmResult<()> {
            recorder.record(&event, Duration::ZERO);
            Ok(())
        });

        source
            .inject(Event::Error {
                message: "no handler for this".into(),
            })
            .unwrap();
        source.inject(keyed(4, 1)).unwrap();
        assert!(wait_for(Duration::from_secs(2), || trace.len() == 1));

        let report = pool.stop(Duration::from_secs(5));
        assert_eq!(report.stats.unhandled, 1);
        assert_eq!(report.stats.dispatched, 1);
    }
}
