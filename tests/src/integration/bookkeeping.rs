//! # Registry and Correlator Tests
//!
//! Invariants of the shared tables under concurrent access:
//!
//! - An IPC process id is registered at most once
//! - A port belongs to at most one non-closed flow
//! - A pending request is resolved exactly once; later completions are
//!   reported as unknown

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use ipcm_core::{Correlator, EntityRegistry, OperationKind, RequestContext};
    use ipcm_types::{
        ApplicationName, CorrelationId, FlowState, IpcmError, Outcome, PortId, ProcessId,
        ProcessSpec, ProcessState, Resolution,
    };
    use proptest::prelude::*;

    // =========================================================================
    // TEST FIXTURES
    // =========================================================================

    fn active(registry: &EntityRegistry, id: u16) -> ProcessId {
        let spec = ProcessSpec::normal(id, format!("ipcp.{id}"), "normal.DIF");
        registry.create_process(&spec).unwrap();
        registry.activate_process(spec.id).unwrap();
        spec.id
    }

    fn app(name: &str) -> ApplicationName {
        ApplicationName::new(name)
    }

    fn correlator() -> Arc<Correlator> {
        Arc::new(Correlator::new(
            Duration::from_secs(30),
            Duration::from_millis(10),
        ))
    }

    // =========================================================================
    // REGISTRY
    // =========================================================================

    #[test]
    fn test_concurrent_creates_register_once() {
        let registry = Arc::new(EntityRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    registry.create_process(&ProcessSpec::normal(7, "ipcp.7", "normal.DIF"))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == IpcmError::DuplicateEntity(ProcessId(7))));
        assert_eq!(registry.process_count(), 1);
    }

    #[test]
    fn test_process_lifecycle_and_unknown_entity() {
        let registry = EntityRegistry::new();
        let id = active(&registry, 1);
        assert_eq!(registry.lookup(id).unwrap().state, ProcessState::Active);

        assert!(registry.destroy_process(id, false).unwrap().is_empty());
        assert!(registry.lookup(id).is_none());
        assert_eq!(
            registry.destroy_process(id, false),
            Err(IpcmError::UnknownEntity(id))
        );
        assert_eq!(
            registry.activate_process(id),
            Err(IpcmError::UnknownEntity(id))
        );
        assert_eq!(registry.list_flows(id), Err(IpcmError::UnknownEntity(id)));
    }

    #[test]
    fn test_duplicate_port_leaves_existing_flow_untouched() {
        let registry = EntityRegistry::new();
        let first = active(&registry, 1);
        let second = active(&registry, 2);

        let flow = registry
            .allocate_flow(first, PortId(40), Some(app("echo")), app("client"))
            .unwrap();
        assert_eq!(
            registry.allocate_flow(second, PortId(40), Some(app("other")), app("peer")),
            Err(IpcmError::DuplicatePort {
                port_id: PortId(40),
                owner: first,
            })
        );
        assert_eq!(registry.flow(PortId(40)), Some(flow));
        assert!(registry.list_flows(second).unwrap().is_empty());
    }

    #[test]
    fn test_forced_destroy_closes_flows_and_frees_ports() {
        let registry = EntityRegistry::new();
        let owner = active(&registry, 1);
        let other = active(&registry, 2);
        for port in [10, 11, 12] {
            registry
                .allocate_flow(owner, PortId(port), Some(app("echo")), app("client"))
                .unwrap();
        }

        assert_eq!(
            registry.begin_teardown(owner, false),
            Err(IpcmError::EntityBusy {
                process_id: owner,
                open_flows: 3,
            })
        );
        let closed = registry.destroy_process(owner, true).unwrap();
        assert_eq!(closed.len(), 3);
        assert!(closed.iter().all(|f| f.state == FlowState::Closed));
        assert!(registry.owner_of(PortId(11)).is_none());

        registry
            .allocate_flow(other, PortId(11), Some(app("echo")), app("client"))
            .unwrap();
        assert_eq!(registry.owner_of(PortId(11)), Some(other));
    }

    #[test]
    fn test_flow_state_machine_rejects_skipped_steps() {
        let registry = EntityRegistry::new();
        let owner = active(&registry, 1);
        registry
            .reserve_flow(owner, PortId(5), Some(app("echo")), app("client"))
            .unwrap();

        assert!(matches!(
            registry.begin_deallocation(PortId(5)),
            Err(IpcmError::InvalidState(_))
        ));
        assert_eq!(
            registry.confirm_flow(PortId(5)).unwrap().state,
            FlowState::Allocated
        );
        assert_eq!(
            registry.begin_deallocation(PortId(5)).unwrap().state,
            FlowState::Deallocating
        );
        assert_eq!(
            registry.close_flow(PortId(5)).unwrap().state,
            FlowState::Closed
        );
        assert_eq!(
            registry.close_flow(PortId(5)),
            Err(IpcmError::UnknownPort(PortId(5)))
        );
    }

    // =========================================================================
    // CORRELATOR
    // =========================================================================

    #[test]
    fn test_racing_completions_resolve_once() {
        let correlator = correlator();
        let ticket = correlator.issue(
            OperationKind::CreateProcess,
            RequestContext::management().with_process(ProcessId(1)),
        );
        let id = ticket.id();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let correlator = Arc::clone(&correlator);
                thread::spawn(move || {
                    correlator
                        .resolve(id, Outcome::Success(Resolution::Done))
                        .is_ok()
                })
            })
            .collect();
        let accepted: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();

        assert_eq!(accepted, 1);
        assert_eq!(
            correlator.await_outcome(ticket, Duration::from_secs(1)),
            Outcome::Success(Resolution::Done)
        );
        let stats = correlator.stats();
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.unknown, 7);
    }

    #[test]
    fn test_completion_after_caller_timeout_is_unknown() {
        let correlator = correlator();
        let ticket = correlator.issue(OperationKind::AllocateFlow, RequestContext::management());
        let id = ticket.id();

        assert_eq!(
            correlator.await_outcome(ticket, Duration::from_millis(20)),
            Outcome::Timeout
        );
        assert_eq!(
            correlator.resolve(id, Outcome::Success(Resolution::Done)),
            Err(IpcmError::UnknownCorrelation(id))
        );
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_sweep_evicts_expired_requests() {
        let correlator = Correlator::new(Duration::from_millis(20), Duration::from_millis(1));
        let ticket = correlator.issue(OperationKind::DestroyProcess, RequestContext::management());
        let id = ticket.id();

        thread::sleep(Duration::from_millis(40));
        assert_eq!(correlator.sweep_expired(Instant::now()), vec![id]);
        assert_eq!(
            correlator.await_outcome(ticket, Duration::from_secs(1)),
            Outcome::Timeout
        );
        assert!(matches!(
            correlator.claim(id),
            Err(IpcmError::UnknownCorrelation(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_issued_ids_are_unique_and_nonzero(count in 1usize..200) {
            let correlator = correlator();
            let tickets: Vec<_> = (0..count)
                .map(|_| correlator.issue(OperationKind::RegisterApplication, RequestContext::runtime()))
                .collect();
            let ids: HashSet<CorrelationId> = tickets.iter().map(|t| t.id()).collect();
            prop_assert_eq!(ids.len(), count);
            prop_assert!(!ids.contains(&CorrelationId(0)));
            prop_assert_eq!(correlator.len(), count);
        }
    }
}
