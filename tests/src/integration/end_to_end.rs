//! # End-to-End Tests
//!
//! The manager facade over the loopback runtime, with native records pushed
//! the way a kernel runtime would deliver them.
//!
//! ## Flow
//!
//! ```text
//! test ──push(NativeEvent)──→ LoopbackRuntime ──→ EventSourceAdapter
//!                                   ▲                     │
//!                     completions   │                     ▼
//!                                   └── handlers ←── WorkerPool
//!                                         │
//!                                         ├──→ EntityRegistry
//!                                         └──→ notifications
//! ```

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use ipcm_bus::{LoopbackRuntime, NativeEvent, Notification};
    use ipcm_runtime::{IpcManager, ManagerConfig, ManagerState};
    use ipcm_types::{
        ApplicationName, DifName, FlowState, IpcmError, PortId, ProcessId, ProcessSpec,
        ProcessState,
    };

    // =========================================================================
    // TEST FIXTURES
    // =========================================================================

    fn config() -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config.workers.count = 3;
        config.workers.idle_poll = Duration::from_millis(5);
        config.correlator.request_timeout = Duration::from_secs(2);
        config
            .dif_directory
            .insert("rina.apps.echo".into(), DifName::new("normal.DIF"));
        config
    }

    fn start(config: ManagerConfig) -> (Arc<IpcManager>, Arc<LoopbackRuntime>) {
        let manager = IpcManager::builder().config(config).build().unwrap();
        manager.start().unwrap();
        let loopback = Arc::clone(manager.loopback().unwrap());
        (Arc::new(manager), loopback)
    }

    fn with_process(manager: &IpcManager, id: u16) -> ProcessId {
        manager
            .create_process(ProcessSpec::normal(id, format!("ipcp.{id}"), "normal.DIF"))
            .unwrap()
            .id
    }

    fn echo() -> ApplicationName {
        ApplicationName::new("rina.apps.echo")
    }

    fn client() -> ApplicationName {
        ApplicationName::new("rina.apps.client")
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

    fn remote_request(sequence: u32, ipcp_id: u16, port_id: i32) -> NativeEvent {
        NativeEvent::FlowRequestArrived {
            sequence,
            ipcp_id: Some(ipcp_id),
            local_application: echo(),
            remote_application: client(),
            dif: Some("normal.DIF".into()),
            port_id,
            local_request: false,
        }
    }

    // =========================================================================
    // FLOWS
    // =========================================================================

    #[test]
    fn test_remote_flow_request_is_offered_and_accepted() {
        let (manager, loopback) = start(config());
        let ipcp = with_process(&manager, 1);

        loopback.push(remote_request(7, 1, 4000)).unwrap();
        assert!(wait_for(Duration::from_secs(2), || {
            loopback.notifications().contains(&Notification::FlowAllocationResponse {
                process_id: ipcp,
                port_id: PortId(4000),
                accepted: true,
            })
        }));

        let flows = manager.list_flows(ipcp).unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].state, FlowState::Allocated);
        assert_eq!(flows[0].local_application, Some(echo()));
        assert!(manager.stop(Duration::from_secs(2)).is_graceful());
    }

    #[test]
    fn test_refused_offer_releases_port() {
        let (manager, loopback) = start(config());
        let ipcp = with_process(&manager, 1);
        loopback.set_result_code("notify_flow_request", -1);

        loopback.push(remote_request(8, 1, 4001)).unwrap();
        assert!(wait_for(Duration::from_secs(2), || {
            loopback.notifications().contains(&Notification::FlowAllocationResponse {
                process_id: ipcp,
                port_id: PortId(4001),
                accepted: false,
            })
        }));
        assert!(manager.list_flows(ipcp).unwrap().is_empty());
        assert!(manager.all_flows().is_empty());
    }

    #[test]
    fn test_local_flow_request_is_served_by_directory_dif() {
        let (manager, loopback) = start(config());
        let ipcp = with_process(&manager, 1);

        loopback
            .push(NativeEvent::FlowRequestArrived {
                sequence: 3,
                ipcp_id: None,
                local_application: echo(),
                remote_application: client(),
                dif: None,
                port_id: -1,
                local_request: true,
            })
            .unwrap();

        assert!(wait_for(Duration::from_secs(2), || {
            loopback.notifications().iter().any(|n| {
                matches!(n, Notification::FlowAllocated { port_id: Some(_), .. })
            })
        }));
        let flows = manager.list_flows(ipcp).unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].remote_application, client());
    }

    #[test]
    fn test_flow_request_without_process_is_refused() {
        let (manager, loopback) = start(config());

        loopback
            .push(NativeEvent::FlowRequestArrived {
                sequence: 4,
                ipcp_id: None,
                local_application: echo(),
                remote_application: client(),
                dif: None,
                port_id: -1,
                local_request: true,
            })
            .unwrap();

        assert!(wait_for(Duration::from_secs(2), || {
            loopback.notifications().contains(&Notification::FlowAllocated {
                application: echo(),
                remote_application: client(),
                port_id: None,
            })
        }));
        assert_eq!(
            manager.allocate_flow(echo(), client(), None),
            Err(IpcmError::NoProcessAvailable {
                dif: Some("normal.DIF".into())
            })
        );
    }

    #[test]
    fn test_allocate_and_deallocate_round() {
        let (manager, loopback) = start(config());
        let ipcp = with_process(&manager, 1);

        let flow = manager.allocate_flow(echo(), client(), None).unwrap();
        assert_eq!(flow.process_id, ipcp);
        assert_eq!(flow.state, FlowState::Allocated);

        let closed = manager.deallocate_flow(flow.port_id).unwrap();
        assert_eq!(closed.state, FlowState::Closed);
        assert!(manager.all_flows().is_empty());
        assert_eq!(
            manager.deallocate_flow(flow.port_id),
            Err(IpcmError::UnknownPort(flow.port_id))
        );
    }

    // =========================================================================
    // PROCESS TERMINATION
    // =========================================================================

    #[test]
    fn test_daemon_exit_closes_flows_and_notifies_applications() {
        let (manager, loopback) = start(config());
        let ipcp = with_process(&manager, 1);
        let survivor = with_process(&manager, 2);
        let flow = manager
            .allocate_flow(echo(), client(), Some(DifName::new("normal.DIF")))
            .unwrap();
        assert_eq!(flow.process_id, ipcp);

        loopback
            .push(NativeEvent::IpcProcessDaemonTerminated { ipcp_id: 1 })
            .unwrap();
        assert!(wait_for(Duration::from_secs(2), || manager
            .lookup_process(ipcp)
            .is_none()));

        assert!(loopback.notifications().contains(&Notification::FlowDeallocated {
            application: Some(echo()),
            port_id: flow.port_id,
        }));
        assert!(manager.all_flows().is_empty());
        assert_eq!(
            manager.lookup_process(survivor).unwrap().state,
            ProcessState::Active
        );
    }

    #[test]
    fn test_busy_process_needs_force() {
        let (manager, _) = start(config());
        let ipcp = with_process(&manager, 1);
        manager.allocate_flow(echo(), client(), None).unwrap();

        assert!(matches!(
            manager.destroy_process(ipcp, false),
            Err(IpcmError::EntityBusy { open_flows: 1, .. })
        ));
        manager.destroy_process(ipcp, true).unwrap();
        assert!(manager.list_processes().is_empty());
        assert!(manager.all_flows().is_empty());
    }

    // =========================================================================
    // RUNTIME FAULTS
    // =========================================================================

    #[test]
    fn test_mismatched_ack_fails_call_without_stopping() {
        let (manager, loopback) = start(config());
        loopback.set_mangle_acks(true);

        assert!(matches!(
            manager.create_process(ProcessSpec::normal(1, "ipcp.1", "normal.DIF")),
            Err(IpcmError::RuntimeAdapterFailure(_))
        ));
        assert!(manager.lookup_process(ProcessId(1)).is_none());
        assert!(wait_for(Duration::from_secs(2), || manager
            .correlator_stats()
            .unknown
            >= 1));
        assert_eq!(manager.state(), ManagerState::Running);

        loopback.set_mangle_acks(false);
        with_process(&manager, 1);
    }

    #[test]
    fn test_stray_completion_is_not_fatal() {
        let (manager, loopback) = start(config());
        loopback
            .push(NativeEvent::IpcProcessCreateResult {
                sequence: 9_999,
                ipcp_id: 9,
                result: 0,
            })
            .unwrap();
        assert!(wait_for(Duration::from_secs(2), || manager
            .correlator_stats()
            .unknown
            == 1));

        with_process(&manager, 1);
        assert_eq!(manager.state(), ManagerState::Running);
    }

    #[test]
    fn test_unanswered_request_times_out() {
        let mut config = config();
        config.correlator.request_timeout = Duration::from_millis(100);
        config.loopback.auto_complete = false;
        let (manager, _) = start(config);

        assert!(matches!(
            manager.create_process(ProcessSpec::normal(1, "ipcp.1", "normal.DIF")),
            Err(IpcmError::Timeout(_))
        ));
        assert!(manager.list_processes().is_empty());
        assert!(manager.pending_requests().is_empty());
    }

    #[test]
    fn test_native_read_failure_escalates_to_shutdown() {
        let mut config = config();
        config.loopback.auto_complete = false;
        config.correlator.request_timeout = Duration::from_secs(10);
        let (manager, loopback) = start(config);

        let caller = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.create_process(ProcessSpec::normal(1, "ipcp.1", "normal.DIF")))
        };
        assert!(wait_for(Duration::from_secs(2), || manager
            .pending_requests()
            .len()
            == 1));

        loopback.fail_next_read("driver detached");
        assert!(manager.shutdown_handle().wait(Duration::from_secs(2)));
        assert_eq!(manager.state(), ManagerState::Stopping);
        assert!(matches!(
            caller.join().unwrap(),
            Err(IpcmError::RuntimeAdapterFailure(_))
        ));

        let report = manager.stop(Duration::from_secs(2));
        assert!(report.is_graceful());
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    #[test]
    fn test_registration_request_from_runtime() {
        let (manager, loopback) = start(config());
        with_process(&manager, 1);

        loopback
            .push(NativeEvent::ApplicationRegistrationRequest {
                application: echo(),
                dif: None,
            })
            .unwrap();
        assert!(wait_for(Duration::from_secs(2), || {
            loopback.notifications().contains(&Notification::RegistrationResult {
                application: echo(),
                dif: Some(DifName::new("normal.DIF")),
                success: true,
            })
        }));

        let registrations = manager.list_registrations();
        assert_eq!(registrations.len(), 1);
        assert!(registrations[0].difs.contains(&DifName::new("normal.DIF")));

        manager
            .unregister_application(echo(), DifName::new("normal.DIF"))
            .unwrap();
        assert!(matches!(
            manager.unregister_application(echo(), DifName::new("normal.DIF")),
            Err(IpcmError::InvalidState(_))
        ));
    }
}
