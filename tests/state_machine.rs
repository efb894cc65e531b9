mod tests {
    use ambient_board::BoardError;
    use ambient_board::controller::timeout_event;
    use ambient_board::state_machine::{
        EVENT_QUEUE_DEPTH, StateMachine, StateTimeouts, SystemEvent, SystemState,
        TransitionHandler, transition,
    };
    use core::cell::RefCell;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_futures::select::select;
    use embassy_time::{Duration, Instant, Timer};

    /// Records callbacks. Timeouts are turned into failure events the way
    /// the board controller does it.
    #[derive(Default)]
    struct Recorder {
        transitions: RefCell<Vec<(SystemState, SystemState)>>,
        timeouts: RefCell<Vec<SystemState>>,
        /// Event to queue from the callback on entering a state
        chain: Option<(SystemState, SystemEvent)>,
    }

    impl TransitionHandler for Recorder {
        fn on_transition(&self, from: SystemState, to: SystemState, machine: &StateMachine) {
            self.transitions.borrow_mut().push((from, to));
            if let Some((state, event)) = self.chain {
                if to == state {
                    machine.try_handle_event(event).unwrap();
                }
            }
        }

        fn on_timeout(&self, state: SystemState, machine: &StateMachine) {
            self.timeouts.borrow_mut().push(state);
            if let Some(event) = timeout_event(state) {
                machine.try_handle_event(event).unwrap();
            }
        }
    }

    fn feed(sm: &StateMachine, handler: &Recorder, events: &[SystemEvent]) {
        for &event in events {
            sm.try_handle_event(event).unwrap();
        }
        sm.process_pending(handler);
    }

    fn short_timeouts(connecting: u64, operational: u64) -> StateTimeouts {
        StateTimeouts {
            connecting_network: Duration::from_millis(connecting),
            requesting_address: Duration::from_secs(10),
            starting_service: Duration::from_secs(10),
            operational: Duration::from_millis(operational),
        }
    }

    #[test]
    fn test_transition_table_is_total() {
        let mut changes = 0;
        for state in SystemState::ALL {
            for event in SystemEvent::ALL {
                let next = transition(state, event);
                assert!(SystemState::ALL.contains(&next));
                if next != state {
                    changes += 1;
                }
            }
        }
        // Every other pair is a self-loop
        assert_eq!(changes, 38);
    }

    #[test]
    fn test_init_only_leaves_on_init_complete() {
        for event in SystemEvent::ALL {
            let expected = if event == SystemEvent::InitComplete {
                SystemState::ConnectingNetwork
            } else {
                SystemState::Init
            };
            assert_eq!(transition(SystemState::Init, event), expected, "{}", event);
        }
    }

    #[test]
    fn test_disconnect_lands_in_network_error() {
        for state in SystemState::ALL {
            let next = transition(state, SystemEvent::Disconnected);
            match state {
                SystemState::Init | SystemState::Reconnecting => assert_eq!(next, state),
                _ => assert_eq!(next, SystemState::NetworkError, "{}", state),
            }
        }
    }

    #[test]
    fn test_recovery_from_every_error_state() {
        for state in SystemState::ALL.into_iter().filter(|s| s.is_error()) {
            assert_eq!(
                transition(state, SystemEvent::ErrorRecovery),
                SystemState::Reconnecting
            );
            assert_eq!(
                transition(state, SystemEvent::ReconnectStart),
                SystemState::Reconnecting
            );
        }
        assert_eq!(
            transition(SystemState::ServiceTimeout, SystemEvent::ErrorRecovery),
            SystemState::Reconnecting
        );
        assert_eq!(
            transition(SystemState::Reconnecting, SystemEvent::ConnectStart),
            SystemState::ConnectingNetwork
        );
    }

    #[test]
    fn test_meaningless_events_keep_state() {
        assert_eq!(
            transition(SystemState::Operational, SystemEvent::ProbeReceived),
            SystemState::Operational
        );
        assert_eq!(
            transition(SystemState::ConnectingNetwork, SystemEvent::ConnectStart),
            SystemState::ConnectingNetwork
        );
        assert_eq!(
            transition(SystemState::Operational, SystemEvent::ErrorRecovery),
            SystemState::Operational
        );
        assert_eq!(
            transition(SystemState::ServiceTimeout, SystemEvent::ServiceListening),
            SystemState::ListeningService
        );
    }

    #[test]
    fn test_startup_reaches_operational() {
        let sm = StateMachine::new();
        let rec = Recorder::default();
        assert_eq!(sm.get_current_state(), SystemState::Init);
        assert!(!sm.is_operational());

        feed(
            &sm,
            &rec,
            &[
                SystemEvent::InitComplete,
                SystemEvent::ConnectStart,
                SystemEvent::Connected,
                SystemEvent::AddressAcquired,
                SystemEvent::NetworkReady,
                SystemEvent::ServiceStarted,
                SystemEvent::ServiceListening,
            ],
        );

        assert_eq!(
            *rec.transitions.borrow(),
            [
                (SystemState::Init, SystemState::ConnectingNetwork),
                (SystemState::ConnectingNetwork, SystemState::RequestingAddress),
                (SystemState::RequestingAddress, SystemState::NetworkReady),
                (SystemState::NetworkReady, SystemState::StartingService),
                (SystemState::StartingService, SystemState::ListeningService),
                (SystemState::ListeningService, SystemState::Operational),
            ]
        );
        assert!(sm.is_operational());
        assert_eq!(sm.get_previous_state(), Some(SystemState::ListeningService));
        assert!(sm.deadline().is_some());
        assert_eq!(sm.error_count(), 0);
    }

    #[test]
    fn test_failures_and_reconnect() {
        let sm = StateMachine::new();
        let rec = Recorder::default();

        feed(&sm, &rec, &[SystemEvent::InitComplete, SystemEvent::ConnectFailed]);
        assert_eq!(sm.get_current_state(), SystemState::NetworkError);
        assert!(sm.deadline().is_none());

        feed(
            &sm,
            &rec,
            &[
                SystemEvent::ErrorRecovery,
                SystemEvent::ConnectStart,
                SystemEvent::Connected,
                SystemEvent::AddressFailed,
            ],
        );
        assert_eq!(sm.get_current_state(), SystemState::AddressError);

        feed(
            &sm,
            &rec,
            &[
                SystemEvent::ErrorRecovery,
                SystemEvent::ConnectStart,
                SystemEvent::Connected,
                SystemEvent::AddressAcquired,
                SystemEvent::NetworkReady,
                SystemEvent::ServiceFailed,
            ],
        );
        assert_eq!(sm.get_current_state(), SystemState::ServiceError);
        assert_eq!(sm.error_count(), 3);
        assert!(!sm.is_operational());
    }

    #[test]
    fn test_callback_events_queue_behind_current() {
        let sm = StateMachine::new();
        let rec = Recorder {
            chain: Some((SystemState::NetworkReady, SystemEvent::NetworkReady)),
            ..Recorder::default()
        };

        for event in [
            SystemEvent::InitComplete,
            SystemEvent::Connected,
            SystemEvent::AddressAcquired,
            SystemEvent::ServiceStarted,
        ] {
            sm.try_handle_event(event).unwrap();
        }
        // ServiceStarted is handled in NetworkReady before the chained event
        assert_eq!(sm.process_pending(&rec), 5);
        assert_eq!(sm.get_current_state(), SystemState::StartingService);
    }

    #[test]
    fn test_handle_event_times_out_on_full_queue() {
        let sm = StateMachine::new();
        for _ in 0..EVENT_QUEUE_DEPTH {
            sm.try_handle_event(SystemEvent::ConnectStart).unwrap();
        }

        let started = Instant::now();
        assert_eq!(
            block_on(sm.handle_event(SystemEvent::Connected)),
            Err(BoardError::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(sm.pending_events(), EVENT_QUEUE_DEPTH);
    }

    #[test]
    fn test_handle_event_waits_for_space() {
        let sm = StateMachine::new();
        let rec = Recorder::default();
        for _ in 0..EVENT_QUEUE_DEPTH {
            sm.try_handle_event(SystemEvent::ConnectStart).unwrap();
        }

        let (queued, drained) = block_on(join(
            sm.handle_event(SystemEvent::InitComplete),
            async {
                Timer::after_millis(20).await;
                sm.process_pending(&rec)
            },
        ));
        assert_eq!(queued, Ok(()));
        assert_eq!(drained, EVENT_QUEUE_DEPTH);
        assert_eq!(sm.process_pending(&rec), 1);
        assert_eq!(sm.get_current_state(), SystemState::ConnectingNetwork);
    }

    #[test]
    fn test_connect_timeout_becomes_network_error() {
        let sm = StateMachine::with_timeouts(short_timeouts(30, 1000));
        let rec = Recorder::default();
        sm.try_handle_event(SystemEvent::InitComplete).unwrap();

        block_on(select(sm.run(&rec), Timer::after_millis(150)));

        assert_eq!(*rec.timeouts.borrow(), [SystemState::ConnectingNetwork]);
        assert_eq!(sm.get_current_state(), SystemState::NetworkError);
        assert!(sm.deadline().is_none());
    }

    #[test]
    fn test_probes_keep_operational_alive() {
        let sm = StateMachine::with_timeouts(short_timeouts(1000, 100));
        let rec = Recorder::default();
        sm.force_state(SystemState::Operational).unwrap();

        block_on(select(sm.run(&rec), async {
            for _ in 0..8 {
                Timer::after_millis(20).await;
                sm.try_handle_event(SystemEvent::ProbeReceived).unwrap();
            }
        }));
        assert_eq!(sm.get_current_state(), SystemState::Operational);
        assert!(rec.timeouts.borrow().is_empty());

        block_on(select(sm.run(&rec), Timer::after_millis(250)));
        assert_eq!(*rec.timeouts.borrow(), [SystemState::Operational]);
        assert_eq!(sm.get_current_state(), SystemState::ServiceTimeout);
    }

    #[test]
    fn test_force_state_notifies_handler() {
        let sm = StateMachine::new();
        let rec = Recorder::default();
        feed(&sm, &rec, &[SystemEvent::InitComplete]);

        sm.force_state(SystemState::ServiceError).unwrap();
        sm.process_pending(&rec);
        assert_eq!(
            rec.transitions.borrow().last(),
            Some(&(SystemState::ConnectingNetwork, SystemState::ServiceError))
        );
        assert_eq!(sm.error_count(), 1);
    }
}
