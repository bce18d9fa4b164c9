mod common;

use std::thread;
use std::time::Duration;

use common::{connect_and_open, seeded_host, spawn_dispatcher, wait_until, LONG};
use plc_bridge::command::{CommandKind, CommandRequest};
use plc_bridge::config::TimeoutTable;
use plc_bridge::health::{HealthConfig, HealthMonitor, ProbeOutcome};
use plc_bridge::{AutomationFault, CommandError, DispatcherConfig, FaultCategory, SessionState};

fn health_config() -> HealthConfig {
    HealthConfig {
        interval: Duration::from_millis(20),
        failure_threshold: 2,
        probe_timeout: Duration::from_millis(500),
    }
}

#[test]
fn disconnected_session_is_not_probed() {
    let host = seeded_host();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    let mut monitor = HealthMonitor::new(handle, health_config());
    assert_eq!(monitor.check(), ProbeOutcome::Skipped);
    assert!(host.calls().is_empty());
}

#[test]
fn idle_session_is_probed_through_the_queue() {
    let host = seeded_host();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);
    wait_until("queue to drain", Duration::from_secs(2), || handle.is_idle());

    let mut monitor = HealthMonitor::new(handle.clone(), health_config());
    assert_eq!(monitor.check(), ProbeOutcome::Healthy);
    assert_eq!(host.call_kinds().last(), Some(&CommandKind::Probe));
    assert_eq!(handle.session().state(), SessionState::ProjectOpen);
    assert_eq!(handle.stats().submitted, 2);
}

#[test]
fn busy_session_is_checked_without_queueing_a_probe() {
    let host = seeded_host();
    host.set_delay(CommandKind::Compile, Duration::from_millis(300));
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);

    let compile = handle
        .submit(CommandRequest::Compile {
            block: "Motor".into(),
        })
        .unwrap();
    wait_until("compile in flight", Duration::from_secs(2), || {
        handle.session().state() == SessionState::Busy
    });
    assert!(handle.submit_probe().is_none());
    let mut monitor = HealthMonitor::new(handle.clone(), health_config());
    assert_eq!(monitor.check(), ProbeOutcome::Healthy);
    assert!(compile.wait(LONG).is_ok());
    assert!(!host.call_kinds().contains(&CommandKind::Probe));
}

#[test]
fn two_failures_crash_session_and_fail_in_flight_compile() {
    let host = seeded_host();
    host.set_delay(CommandKind::Compile, Duration::from_millis(500));
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);

    let compile = {
        let handle = handle.clone();
        thread::spawn(move || {
            handle.execute(
                CommandRequest::Compile {
                    block: "Motor".into(),
                },
                LONG,
            )
        })
    };
    wait_until("compile in flight", Duration::from_secs(2), || {
        handle.session().state() == SessionState::Busy
    });
    let queued = handle.submit(CommandRequest::ListBlocks).unwrap();

    host.kill();
    let mut monitor = HealthMonitor::new(handle.clone(), health_config());
    assert!(matches!(
        monitor.check(),
        ProbeOutcome::Failed { consecutive: 1, .. }
    ));
    assert_eq!(handle.session().state(), SessionState::Busy);
    assert_eq!(
        monitor.check(),
        ProbeOutcome::Crashed { failed_commands: 2 }
    );
    assert_eq!(handle.session().state(), SessionState::Crashed);

    let result = compile.join().expect("compile thread");
    assert!(matches!(result, Err(CommandError::Unreachable(_))), "got {result:?}");
    assert!(matches!(queued.wait(LONG), Err(CommandError::Unreachable(_))));

    wait_until("stale result discarded", Duration::from_secs(2), || {
        handle.stats().discarded == 1
    });
    let status = handle.status();
    assert_eq!(status.session_state, SessionState::Crashed);
    assert!(!status.host_process_alive);
    assert_eq!(
        status.last_error.map(|fault| fault.category),
        Some(FaultCategory::ProcessUnreachable)
    );
}

#[test]
fn single_failure_does_not_crash() {
    let host = seeded_host();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);
    wait_until("queue to drain", Duration::from_secs(2), || handle.is_idle());

    host.inject_fault(
        CommandKind::Probe,
        AutomationFault::unreachable("automation handle not answering"),
    );
    let mut monitor = HealthMonitor::new(handle.clone(), health_config());
    assert!(matches!(
        monitor.check(),
        ProbeOutcome::Failed { consecutive: 1, .. }
    ));
    wait_until("probe finished", Duration::from_secs(2), || handle.is_idle());
    assert_eq!(monitor.check(), ProbeOutcome::Healthy);
    assert_eq!(handle.session().state(), SessionState::ProjectOpen);
}

#[test]
fn unresponsive_handle_crashes_even_with_live_process() {
    let host = seeded_host();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);
    wait_until("queue to drain", Duration::from_secs(2), || handle.is_idle());

    for _ in 0..2 {
        host.inject_fault(
            CommandKind::Probe,
            AutomationFault::new(FaultCategory::Unknown, "COM object disconnected"),
        );
    }
    let mut monitor = HealthMonitor::new(handle.clone(), health_config());
    let _ = monitor.check();
    wait_until("probe finished", Duration::from_secs(2), || handle.is_idle());
    assert_eq!(
        monitor.check(),
        ProbeOutcome::Crashed { failed_commands: 0 }
    );
    assert!(host.is_alive());
    assert_eq!(handle.session().state(), SessionState::Crashed);

    // Recovery is explicit.
    handle
        .execute(CommandRequest::Connect { mode: None }, LONG)
        .expect("reconnect");
    assert_eq!(handle.session().state(), SessionState::Attached);
}

#[test]
fn spawned_monitor_detects_dead_host() {
    let host = seeded_host();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);

    let mut monitor = HealthMonitor::new(handle.clone(), health_config())
        .spawn()
        .expect("spawn monitor");
    host.kill();
    wait_until("session crash", Duration::from_secs(3), || {
        handle.session().state() == SessionState::Crashed
    });
    monitor.join();
    assert!(matches!(
        handle.execute(CommandRequest::ListBlocks, LONG),
        Err(CommandError::Unreachable(_))
    ));
}

#[test]
fn unanswered_health_check_counts_again_until_crash() {
    let host = seeded_host();
    host.set_delay(CommandKind::Probe, Duration::from_secs(2));
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);
    wait_until("queue to drain", Duration::from_secs(2), || handle.is_idle());

    let mut monitor = HealthMonitor::new(
        handle.clone(),
        HealthConfig {
            probe_timeout: Duration::from_millis(150),
            ..health_config()
        },
    );
    assert!(matches!(
        monitor.check(),
        ProbeOutcome::Failed { consecutive: 1, .. }
    ));
    assert_eq!(
        monitor.check(),
        ProbeOutcome::Crashed { failed_commands: 1 }
    );
    assert_eq!(handle.session().state(), SessionState::Crashed);
    let probes = host
        .call_kinds()
        .into_iter()
        .filter(|kind| *kind == CommandKind::Probe)
        .count();
    assert_eq!(probes, 1);

    handle
        .execute(CommandRequest::Connect { mode: None }, LONG)
        .expect("reconnect once the hung call returns");
    assert_eq!(handle.session().state(), SessionState::Attached);
}

#[test]
fn command_stuck_past_its_timeout_counts_as_failure() {
    let host = seeded_host();
    host.set_delay(CommandKind::Compile, Duration::from_millis(1500));
    let mut timeouts = TimeoutTable::default();
    timeouts.set(CommandKind::Compile, Duration::from_millis(100));
    let (_dispatcher, handle) = spawn_dispatcher(
        &host,
        DispatcherConfig {
            timeouts,
            ..DispatcherConfig::default()
        },
    );
    connect_and_open(&handle);

    let result = handle.execute(
        CommandRequest::Compile {
            block: "Motor".into(),
        },
        LONG,
    );
    assert!(matches!(result, Err(CommandError::Timeout { .. })));
    wait_until("compile overdue", Duration::from_secs(1), || {
        handle.overdue().is_some()
    });
    assert_eq!(
        handle.overdue().map(|(kind, _)| kind),
        Some(CommandKind::Compile)
    );

    let mut monitor = HealthMonitor::new(handle.clone(), health_config());
    assert!(matches!(
        monitor.check(),
        ProbeOutcome::Failed { consecutive: 1, .. }
    ));
    assert_eq!(
        monitor.check(),
        ProbeOutcome::Crashed { failed_commands: 0 }
    );
    assert!(!host.call_kinds().contains(&CommandKind::Probe));
}
