mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{connect_and_open, seeded_host, spawn_dispatcher, wait_until, LONG, PROJECT};
use plc_bridge::command::{CommandKind, CommandOutput, CommandRequest};
use plc_bridge::config::{TimeoutPolicy, TimeoutTable};
use plc_bridge::facade::SimulatedHost;
use plc_bridge::{AutomationFault, CommandError, DispatcherConfig, FaultCategory, SessionState};

fn in_flight(host: &SimulatedHost, kind: CommandKind) -> bool {
    host.calls()
        .iter()
        .any(|call| call.kind == kind && call.finished.is_none())
}

#[test]
fn concurrent_submissions_never_overlap_facade_calls() {
    let host = seeded_host();
    host.set_delay(CommandKind::ListBlocks, Duration::from_millis(3));
    host.set_delay(CommandKind::Compile, Duration::from_millis(5));
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let handle = handle.clone();
            thread::spawn(move || {
                for round in 0..3 {
                    let request = match (worker + round) % 3 {
                        0 => CommandRequest::ListBlocks,
                        1 => CommandRequest::ExportSource {
                            block: "Motor".into(),
                        },
                        _ => CommandRequest::Compile {
                            block: "Main".into(),
                        },
                    };
                    handle.execute(request, LONG).expect("command succeeds");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread");
    }

    assert_eq!(host.overlaps(), 0);
    let calls = host.calls();
    assert_eq!(calls.len(), 2 + 8 * 3);
    for pair in calls.windows(2) {
        let finished = pair[0].finished.expect("call finished");
        assert!(pair[1].started >= finished);
    }
    let stats = handle.stats();
    assert_eq!(stats.submitted, 26);
    assert_eq!(stats.completed, 26);
}

#[test]
fn open_project_while_disconnected_never_reaches_facade() {
    let host = seeded_host();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());

    let result = handle.execute(
        CommandRequest::OpenProject {
            path: PROJECT.into(),
        },
        LONG,
    );
    assert_eq!(
        result,
        Err(CommandError::InvalidState {
            command: CommandKind::OpenProject,
            state: SessionState::Disconnected,
        })
    );
    assert!(host.calls().is_empty());
    assert_eq!(handle.session().state(), SessionState::Disconnected);
    assert_eq!(handle.stats().rejected, 1);
}

#[test]
fn happy_path_ends_in_project_open_with_compile_diagnostics() {
    let host = seeded_host();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());

    let connected = handle
        .execute(CommandRequest::Connect { mode: None }, LONG)
        .unwrap();
    assert_eq!(
        connected,
        CommandOutput::Connected {
            state: SessionState::Attached,
            handle_epoch: 1,
            launched: false,
        }
    );
    handle
        .execute(
            CommandRequest::OpenProject {
                path: PROJECT.into(),
            },
            LONG,
        )
        .unwrap();

    let CommandOutput::Blocks(blocks) = handle.execute(CommandRequest::ListBlocks, LONG).unwrap()
    else {
        panic!("expected block list");
    };
    let names: Vec<&str> = blocks.iter().map(|block| block.name.as_str()).collect();
    assert_eq!(names, ["Main", "Motor"]);

    let source = "FUNCTION \"B1\" : Void\nBEGIN\n  #Done := TRUE;\nEND_FUNCTION\n".to_string();
    handle
        .execute(
            CommandRequest::ImportSource {
                block: "B1".into(),
                source: source.clone(),
            },
            LONG,
        )
        .unwrap();
    assert_eq!(
        host.block_source(std::path::Path::new(PROJECT), "B1").as_deref(),
        Some(source.as_str())
    );

    let compiled = handle
        .execute(
            CommandRequest::Compile {
                block: "B1".into(),
            },
            LONG,
        )
        .unwrap();
    let CommandOutput::Compiled(report) = compiled else {
        panic!("expected compile report");
    };
    assert!(report.success);
    assert_eq!(report.error_count(), 0);

    wait_until("queue to drain", Duration::from_secs(2), || handle.is_idle());
    let status = handle.status();
    assert_eq!(status.session_state, SessionState::ProjectOpen);
    assert_eq!(status.active_project_path.as_deref(), Some(PROJECT));
    assert_eq!(status.queue_depth, 0);
    assert!(status.host_process_alive);
}

#[test]
fn compile_errors_are_reported_not_raised() {
    let host = seeded_host();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);
    handle
        .execute(
            CommandRequest::ImportSource {
                block: "Broken".into(),
                source: common::BROKEN_FC.into(),
            },
            LONG,
        )
        .unwrap();
    let Ok(CommandOutput::Compiled(report)) = handle.execute(
        CommandRequest::Compile {
            block: "Broken".into(),
        },
        LONG,
    ) else {
        panic!("compile should succeed as an operation");
    };
    assert!(!report.success);
    assert_eq!(report.error_count(), 2);
    assert_eq!(handle.session().state(), SessionState::ProjectOpen);
}

#[test]
fn vendor_fault_is_surfaced_and_kept_as_last_error() {
    let host = seeded_host();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);

    let missing = handle.execute(
        CommandRequest::ExportSource {
            block: "Conveyor".into(),
        },
        LONG,
    );
    let Err(CommandError::Fault(fault)) = &missing else {
        panic!("expected automation fault, got {missing:?}");
    };
    assert_eq!(fault.category, FaultCategory::VendorRejected);

    host.inject_fault(
        CommandKind::ListBlocks,
        AutomationFault::new(FaultCategory::PermissionDenied, "user not in Openness group"),
    );
    let denied = handle.execute(CommandRequest::ListBlocks, LONG).unwrap_err();
    assert_eq!(denied.category(), FaultCategory::PermissionDenied);
    assert_eq!(denied.http_status(), 502);

    let status = handle.status();
    assert_eq!(status.session_state, SessionState::ProjectOpen);
    assert_eq!(
        status.last_error.map(|fault| fault.category),
        Some(FaultCategory::PermissionDenied)
    );
    // Faults are never retried.
    let listed = host
        .call_kinds()
        .into_iter()
        .filter(|kind| *kind == CommandKind::ListBlocks)
        .count();
    assert_eq!(listed, 1);
}

#[test]
fn timed_out_command_releases_caller_but_blocks_next_command() {
    let host = seeded_host();
    host.set_delay(CommandKind::Compile, Duration::from_millis(600));
    let mut timeouts = TimeoutTable::default();
    timeouts.set(CommandKind::Compile, Duration::from_millis(200));
    let (_dispatcher, handle) = spawn_dispatcher(
        &host,
        DispatcherConfig {
            timeouts,
            ..DispatcherConfig::default()
        },
    );
    connect_and_open(&handle);

    let started = Instant::now();
    let compile = handle
        .submit(CommandRequest::Compile {
            block: "Motor".into(),
        })
        .unwrap();
    let next = handle.submit(CommandRequest::ListBlocks).unwrap();

    let result = compile.wait(LONG);
    let waited = started.elapsed();
    assert!(
        matches!(
            result,
            Err(CommandError::Timeout {
                command: CommandKind::Compile,
                ..
            })
        ),
        "got {result:?}"
    );
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_millis(550), "waited {waited:?}");

    assert!(matches!(next.wait(LONG), Ok(CommandOutput::Blocks(_))));
    let calls = host.calls();
    let compile_call = calls
        .iter()
        .find(|call| call.kind == CommandKind::Compile)
        .unwrap();
    let list_call = calls
        .iter()
        .rev()
        .find(|call| call.kind == CommandKind::ListBlocks)
        .unwrap();
    assert!(list_call.started >= compile_call.finished.unwrap());
    assert!(compile_call.finished.unwrap().duration_since(started) >= Duration::from_millis(600));

    wait_until("late result discarded", Duration::from_secs(2), || {
        handle.stats().discarded == 1
    });
    wait_until("queue to drain", Duration::from_secs(2), || handle.is_idle());
    let stats = handle.stats();
    assert_eq!(stats.timed_out, 1);
    // connect, openProject and listBlocks; the late compile only counts as discarded
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
    assert!(!stats.per_kind.contains_key(&CommandKind::Compile));
    assert_eq!(handle.session().state(), SessionState::ProjectOpen);
    assert_eq!(
        handle.status().last_error.map(|fault| fault.category),
        Some(FaultCategory::OperationTimeout)
    );
}

#[test]
fn command_abandoned_while_queued_is_never_started() {
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
        in_flight(&host, CommandKind::Compile)
    });
    let export = handle
        .submit(CommandRequest::ExportSource {
            block: "Motor".into(),
        })
        .unwrap();
    assert!(matches!(
        export.wait(Duration::from_millis(50)),
        Err(CommandError::Timeout { .. })
    ));
    assert!(compile.wait(LONG).is_ok());
    wait_until("queue to drain", Duration::from_secs(2), || handle.is_idle());
    assert!(!host.call_kinds().contains(&CommandKind::ExportSource));
}

#[test]
fn queue_ceiling_rejects_the_eleventh_pending_command() {
    let host = seeded_host();
    host.set_delay(CommandKind::Compile, Duration::from_millis(400));
    let (_dispatcher, handle) = spawn_dispatcher(
        &host,
        DispatcherConfig {
            max_pending: 10,
            ..DispatcherConfig::default()
        },
    );
    connect_and_open(&handle);

    let compile = handle
        .submit(CommandRequest::Compile {
            block: "Motor".into(),
        })
        .unwrap();
    wait_until("compile in flight", Duration::from_secs(2), || {
        in_flight(&host, CommandKind::Compile)
    });

    let pending: Vec<_> = (0..10)
        .map(|_| handle.submit(CommandRequest::ListBlocks).expect("accepted"))
        .collect();
    assert_eq!(handle.queue_depth(), 11);

    let started = Instant::now();
    let rejected = handle.submit(CommandRequest::ListBlocks);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(matches!(
        rejected,
        Err(CommandError::TooManyPending { limit: 10 })
    ));

    assert!(compile.wait(LONG).is_ok());
    for ticket in pending {
        assert!(ticket.wait(LONG).is_ok());
    }
    assert_eq!(handle.stats().rejected, 1);
}

#[test]
fn reconnect_after_crash_bumps_epoch() {
    let host = seeded_host();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);
    let before = handle.session().handle_epoch();

    assert_eq!(handle.crash("lost automation handle"), Some(0));
    assert_eq!(handle.session().state(), SessionState::Crashed);
    assert!(matches!(
        handle.execute(CommandRequest::ListBlocks, LONG),
        Err(CommandError::Unreachable(_))
    ));

    let reconnected = handle
        .execute(CommandRequest::Connect { mode: None }, LONG)
        .unwrap();
    let CommandOutput::Connected {
        state,
        handle_epoch,
        launched,
    } = reconnected
    else {
        panic!("expected connect output");
    };
    assert_eq!(state, SessionState::Attached);
    assert!(handle_epoch > before);
    assert!(!launched, "the tool is still running and is re-attached");
    assert!(
        !host.call_kinds().contains(&CommandKind::Disconnect),
        "the crashed handle is dropped without a host round trip"
    );
    assert_eq!(handle.status().active_project_path, None);
}

#[test]
fn connect_launches_when_nothing_is_running() {
    let host = SimulatedHost::new();
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    let connected = handle
        .execute(CommandRequest::Connect { mode: None }, LONG)
        .unwrap();
    assert!(matches!(
        connected,
        CommandOutput::Connected { launched: true, .. }
    ));
    assert!(host.is_alive());
    assert_eq!(
        host.call_kinds(),
        [CommandKind::Connect, CommandKind::Connect]
    );
}

#[test]
fn failed_connect_returns_to_disconnected() {
    let host = SimulatedHost::new();
    host.inject_fault(
        CommandKind::Connect,
        AutomationFault::new(FaultCategory::DependencyMissing, "Siemens.Engineering not installed"),
    );
    let (_dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    let err = handle
        .execute(CommandRequest::Connect { mode: None }, LONG)
        .unwrap_err();
    assert_eq!(err.category(), FaultCategory::DependencyMissing);
    assert_eq!(handle.session().state(), SessionState::Disconnected);
}

#[test]
fn kill_policy_terminates_host_after_timeout() {
    let host = seeded_host();
    host.set_delay(CommandKind::Compile, Duration::from_millis(400));
    let mut timeouts = TimeoutTable::default();
    timeouts.set(CommandKind::Compile, Duration::from_millis(100));
    let (_dispatcher, handle) = spawn_dispatcher(
        &host,
        DispatcherConfig {
            timeouts,
            timeout_policy: TimeoutPolicy::Kill,
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
    assert!(!host.is_alive());
    assert!(!handle.host().last_known_alive());
}

#[test]
fn shutdown_fails_queued_commands() {
    let host = seeded_host();
    host.set_delay(CommandKind::Compile, Duration::from_millis(200));
    let (mut dispatcher, handle) = spawn_dispatcher(&host, DispatcherConfig::default());
    connect_and_open(&handle);

    let compile = handle
        .submit(CommandRequest::Compile {
            block: "Motor".into(),
        })
        .unwrap();
    wait_until("compile in flight", Duration::from_secs(2), || {
        in_flight(&host, CommandKind::Compile)
    });
    let queued = handle.submit(CommandRequest::ListBlocks).unwrap();

    dispatcher.shutdown();
    assert_eq!(queued.wait(LONG), Err(CommandError::Shutdown));
    assert!(compile.wait(LONG).is_ok());
    assert!(matches!(
        handle.submit(CommandRequest::ListBlocks),
        Err(CommandError::Shutdown)
    ));
    assert_eq!(handle.status().bridge, "offline");
}

#[test]
fn uniform_timeouts_apply_to_every_kind() {
    let table = TimeoutTable::uniform(Duration::from_millis(250));
    let host = seeded_host();
    host.set_delay(CommandKind::ListBlocks, Duration::from_millis(500));
    let (_dispatcher, handle) = spawn_dispatcher(
        &host,
        DispatcherConfig {
            timeouts: table,
            ..DispatcherConfig::default()
        },
    );
    connect_and_open(&handle);
    assert!(matches!(
        handle.execute(CommandRequest::ListBlocks, LONG),
        Err(CommandError::Timeout {
            command: CommandKind::ListBlocks,
            ..
        })
    ));
}
