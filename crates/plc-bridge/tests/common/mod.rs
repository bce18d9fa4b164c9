#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use plc_bridge::command::CommandRequest;
use plc_bridge::facade::{HostWatch, SimulatedFacade, SimulatedHost};
use plc_bridge::{Dispatcher, DispatcherConfig, DispatcherHandle, SessionMachine};

pub const PROJECT: &str = "C:/Projects/Line1";

pub const MOTOR_FB: &str = "FUNCTION_BLOCK \"Motor\"\nVAR_INPUT\n  Start : Bool;\nEND_VAR\nBEGIN\n  #Run := #Start;\nEND_FUNCTION_BLOCK\n";

pub const BROKEN_FC: &str = "FUNCTION \"Broken\" : Void\nBEGIN\n  #x := (1 + 2;\n";

pub const LONG: Duration = Duration::from_secs(10);

pub fn seeded_host() -> SimulatedHost {
    SimulatedHost::new().running().with_project(
        PROJECT,
        &[
            ("Motor", MOTOR_FB),
            ("Main", "ORGANIZATION_BLOCK \"Main\"\nBEGIN\n  \"Motor_DB\"();\nEND_ORGANIZATION_BLOCK\n"),
        ],
    )
}

pub fn spawn_dispatcher(host: &SimulatedHost, config: DispatcherConfig) -> (Dispatcher, DispatcherHandle) {
    let watch = HostWatch::new();
    let facade = SimulatedFacade::new(host.clone(), watch.clone());
    let dispatcher = Dispatcher::spawn(Box::new(facade), SessionMachine::new(), watch, config)
        .expect("spawn dispatcher");
    let handle = dispatcher.handle();
    (dispatcher, handle)
}

pub fn connect_and_open(handle: &DispatcherHandle) {
    handle
        .execute(CommandRequest::Connect { mode: None }, LONG)
        .expect("connect");
    handle
        .execute(
            CommandRequest::OpenProject {
                path: PROJECT.into(),
            },
            LONG,
        )
        .expect("open project");
}

pub fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}
