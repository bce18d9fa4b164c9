//! `plc-bridge` - remote automation bridge for a single-instance PLC engineering tool.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

/// Bridge assembly (dispatcher + health monitor + HTTP server).
pub mod bridge;
/// Command kinds, payloads and result slots.
pub mod command;
/// Bridge configuration loading.
pub mod config;
/// Single-flight command dispatcher.
pub mod dispatcher;
/// Bridge errors and the command failure vocabulary.
pub mod error;
/// Automation facade over the vendor engineering application.
pub mod facade;
/// Automation fault classification.
pub mod fault;
/// Automation host health monitoring.
pub mod health;
/// HTTP boundary.
pub mod server;
/// Session lifecycle state machine.
pub mod session;
/// Status snapshot and command statistics.
pub mod status;

pub use bridge::Bridge;
pub use command::{CommandKind, CommandOutput, CommandRequest};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle};
pub use error::{BridgeError, CommandError};
pub use fault::{AutomationFault, FaultCategory};
pub use session::{SessionMachine, SessionState};
pub use status::StatusSnapshot;
