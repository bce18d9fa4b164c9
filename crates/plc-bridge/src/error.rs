//! Bridge errors and the command failure vocabulary.

#![allow(missing_docs)]

use smol_str::SmolStr;
use thiserror::Error;

use crate::command::CommandKind;
use crate::fault::{AutomationFault, FaultCategory};
use crate::session::SessionState;

/// Errors raised while configuring or starting the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Configuration error.
    #[error("invalid config '{0}'")]
    InvalidConfig(SmolStr),

    /// HTTP server error.
    #[error("server error '{0}'")]
    Server(SmolStr),

    /// Thread spawn error.
    #[error("thread spawn error '{0}'")]
    ThreadSpawn(SmolStr),

    /// I/O error.
    #[error("io error '{0}'")]
    Io(SmolStr),

    /// Request rejected before it reached the session.
    #[error("malformed request '{0}'")]
    MalformedRequest(SmolStr),
}

/// Failure delivered to the caller of a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Command not valid for the current session state.
    #[error("{command} is not valid while the session is {state}")]
    InvalidState {
        command: CommandKind,
        state: SessionState,
    },

    /// Classified failure raised by the automation facade.
    #[error("{0}")]
    Fault(AutomationFault),

    /// Deadline exceeded; the facade call may still be running.
    #[error("{command} timed out after {after_ms} ms")]
    Timeout { command: CommandKind, after_ms: u64 },

    /// Automation host not responsive; requires an explicit connect.
    #[error("automation host unreachable: {0}")]
    Unreachable(SmolStr),

    /// Queue ceiling reached.
    #[error("too many pending commands (limit {limit})")]
    TooManyPending { limit: usize },

    /// Dispatcher stopped before the command could run.
    #[error("bridge is shutting down")]
    Shutdown,
}

impl CommandError {
    /// Stable kind label used on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidState { .. } => "InvalidState",
            Self::Fault(_) => "AutomationFault",
            Self::Timeout { .. } => "OperationTimeout",
            Self::Unreachable(_) => "ProcessUnreachable",
            Self::TooManyPending { .. } => "TooManyPending",
            Self::Shutdown => "Shutdown",
        }
    }

    #[must_use]
    pub fn category(&self) -> FaultCategory {
        match self {
            Self::InvalidState { .. } => FaultCategory::InvalidState,
            Self::Fault(fault) => fault.category,
            Self::Timeout { .. } => FaultCategory::OperationTimeout,
            Self::Unreachable(_) | Self::Shutdown => FaultCategory::ProcessUnreachable,
            Self::TooManyPending { .. } => FaultCategory::Unknown,
        }
    }

    /// Whether a caller may retry after taking the documented action.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        match self {
            Self::InvalidState { .. } => false,
            Self::Fault(fault) => fault.recoverable,
            Self::Timeout { .. } | Self::Unreachable(_) | Self::TooManyPending { .. } => true,
            Self::Shutdown => false,
        }
    }

    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidState { .. } => 409,
            Self::Fault(_) | Self::Unreachable(_) => 502,
            Self::Timeout { .. } => 504,
            Self::TooManyPending { .. } => 429,
            Self::Shutdown => 503,
        }
    }

    /// Fault form retained as the session's `lastError`.
    #[must_use]
    pub fn to_fault(&self) -> AutomationFault {
        match self {
            Self::Fault(fault) => fault.clone(),
            other => AutomationFault::new(other.category(), other.to_string())
                .with_recoverable(other.recoverable()),
        }
    }

    /// Whether this failure should be retained as the session's `lastError`.
    #[must_use]
    pub fn is_automation_failure(&self) -> bool {
        matches!(
            self,
            Self::Fault(_) | Self::Timeout { .. } | Self::Unreachable(_)
        )
    }
}

impl From<AutomationFault> for CommandError {
    fn from(fault: AutomationFault) -> Self {
        if fault.category == FaultCategory::ProcessUnreachable {
            Self::Unreachable(fault.message)
        } else {
            Self::Fault(fault)
        }
    }
}
