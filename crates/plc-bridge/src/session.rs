//! Session lifecycle state machine.
//!
//! One [`Session`] exists per bridge process. It is mutated only through
//! [`SessionMachine`]: by the dispatcher worker around each facade call and by
//! the health monitor when it declares the automation host crashed.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use smol_str::SmolStr;
use tracing::{info, warn};

use crate::command::{CommandKind, CommandOutput, CommandResult};
use crate::error::CommandError;
use crate::fault::AutomationFault;

const EVENT_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Attached,
    ProjectOpen,
    Busy,
    Crashed,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Attached => "attached",
            Self::ProjectOpen => "project_open",
            Self::Busy => "busy",
            Self::Crashed => "crashed",
        }
    }

    /// States in which a live automation handle is expected.
    #[must_use]
    pub fn has_handle(self) -> bool {
        matches!(self, Self::Attached | Self::ProjectOpen | Self::Busy)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub timestamp_ms: u128,
    pub kind: SmolStr,
    pub state: SessionState,
    pub message: SmolStr,
}

#[derive(Debug, Default)]
pub struct Session {
    state: SessionState,
    resume_state: Option<SessionState>,
    active_project_path: Option<PathBuf>,
    last_error: Option<AutomationFault>,
    handle_epoch: u64,
    events: VecDeque<SessionEvent>,
}

impl Session {
    fn transition(&mut self, next: SessionState, reason: &str) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, "{reason}");
        self.state = next;
        self.push_event("transition", format!("{reason}: {next}"));
    }

    fn push_event(&mut self, kind: &str, message: impl Into<SmolStr>) {
        if self.events.len() == EVENT_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(SessionEvent {
            timestamp_ms: now_ms(),
            kind: SmolStr::new(kind),
            state: self.state,
            message: message.into(),
        });
    }

    fn record_fault(&mut self, fault: AutomationFault) {
        self.push_event("fault", fault.to_string());
        self.last_error = Some(fault);
    }

    fn resume(&mut self) -> SessionState {
        self.resume_state.take().unwrap_or(self.state)
    }
}

/// Ticket handed out by [`SessionMachine::begin`] and returned to `finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub kind: CommandKind,
    pub epoch: u64,
    pub from: SessionState,
}

/// Read-only projection used by status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub state: SessionState,
    pub active_project_path: Option<PathBuf>,
    pub last_error: Option<AutomationFault>,
    pub handle_epoch: u64,
}

/// Cloneable handle to the process-wide session.
#[derive(Debug, Clone, Default)]
pub struct SessionMachine {
    inner: Arc<Mutex<Session>>,
}

impl SessionMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn handle_epoch(&self) -> u64 {
        self.inner.lock().handle_epoch
    }

    #[must_use]
    pub fn view(&self) -> SessionView {
        let session = self.inner.lock();
        SessionView {
            state: session.state,
            active_project_path: session.active_project_path.clone(),
            last_error: session.last_error.clone(),
            handle_epoch: session.handle_epoch,
        }
    }

    /// Most recent events, oldest first.
    #[must_use]
    pub fn events(&self, limit: usize) -> Vec<SessionEvent> {
        let session = self.inner.lock();
        let skip = session.events.len().saturating_sub(limit);
        session.events.iter().skip(skip).cloned().collect()
    }

    /// Validate `kind` against the current state without changing it.
    pub fn check(&self, kind: CommandKind) -> Result<(), CommandError> {
        validate(self.inner.lock().state, kind)
    }

    /// Admit a command for execution: validate it and enter `connecting` or `busy`.
    pub fn begin(&self, kind: CommandKind) -> Result<Admission, CommandError> {
        let mut session = self.inner.lock();
        let from = session.state;
        validate(from, kind)?;
        match kind {
            CommandKind::Connect => {
                session.resume_state = Some(from);
                session.transition(SessionState::Connecting, "connecting to automation host");
            }
            CommandKind::Probe => {}
            _ => {
                session.resume_state = Some(from);
                session.transition(SessionState::Busy, kind.as_str());
            }
        }
        Ok(Admission {
            kind,
            epoch: session.handle_epoch,
            from,
        })
    }

    /// Apply the outcome of an admitted command.
    ///
    /// Returns `false` when the result is stale (the session crashed or the
    /// handle was re-acquired while the call was running); stale results must
    /// be discarded by the caller and leave the session untouched.
    pub fn finish(&self, admission: Admission, result: &mut CommandResult) -> bool {
        let mut session = self.inner.lock();
        let expected = match admission.kind {
            CommandKind::Connect => SessionState::Connecting,
            CommandKind::Probe => admission.from,
            _ => SessionState::Busy,
        };
        let stale = session.handle_epoch != admission.epoch
            || session.state == SessionState::Crashed
            || (admission.kind != CommandKind::Probe && session.state != expected);
        if stale {
            warn!(
                command = %admission.kind,
                epoch = admission.epoch,
                current = session.handle_epoch,
                "discarding stale command result"
            );
            session.push_event(
                "discard",
                format!("stale result of {} (epoch {})", admission.kind, admission.epoch),
            );
            return false;
        }

        if let Err(err) = &*result {
            if err.is_automation_failure() && admission.kind != CommandKind::Probe {
                session.record_fault(err.to_fault());
            }
        }

        match (admission.kind, &mut *result) {
            (CommandKind::Connect, Ok(CommandOutput::Connected {
                state,
                handle_epoch,
                ..
            })) => {
                session.resume_state = None;
                session.handle_epoch += 1;
                session.active_project_path = None;
                session.transition(SessionState::Attached, "automation handle acquired");
                *state = session.state;
                *handle_epoch = session.handle_epoch;
            }
            (CommandKind::Connect, _) => {
                let back = session.resume();
                session.transition(back, "connect failed");
            }
            (CommandKind::OpenProject, Ok(CommandOutput::ProjectOpened { path })) => {
                session.resume_state = None;
                session.active_project_path = Some(path.clone());
                session.transition(SessionState::ProjectOpen, "project opened");
            }
            (CommandKind::CloseProject, Ok(_)) => {
                session.resume_state = None;
                session.active_project_path = None;
                session.transition(SessionState::Attached, "project closed");
            }
            (CommandKind::Disconnect, _) => {
                session.resume_state = None;
                session.active_project_path = None;
                session.transition(SessionState::Disconnected, "disconnected");
            }
            (CommandKind::Probe, _) => {}
            _ => {
                let back = session.resume();
                session.transition(back, "command finished");
            }
        }
        true
    }

    /// Record a fault that did not come out of `finish` (e.g. a caller-side timeout).
    pub fn record_fault(&self, fault: AutomationFault) {
        self.inner.lock().record_fault(fault);
    }

    /// Force the session into `crashed`, invalidating the current handle.
    ///
    /// Returns `false` if there was no live handle to lose.
    pub fn force_crash(&self, reason: &str) -> bool {
        let mut session = self.inner.lock();
        if !session.state.has_handle() {
            return false;
        }
        session.resume_state = None;
        session.active_project_path = None;
        session.record_fault(AutomationFault::unreachable(reason));
        warn!(epoch = session.handle_epoch, "automation host crashed: {reason}");
        session.transition(SessionState::Crashed, "automation host crashed");
        true
    }
}

fn validate(state: SessionState, kind: CommandKind) -> Result<(), CommandError> {
    let allowed = match kind {
        CommandKind::Connect => {
            matches!(state, SessionState::Disconnected | SessionState::Crashed)
        }
        CommandKind::OpenProject => state == SessionState::Attached,
        CommandKind::ListBlocks
        | CommandKind::ImportSource
        | CommandKind::ExportSource
        | CommandKind::Compile
        | CommandKind::ProjectInfo
        | CommandKind::CloseProject => state == SessionState::ProjectOpen,
        CommandKind::Disconnect | CommandKind::Probe => {
            matches!(state, SessionState::Attached | SessionState::ProjectOpen)
        }
    };
    if allowed {
        Ok(())
    } else if state == SessionState::Crashed {
        Err(CommandError::Unreachable(
            "automation host crashed; connect required".into(),
        ))
    } else {
        Err(CommandError::InvalidState {
            command: kind,
            state,
        })
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}
