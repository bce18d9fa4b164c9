//! Command kinds, payloads and result slots.

#![allow(missing_docs)]

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use smol_str::SmolStr;

use crate::error::CommandError;
use crate::facade::{BlockInfo, CompileReport, LaunchMode, ProjectInfo};
use crate::session::SessionState;

/// Operation kinds accepted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    Connect,
    OpenProject,
    ListBlocks,
    ImportSource,
    ExportSource,
    Compile,
    ProjectInfo,
    CloseProject,
    Disconnect,
    /// Internal liveness probe issued by the health monitor.
    Probe,
}

impl CommandKind {
    pub const ALL: [CommandKind; 10] = [
        Self::Connect,
        Self::OpenProject,
        Self::ListBlocks,
        Self::ImportSource,
        Self::ExportSource,
        Self::Compile,
        Self::ProjectInfo,
        Self::CloseProject,
        Self::Disconnect,
        Self::Probe,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::OpenProject => "openProject",
            Self::ListBlocks => "listBlocks",
            Self::ImportSource => "importSource",
            Self::ExportSource => "exportSource",
            Self::Compile => "compile",
            Self::ProjectInfo => "projectInfo",
            Self::CloseProject => "closeProject",
            Self::Disconnect => "disconnect",
            Self::Probe => "probe",
        }
    }

    /// Key used in the `[timeouts]` config table and env overrides.
    #[must_use]
    pub fn config_key(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::OpenProject => "open_project",
            Self::ListBlocks => "list_blocks",
            Self::ImportSource => "import_source",
            Self::ExportSource => "export_source",
            Self::Compile => "compile",
            Self::ProjectInfo => "project_info",
            Self::CloseProject => "close_project",
            Self::Disconnect => "disconnect",
            Self::Probe => "probe",
        }
    }

    #[must_use]
    pub fn from_config_key(key: &str) -> Option<Self> {
        let key = key.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| kind.config_key() == key)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested operation and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRequest {
    Connect { mode: Option<LaunchMode> },
    OpenProject { path: SmolStr },
    ListBlocks,
    ImportSource { block: SmolStr, source: String },
    ExportSource { block: SmolStr },
    Compile { block: SmolStr },
    ProjectInfo,
    CloseProject,
    Disconnect,
    Probe,
}

impl CommandRequest {
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Connect { .. } => CommandKind::Connect,
            Self::OpenProject { .. } => CommandKind::OpenProject,
            Self::ListBlocks => CommandKind::ListBlocks,
            Self::ImportSource { .. } => CommandKind::ImportSource,
            Self::ExportSource { .. } => CommandKind::ExportSource,
            Self::Compile { .. } => CommandKind::Compile,
            Self::ProjectInfo => CommandKind::ProjectInfo,
            Self::CloseProject => CommandKind::CloseProject,
            Self::Disconnect => CommandKind::Disconnect,
            Self::Probe => CommandKind::Probe,
        }
    }
}

/// Successful command result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    Connected {
        state: SessionState,
        handle_epoch: u64,
        launched: bool,
    },
    ProjectOpened {
        path: PathBuf,
    },
    Blocks(Vec<BlockInfo>),
    Imported {
        block: SmolStr,
    },
    Exported {
        block: SmolStr,
        source: String,
    },
    Compiled(CompileReport),
    ProjectInfo(ProjectInfo),
    ProjectClosed,
    Disconnected,
    Probed,
}

pub type CommandResult = Result<CommandOutput, CommandError>;

#[derive(Debug)]
enum SlotState {
    Queued,
    Running { started: Instant },
    Done(CommandResult),
    Delivered,
}

/// Result slot of one command, completed exactly once.
///
/// The worker, the waiting caller (on deadline) and the crash path all race
/// to complete the slot; the first completion wins and later ones are
/// reported back as discarded.
#[derive(Debug)]
pub struct ResultSlot {
    id: u64,
    kind: CommandKind,
    submitted: Instant,
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl ResultSlot {
    pub(crate) fn new(id: u64, kind: CommandKind) -> Self {
        Self {
            id,
            kind,
            submitted: Instant::now(),
            state: Mutex::new(SlotState::Queued),
            ready: Condvar::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    #[must_use]
    pub fn submitted(&self) -> Instant {
        self.submitted
    }

    /// Mark the command as executing. Returns `false` when the slot was
    /// already completed (the caller gave up while it was queued).
    pub(crate) fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Queued) {
            *state = SlotState::Running {
                started: Instant::now(),
            };
            true
        } else {
            false
        }
    }

    /// Complete the slot. Returns `false` if another party completed it first.
    pub(crate) fn complete(&self, result: CommandResult) -> bool {
        let mut state = self.state.lock();
        match *state {
            SlotState::Queued | SlotState::Running { .. } => {
                *state = SlotState::Done(result);
                self.ready.notify_all();
                true
            }
            SlotState::Done(_) | SlotState::Delivered => false,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Running { .. })
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(
            *self.state.lock(),
            SlotState::Done(_) | SlotState::Delivered
        )
    }

    /// Wait up to `timeout` for a result without giving up on the command.
    ///
    /// Returns `None` if nothing arrived in time; the slot stays open and can
    /// be polled again.
    pub(crate) fn wait_for(&self, timeout: Duration) -> Option<CommandResult> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if matches!(*state, SlotState::Done(_)) {
                if let SlotState::Done(result) = std::mem::replace(&mut *state, SlotState::Delivered)
                {
                    return Some(result);
                }
            }
            if matches!(*state, SlotState::Delivered) {
                return Some(Err(CommandError::Shutdown));
            }
            if Instant::now() >= deadline {
                return None;
            }
            let _ = self.ready.wait_until(&mut state, deadline);
        }
    }

    /// Block until the slot completes or a deadline passes.
    ///
    /// While queued only `request_deadline` applies; once running the
    /// tighter of `request_deadline` and `started + op_timeout` applies. On
    /// expiry the slot is completed with [`CommandError::Timeout`] so a late
    /// worker result is discarded.
    pub(crate) fn wait(&self, request_deadline: Instant, op_timeout: Duration) -> CommandResult {
        let mut state = self.state.lock();
        loop {
            let deadline = match &*state {
                SlotState::Done(_) => None,
                SlotState::Delivered => return Err(CommandError::Shutdown),
                SlotState::Queued => Some(request_deadline),
                SlotState::Running { started } => Some(request_deadline.min(*started + op_timeout)),
            };
            let Some(deadline) = deadline else {
                if let SlotState::Done(result) =
                    std::mem::replace(&mut *state, SlotState::Delivered)
                {
                    return result;
                }
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                let since = match &*state {
                    SlotState::Running { started } => *started,
                    _ => self.submitted,
                };
                let after_ms = u64::try_from(now.duration_since(since).as_millis())
                    .unwrap_or(u64::MAX);
                *state = SlotState::Delivered;
                return Err(CommandError::Timeout {
                    command: self.kind,
                    after_ms,
                });
            }
            let _ = self.ready.wait_until(&mut state, deadline);
        }
    }
}
