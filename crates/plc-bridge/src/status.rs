//! Status snapshot and command statistics.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::command::CommandKind;
use crate::fault::AutomationFault;
use crate::session::SessionState;

/// Point-in-time bridge status. Built from cached state only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub bridge: &'static str,
    pub session_state: SessionState,
    pub active_project_path: Option<String>,
    pub host_process_alive: bool,
    pub queue_depth: usize,
    pub handle_epoch: u64,
    pub last_error: Option<AutomationFault>,
    pub stats: BridgeStats,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindStats {
    pub count: u64,
    pub last_ms: f64,
    pub max_ms: f64,
}

impl KindStats {
    pub fn record(&mut self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        self.last_ms = ms;
        if self.count == 0 || ms > self.max_ms {
            self.max_ms = ms;
        }
        self.count = self.count.saturating_add(1);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub discarded: u64,
    pub rejected: u64,
    pub per_kind: BTreeMap<CommandKind, KindStats>,
}

impl BridgeStats {
    /// Record a command that finished executing on the worker.
    pub fn record_execution(&mut self, kind: CommandKind, duration: Duration, ok: bool) {
        if ok {
            self.completed = self.completed.saturating_add(1);
        } else {
            self.failed = self.failed.saturating_add(1);
        }
        self.per_kind.entry(kind).or_default().record(duration);
    }
}
