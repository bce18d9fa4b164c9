//! Automation facade over the vendor engineering application.
//!
//! The facade is the only code that talks to the engineering tool. Every call
//! blocks the calling thread and the trait is deliberately not reentrant: the
//! dispatcher worker owns the one instance and calls it sequentially. The
//! facade never retries; retry policy belongs to the caller.

#![allow(missing_docs)]

mod host;
mod link;
mod sim;

use std::path::Path;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::BridgeError;
use crate::fault::AutomationFault;

pub use host::HostWatch;
pub use link::{HostLinkConfig, HostLinkFacade, DISCONNECT_TIMEOUT};
pub use sim::{SimCall, SimulatedFacade, SimulatedHost};

/// How a fresh engineering-tool instance is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    #[default]
    WithUi,
    Headless,
}

impl LaunchMode {
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        match text.trim().to_ascii_lowercase().as_str() {
            "ui" | "with_ui" => Ok(Self::WithUi),
            "headless" | "without_ui" => Ok(Self::Headless),
            _ => Err(BridgeError::InvalidConfig(
                format!("invalid launch mode '{text}'").into(),
            )),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WithUi => "ui",
            Self::Headless => "headless",
        }
    }
}

/// Program block metadata as reported by the engineering tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub name: SmolStr,
    #[serde(default)]
    pub number: Option<u32>,
    #[serde(default)]
    pub kind: SmolStr,
    #[serde(default)]
    pub group_path: SmolStr,
    #[serde(default)]
    pub language: SmolStr,
}

/// Order blocks by group path, then name.
pub fn order_blocks(blocks: &mut [BlockInfo]) {
    blocks.sort_by(|a, b| {
        a.group_path
            .cmp(&b.group_path)
            .then_with(|| a.name.cmp(&b.name))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub block: Option<SmolStr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: SmolStr,
    #[serde(default, alias = "type")]
    pub type_identifier: SmolStr,
}

/// Read-only summary of the open project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    #[serde(alias = "project_name")]
    pub name: SmolStr,
    #[serde(alias = "project_path")]
    pub path: String,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    #[serde(default, alias = "block_count")]
    pub block_count: usize,
}

/// Outcome of a compile. Compile errors are reported here, not as faults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompileReport {
    pub success: bool,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileReport {
    #[must_use]
    pub fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let success = !diagnostics
            .iter()
            .any(|diag| diag.severity == Severity::Error);
        Self {
            success,
            diagnostics,
        }
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|diag| diag.severity == severity)
            .count()
    }
}

/// Capability surface of the vendor engineering application.
///
/// Calls block until the vendor returns. Implementations must not be called
/// concurrently and must not retry internally.
pub trait AutomationFacade: Send {
    /// Start a fresh engineering-tool instance.
    fn launch(&mut self, mode: LaunchMode) -> Result<(), AutomationFault>;

    /// Attach to an already running instance. `Ok(false)` means none is running.
    fn attach(&mut self) -> Result<bool, AutomationFault>;

    fn open_project(&mut self, path: &Path) -> Result<(), AutomationFault>;

    fn close_project(&mut self) -> Result<(), AutomationFault>;

    fn list_blocks(&mut self) -> Result<Vec<BlockInfo>, AutomationFault>;

    fn import_source(&mut self, block: &str, source: &str) -> Result<(), AutomationFault>;

    fn export_source(&mut self, block: &str) -> Result<String, AutomationFault>;

    fn compile(&mut self, block: &str) -> Result<CompileReport, AutomationFault>;

    fn project_info(&mut self) -> Result<ProjectInfo, AutomationFault>;

    /// Release the handle. Best effort: the handle is dropped even on error.
    fn disconnect(&mut self) -> Result<(), AutomationFault>;

    /// Drop the handle locally without a request to the host. Never blocks;
    /// used when the previous handle is known to be dead or hung.
    fn release(&mut self);

    /// Lightweight, non-mutating liveness call.
    fn probe(&mut self) -> Result<(), AutomationFault>;
}
