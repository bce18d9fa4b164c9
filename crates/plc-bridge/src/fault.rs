//! Automation fault classification.
//!
//! Every failure surfaced by the automation facade is mapped onto a small,
//! stable set of categories so callers can react without parsing vendor text.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Stable classification of an automation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCategory {
    /// The host refused access (missing group membership, ACLs).
    PermissionDenied,
    /// A vendor library or the host helper is not installed.
    DependencyMissing,
    /// The host process is gone or not answering.
    ProcessUnreachable,
    /// The operation exceeded its deadline.
    OperationTimeout,
    /// The operation is not valid in the current state.
    InvalidState,
    /// The vendor application rejected the request.
    VendorRejected,
    /// Anything not covered above.
    Unknown,
}

impl FaultCategory {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "PermissionDenied",
            Self::DependencyMissing => "DependencyMissing",
            Self::ProcessUnreachable => "ProcessUnreachable",
            Self::OperationTimeout => "OperationTimeout",
            Self::InvalidState => "InvalidState",
            Self::VendorRejected => "VendorRejected",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse a category label (`PermissionDenied` or `permission_denied`).
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let normalized: String = text
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "permissiondenied" => Some(Self::PermissionDenied),
            "dependencymissing" => Some(Self::DependencyMissing),
            "processunreachable" => Some(Self::ProcessUnreachable),
            "operationtimeout" | "timeout" => Some(Self::OperationTimeout),
            "invalidstate" => Some(Self::InvalidState),
            "vendorrejected" | "rejected" => Some(Self::VendorRejected),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Default recoverability for faults of this category.
    #[must_use]
    pub fn default_recoverable(self) -> bool {
        matches!(
            self,
            Self::ProcessUnreachable | Self::OperationTimeout | Self::VendorRejected
        )
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured classification of an underlying automation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationFault {
    pub category: FaultCategory,
    pub message: SmolStr,
    pub recoverable: bool,
}

impl AutomationFault {
    #[must_use]
    pub fn new(category: FaultCategory, message: impl Into<SmolStr>) -> Self {
        Self {
            category,
            message: message.into(),
            recoverable: category.default_recoverable(),
        }
    }

    #[must_use]
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    #[must_use]
    pub fn unreachable(message: impl Into<SmolStr>) -> Self {
        Self::new(FaultCategory::ProcessUnreachable, message)
    }

    #[must_use]
    pub fn rejected(message: impl Into<SmolStr>) -> Self {
        Self::new(FaultCategory::VendorRejected, message)
    }

    /// Classify an I/O error raised while talking to the automation host.
    #[must_use]
    pub fn from_io_error(err: &io::Error, context: &str) -> Self {
        let category = match err.kind() {
            io::ErrorKind::NotFound => FaultCategory::DependencyMissing,
            io::ErrorKind::PermissionDenied => FaultCategory::PermissionDenied,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => FaultCategory::ProcessUnreachable,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                FaultCategory::OperationTimeout
            }
            _ => FaultCategory::Unknown,
        };
        Self::new(category, format!("{context}: {err}"))
    }

    /// Classify a free-form error message reported by the vendor application.
    ///
    /// Falls back to [`FaultCategory::VendorRejected`]: the host answered, it
    /// just refused the request.
    #[must_use]
    pub fn from_vendor_message(message: &str) -> Self {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Self::new(FaultCategory::Unknown, "automation host reported an empty error");
        }
        Self::new(classify_message(trimmed), trimmed)
    }

    /// Build a fault from a host-reported kind label, classifying the message
    /// when the label is missing or unrecognised.
    #[must_use]
    pub fn from_host_error(kind: Option<&str>, message: &str) -> Self {
        match kind.and_then(FaultCategory::parse) {
            Some(category) => Self::new(category, message.trim()),
            None => Self::from_vendor_message(message),
        }
    }
}

impl fmt::Display for AutomationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

impl std::error::Error for AutomationFault {}

fn classify_message(message: &str) -> FaultCategory {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));
    if has(&[
        "access denied",
        "permission",
        "unauthorized",
        "openness group",
        "not a member",
    ]) {
        FaultCategory::PermissionDenied
    } else if has(&[
        "could not load",
        "not installed",
        "missing dependency",
        ".dll",
        "assembly",
    ]) {
        FaultCategory::DependencyMissing
    } else if has(&["timed out", "timeout"]) {
        FaultCategory::OperationTimeout
    } else if has(&[
        "not connected",
        "no connection",
        "disconnected",
        "rpc server",
        "process exited",
        "unreachable",
    ]) {
        FaultCategory::ProcessUnreachable
    } else if has(&["no project open", "invalid state", "not allowed in state"]) {
        FaultCategory::InvalidState
    } else {
        FaultCategory::VendorRejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_stable_categories() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        assert_eq!(
            AutomationFault::from_io_error(&missing, "spawn host").category,
            FaultCategory::DependencyMissing
        );
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            AutomationFault::from_io_error(&denied, "spawn host").category,
            FaultCategory::PermissionDenied
        );
        let pipe = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let fault = AutomationFault::from_io_error(&pipe, "write request");
        assert_eq!(fault.category, FaultCategory::ProcessUnreachable);
        assert!(fault.recoverable);
        assert!(fault.message.starts_with("write request:"));
    }

    #[test]
    fn vendor_messages_are_classified() {
        let cases = [
            (
                "User is not a member of the Siemens TIA Openness group",
                FaultCategory::PermissionDenied,
            ),
            (
                "Could not load file or assembly 'Siemens.Engineering.Contract'",
                FaultCategory::DependencyMissing,
            ),
            ("The RPC server is unavailable", FaultCategory::ProcessUnreachable),
            ("No project open", FaultCategory::InvalidState),
            ("Block 'Motor_FB' not found", FaultCategory::VendorRejected),
        ];
        for (message, expected) in cases {
            assert_eq!(
                AutomationFault::from_vendor_message(message).category,
                expected,
                "{message}"
            );
        }
        assert_eq!(
            AutomationFault::from_vendor_message("   ").category,
            FaultCategory::Unknown
        );
    }

    #[test]
    fn host_kind_labels_take_precedence() {
        let fault = AutomationFault::from_host_error(Some("permission_denied"), "nope");
        assert_eq!(fault.category, FaultCategory::PermissionDenied);
        assert!(!fault.recoverable);

        let fallback = AutomationFault::from_host_error(Some("weird"), "request timed out");
        assert_eq!(fallback.category, FaultCategory::OperationTimeout);
    }

    #[test]
    fn category_labels_round_trip() {
        for category in [
            FaultCategory::PermissionDenied,
            FaultCategory::DependencyMissing,
            FaultCategory::ProcessUnreachable,
            FaultCategory::OperationTimeout,
            FaultCategory::InvalidState,
            FaultCategory::VendorRejected,
            FaultCategory::Unknown,
        ] {
            assert_eq!(FaultCategory::parse(category.as_str()), Some(category));
        }
    }
}
