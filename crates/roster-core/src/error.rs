//! Error types for Roster Sync
//!
//! Provides error handling for:
//! - Terminal lookup failures (unknown member or branch)
//! - Members without a resolvable vendor identity
//! - Isolated vendor and mirror-store call failures
//! - Configuration loading

use crate::types::{BranchId, EmployeePsId};

/// Main reconciliation error type
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Member or branch absent from the directory
    #[error("not found: {0}")]
    NotFound(String),

    /// Member has no resolvable vendor identity
    #[error("member {0} has no vendor identity")]
    IdentityMissing(EmployeePsId),

    /// A vendor call failed
    #[error("vendor call failed: {0}")]
    VendorCallFailed(#[from] GatewayError),

    /// A local mirror write failed
    #[error("mirror store write failed: {0}")]
    StoreWriteFailed(#[from] StoreError),

    /// Reading the local mirror failed
    #[error("mirror store read failed: {0}")]
    StoreReadFailed(StoreError),

    /// Reading the organizational directory failed
    #[error("directory read failed: {0}")]
    DirectoryReadFailed(#[from] DirectoryError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Branch not found
    #[inline]
    #[must_use]
    pub fn branch_not_found(branch_id: &BranchId) -> Self {
        Self::NotFound(format!("branch {branch_id}"))
    }

    /// Member not found
    #[inline]
    #[must_use]
    pub fn member_not_found(employee_ps_id: &EmployeePsId) -> Self {
        Self::NotFound(format!("member {employee_ps_id}"))
    }

    /// Check if the error ends the call with no point in retrying it as is
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::IdentityMissing(_) | Self::Config(_)
        )
    }

    /// Check if the next scheduled run may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::VendorCallFailed(e) => e.is_retryable(),
            Self::StoreWriteFailed(_) | Self::StoreReadFailed(_) | Self::DirectoryReadFailed(_) => {
                true
            }
            Self::NotFound(_) | Self::IdentityMissing(_) | Self::Config(_) => false,
        }
    }
}

/// Vendor gateway errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Vendor answered with an error status
    #[error("vendor rejected {operation}: {message}")]
    Rejected {
        /// Gateway operation name
        operation: &'static str,
        /// Vendor message
        message: String,
    },

    /// Addressed user or group does not exist
    #[error("vendor entity not found: {0}")]
    NotFound(String),

    /// Transport failure
    #[error("vendor unavailable: {0}")]
    Unavailable(String),

    /// Call exceeded the configured timeout
    #[error("vendor call {operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Gateway operation name
        operation: &'static str,
        /// Timeout applied
        timeout_ms: u64,
    },
}

impl GatewayError {
    /// Rejected call
    #[inline]
    #[must_use]
    pub fn rejected(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation,
            message: message.into(),
        }
    }

    /// Check if the call may succeed when repeated
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Organizational directory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// Directory unreachable
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// Addressed entity missing on a write
    #[error("directory entity not found: {0}")]
    NotFound(String),
}

/// Local mirror store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Store unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Write refused
    #[error("store write rejected: {0}")]
    Rejected(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML did not parse
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}
