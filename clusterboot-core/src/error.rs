//! Error types for clusterboot
//!
//! Error taxonomy covering configuration, transport, coordination and
//! provisioning failures of a bootstrap episode.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Bootstrap phase an error or timeout belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the instance role credentials
    RoleGate,
    /// Waiting for launch-group success notices
    LaunchWatch,
    /// Resolving group members to running addresses
    MembershipResolve,
    /// Worker waiting for the membership broadcast
    BroadcastWait,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::RoleGate => "role-gate",
            Phase::LaunchWatch => "launch-watch",
            Phase::MembershipResolve => "membership-resolve",
            Phase::BroadcastWait => "broadcast-wait",
        };
        f.write_str(name)
    }
}

/// Coarse classification used by the top-level boundary when reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration
    Config,
    /// Transport or payload problem that a later poll may not hit
    Transient,
    /// A phase ran out of budget
    Timeout,
    /// An invariant of the rendezvous does not hold
    Precondition,
    /// Anything else
    Fatal,
}

/// Primary error type for all bootstrap operations
#[derive(Debug, Error)]
pub enum BootstrapError {
    // ========== Configuration Errors ==========

    /// Required configuration key is absent
    #[error("Missing configuration: {key}")]
    MissingConfig { key: String },

    /// Configuration value could not be used
    #[error("Invalid configuration for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },

    /// Node role is neither master nor worker
    #[error("Unknown node type: {role}")]
    UnknownRole { role: String },

    // ========== Transport Errors ==========

    /// Connection to a remote endpoint failed
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Remote service returned an error response
    #[error("{service} returned {code} (status {status}): {message}")]
    ServiceError {
        service: String,
        code: String,
        message: String,
        status: u16,
    },

    /// No usable credentials for signing requests
    #[error("Credentials unavailable: {reason}")]
    CredentialsUnavailable { reason: String },

    // ========== Protocol Errors ==========

    /// Message payload could not be interpreted
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    // ========== Coordination Errors ==========

    /// Budget queried after its deadline
    #[error("Deadline budget expired")]
    BudgetExpired,

    /// A phase did not finish inside its budget
    #[error("Timeout in {phase} after {elapsed:?} (budget {budget:?}): {detail}")]
    Timeout {
        phase: Phase,
        elapsed: Duration,
        budget: Duration,
        detail: String,
    },

    /// Resolution did not produce exactly one master address
    #[error("Expected exactly one master address, resolved {count}")]
    MasterCountMismatch { count: usize },

    /// Instance role credentials never became available
    #[error("Instance role {role} not available within budget")]
    RoleUnavailable { role: String },

    // ========== Provisioning Errors ==========

    /// Local file operation failed
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Completion signal could not be delivered
    #[error("Completion signal failed: {reason}")]
    SignalFailed { reason: String },

    // ========== Runtime Errors ==========

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BootstrapError {
    /// Creates an I/O error bound to a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BootstrapError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if a poller may treat this error as another iteration
    pub fn is_retryable(&self) -> bool {
        match self {
            BootstrapError::ConnectionFailed { .. } => true,
            BootstrapError::ServiceError { status, code, .. } => {
                *status >= 500 || is_transient_code(code)
            }
            _ => false,
        }
    }

    /// Classifies the error for reporting at the top-level boundary
    pub fn kind(&self) -> ErrorKind {
        match self {
            BootstrapError::MissingConfig { .. }
            | BootstrapError::InvalidConfig { .. }
            | BootstrapError::UnknownRole { .. } => ErrorKind::Config,
            BootstrapError::ConnectionFailed { .. }
            | BootstrapError::ServiceError { .. }
            | BootstrapError::InvalidMessage { .. } => ErrorKind::Transient,
            BootstrapError::BudgetExpired
            | BootstrapError::Timeout { .. }
            | BootstrapError::RoleUnavailable { .. } => ErrorKind::Timeout,
            BootstrapError::MasterCountMismatch { .. } => ErrorKind::Precondition,
            _ => ErrorKind::Fatal,
        }
    }

    /// Process exit code for this error. The protocol is all-or-nothing,
    /// so every failure exits with 1.
    pub fn exit_code(&self) -> u8 {
        1
    }
}

/// Service error codes worth another poll: throttling, and instance ids the
/// directory has not caught up with yet
fn is_transient_code(code: &str) -> bool {
    matches!(
        code,
        "Throttling"
            | "ThrottlingException"
            | "RequestThrottled"
            | "RequestLimitExceeded"
            | "ServiceUnavailable"
            | "InternalError"
            | "AWS.SimpleQueueService.RequestThrottled"
            | "InvalidInstanceID.NotFound"
    ) || code.ends_with("#ThrottlingException")
}

/// Result type alias for bootstrap operations
pub type Result<T> = std::result::Result<T, BootstrapError>;
