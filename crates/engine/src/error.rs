//! Engine error types

use thiserror::Error;

/// Errors surfaced by the transfer engine.
///
/// Failures during issuance (`ResourceExhausted`, `TransportRejected`) are
/// handled locally where possible; they reach the caller only when zero
/// bytes ultimately transferred.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The request parameters cannot be segmented
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation of a sub-transfer, its packet table, or its buffer window failed
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The transport refused a segment submission synchronously
    #[error("Transport rejected submission: {0}")]
    TransportRejected(String),

    /// A submitted segment completed with a failure status
    #[error("Transport failure: {0}")]
    TransportFailed(String),

    /// The request was cancelled before any data moved
    #[error("Transfer cancelled")]
    Cancelled,
}

/// Errors surfaced by the device-list change notifier.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The notifier service is not running
    #[error("Notifier service stopped")]
    ServiceStopped,

    /// The watcher id is not registered
    #[error("Unknown watcher: {0}")]
    UnknownWatcher(u64),

    /// External broadcast registration failed
    #[error("Broadcast registration failed for {guid}: {reason}")]
    BroadcastRegistration { guid: String, reason: String },
}
