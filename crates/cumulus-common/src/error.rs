use thiserror::Error;

/// Fatal failures surfaced to callers.
///
/// "Not ready" outcomes are deliberately *not* represented here: operations
/// that can legitimately find no source to work from return a negative value
/// (`Ok(None)` / `Ok(false)`) so callers can poll and retry, while every
/// variant below aborts the operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed, missing, or contradictory parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resource limit exceeded for account {account_id}: {resource}")]
    ResourceLimitExceeded { account_id: String, resource: String },

    /// The keyed lock guarding an association could not be acquired in time.
    #[error("timed out acquiring lock on {key}")]
    LockTimeout { key: String },

    /// Operator error (missing adapter, secondary host without a storage
    /// URL). Never tolerated silently.
    #[error("configuration inconsistency: {0}")]
    ConfigurationInconsistency(String),

    /// Extraction mode is not one of the recognized literals.
    #[error("invalid extraction mode {0:?}, expected \"ftp_upload\" or \"http_download\"")]
    InvalidMode(String),

    /// Extraction push target is unusable (wrong scheme, local/multicast
    /// address, IPv6).
    #[error("invalid extraction target: {0}")]
    InvalidTarget(String),

    #[error("unable to resolve host {0}")]
    UnresolvedHost(String),

    /// VM is not in a state that permits the requested change.
    #[error("invalid VM state: {0}")]
    InvalidState(String),

    #[error("incompatible hypervisor: {0}")]
    IncompatibleHypervisor(String),

    /// Persistence-layer failure.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
