//! Error types for the punishment system
//!
//! This module defines the various errors that can occur during punishment operations.

use thiserror::Error;

/// Errors that can occur during punishment operations
#[derive(Debug, Error)]
pub enum PunishError {
    /// User-supplied duration string could not be parsed
    #[error("Invalid duration: {0}")]
    InvalidDurationFormat(String),

    /// Actor is not allowed to act on the target
    #[error("Hierarchy check failed: {0}")]
    HierarchyDenied(String),

    /// No restriction role is configured for the guild
    #[error("No restriction role configured for guild {0}")]
    RoleNotConfigured(u64),

    /// The restriction role outranks the bot's own highest role
    #[error("Restriction role {0} is not manageable by the bot")]
    RoleUnmanageable(u64),

    /// Transient platform I/O failure
    #[error("Platform unavailable: {0}")]
    PlatformUnavailable(#[from] PlatformError),

    /// Error reading or writing the punishment store
    #[error("Store error: {0}")]
    Store(String),
}

/// Failure surfaced by a platform capability call
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The underlying chat platform rejected or dropped the call
    #[error("Platform call failed: {0}")]
    Api(String),

    /// The member is not currently in a voice session
    #[error("Member {0} has no active voice session")]
    NoVoiceSession(u64),
}

/// Failures from the optional moderation-log capability, non-fatal everywhere
#[derive(Debug, Error)]
pub enum ModLogError {
    /// The referenced case no longer exists
    #[error("Case {0} not found")]
    CaseNotFound(u64),

    /// The bot cannot write to the moderation log
    #[error("Moderation log access denied")]
    AccessDenied,

    /// Transient failure reaching the moderation log
    #[error("Moderation log unavailable: {0}")]
    Unavailable(String),
}

/// Result type for punishment operations
pub type PunishResult<T> = Result<T, PunishError>;
