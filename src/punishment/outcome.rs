//! Structured operation outcomes
//!
//! The core never formats user-facing text; the command layer renders
//! these into replies.

use chrono::{DateTime, Utc};

/// Result of a successful `punish` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PunishOutcome {
    /// A new punishment was created and the role applied
    Applied { until: Option<DateTime<Utc>> },
    /// An existing punishment was renewed in place; `start` is the
    /// original punishment start, preserved across the renewal
    Renewed {
        start: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    },
}

impl PunishOutcome {
    /// Expiry carried by either variant
    #[must_use]
    pub fn until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Applied { until } | Self::Renewed { until, .. } => *until,
        }
    }
}
