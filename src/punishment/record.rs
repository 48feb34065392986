//! Punishment record and key types
//!
//! A record tracks one active restriction for one member in one guild.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the one punishment slot a member can occupy in a guild
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PunishKey {
    /// ID of the guild the restriction is scoped to
    pub guild_id: u64,
    /// ID of the restricted member
    pub user_id: u64,
}

impl PunishKey {
    #[must_use]
    pub fn new(guild_id: u64, user_id: u64) -> Self {
        Self { guild_id, user_id }
    }
}

impl fmt::Display for PunishKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.guild_id, self.user_id)
    }
}

/// One active punishment. A record exists exactly while the member should
/// carry the restriction role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunishmentRecord {
    /// When the punishment began, preserved across renewals
    pub start: DateTime<Utc>,
    /// Absolute expiry, or None for an indefinite punishment
    pub until: Option<DateTime<Utc>>,
    /// Moderator who created or last renewed the punishment
    pub issued_by: u64,
    /// Free-text reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Moderation-log case reference, if a case was opened
    #[serde(default)]
    pub case_ref: Option<u64>,
    /// Whether a voice unmute is still owed once the member is reachable
    #[serde(default)]
    pub unmute_pending: bool,
}

impl PunishmentRecord {
    /// Create a record starting now, expiring after `duration` seconds
    /// (or never, for None).
    #[must_use]
    pub fn new(issued_by: u64, duration: Option<u64>, reason: Option<String>) -> Self {
        let start = Utc::now();
        Self {
            start,
            until: until_after(start, duration),
            issued_by,
            reason,
            case_ref: None,
            unmute_pending: false,
        }
    }

    /// Renew in place: `start` is kept, expiry and bookkeeping are replaced.
    pub fn renew(&mut self, issued_by: u64, duration: Option<u64>, reason: Option<String>) {
        self.until = until_after(Utc::now(), duration);
        self.issued_by = issued_by;
        if reason.is_some() {
            self.reason = reason;
        }
    }

    /// Whether the punishment's expiry has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.until.is_some_and(|until| until <= Utc::now())
    }

    /// Seconds left until expiry; None for indefinite punishments
    #[must_use]
    pub fn remaining_seconds(&self) -> Option<i64> {
        self.until.map(|until| (until - Utc::now()).num_seconds())
    }
}

/// Checked expiry computation. Durations too large for the chrono range
/// degrade to indefinite rather than panicking or wrapping behind the
/// start time.
fn until_after(from: DateTime<Utc>, duration: Option<u64>) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(duration?).ok()?;
    Duration::try_seconds(secs).and_then(|d| from.checked_add_signed(d))
}
