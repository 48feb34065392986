//! Capability seams toward the chat platform
//!
//! The lifecycle manager talks to Discord (and the optional moderation
//! log) only through these traits, which keeps the core testable and the
//! serenity glue at the edge.

use crate::punishment::error::{ModLogError, PlatformError};
use async_trait::async_trait;

/// What the manager needs to know about a resolved member
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub user_id: u64,
    pub display_name: String,
    /// Whether the member currently has an active voice session
    pub in_voice: bool,
}

/// Chat-platform capabilities consumed by the lifecycle manager.
///
/// Role mutations are idempotent from the caller's perspective: adding an
/// already-present role is a no-op success.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    async fn has_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<bool, PlatformError>;

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), PlatformError>;

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), PlatformError>;

    async fn resolve_member(&self, guild_id: u64, user_id: u64) -> Option<MemberInfo>;

    /// Best-effort; failures are swallowed and reported as false
    async fn send_direct_message(&self, user_id: u64, text: &str) -> bool;

    /// Only effective while the member has an active voice session
    async fn set_voice_mute(
        &self,
        guild_id: u64,
        user_id: u64,
        muted: bool,
    ) -> Result<(), PlatformError>;

    /// Hierarchy check: may `actor_id` act on `target_id` in this guild
    async fn can_moderate(&self, guild_id: u64, actor_id: u64, target_id: u64) -> bool;

    /// The single configured restriction role for the guild, if any
    fn restriction_role(&self, guild_id: u64) -> Option<u64>;

    /// Whether the bot's own highest role outranks `role_id`
    async fn role_manageable(&self, guild_id: u64, role_id: u64) -> bool;

    /// Whether the process still has access to the guild at all
    fn has_guild_access(&self, guild_id: u64) -> bool;
}

/// Optional external moderation case log. Resolved once at startup and
/// passed into the manager; failures are never fatal to the punishment
/// operation itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModLog: Send + Sync {
    /// Open a case and return its reference
    async fn open_case<'a>(
        &self,
        guild_id: u64,
        user_id: u64,
        moderator_id: u64,
        action: &str,
        reason: Option<&'a str>,
    ) -> Result<u64, ModLogError>;

    /// Append a note to an existing case
    async fn update_case(&self, guild_id: u64, case_ref: u64, note: &str)
    -> Result<(), ModLogError>;
}
