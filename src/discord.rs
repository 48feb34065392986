//! Serenity-backed implementations of the punishment capability seams.
//!
//! Role and member mutations go over REST; presence checks (guild
//! membership, voice sessions, role hierarchy) read the gateway cache.

use crate::data::GuildConfig;
use crate::punishment::{MemberInfo, ModLog, ModLogError, Platform, PlatformError};
use async_trait::async_trait;
use dashmap::DashMap;
use poise::serenity_prelude as serenity;
use serenity::builder::{EditMember, EditMessage};
use serenity::{Cache, ChannelId, GuildId, Http, MessageId, RoleId, UserId};
use std::sync::Arc;
use tracing::debug;

const AUDIT_REASON: &str = "Timed mute";

fn api_err(e: serenity::Error) -> PlatformError {
    PlatformError::Api(e.to_string())
}

pub struct DiscordPlatform {
    http: Arc<Http>,
    cache: Arc<Cache>,
    configs: Arc<DashMap<u64, GuildConfig>>,
}

impl DiscordPlatform {
    #[must_use]
    pub fn new(
        http: Arc<Http>,
        cache: Arc<Cache>,
        configs: Arc<DashMap<u64, GuildConfig>>,
    ) -> Self {
        Self {
            http,
            cache,
            configs,
        }
    }

    /// Highest role position of a cached member, -1 when unknown
    fn top_role_position(&self, guild_id: GuildId, user_id: UserId) -> i64 {
        let Some(guild) = self.cache.guild(guild_id) else {
            return -1;
        };
        guild
            .members
            .get(&user_id)
            .map(|member| {
                member
                    .roles
                    .iter()
                    .filter_map(|role_id| guild.roles.get(role_id))
                    .map(|role| i64::from(role.position))
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(-1)
    }

    fn voice_session(&self, guild_id: GuildId, user_id: UserId) -> bool {
        self.cache
            .guild(guild_id)
            .is_some_and(|guild| guild.voice_states.contains_key(&user_id))
    }
}

#[async_trait]
impl Platform for DiscordPlatform {
    async fn has_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<bool, PlatformError> {
        let member = GuildId::new(guild_id)
            .member(&self.http, UserId::new(user_id))
            .await
            .map_err(api_err)?;
        Ok(member.roles.contains(&RoleId::new(role_id)))
    }

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), PlatformError> {
        self.http
            .add_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(AUDIT_REASON),
            )
            .await
            .map_err(api_err)
    }

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), PlatformError> {
        self.http
            .remove_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(AUDIT_REASON),
            )
            .await
            .map_err(api_err)
    }

    async fn resolve_member(&self, guild_id: u64, user_id: u64) -> Option<MemberInfo> {
        let member = GuildId::new(guild_id)
            .member(&self.http, UserId::new(user_id))
            .await
            .ok()?;
        let in_voice = self.voice_session(GuildId::new(guild_id), UserId::new(user_id));
        Some(MemberInfo {
            user_id,
            display_name: member.display_name().to_string(),
            in_voice,
        })
    }

    async fn send_direct_message(&self, user_id: u64, text: &str) -> bool {
        let channel = match UserId::new(user_id).create_dm_channel(&self.http).await {
            Ok(channel) => channel,
            Err(e) => {
                debug!(user_id, error = %e, "Could not open direct-message channel");
                return false;
            }
        };
        match channel.id.say(&self.http, text).await {
            Ok(_) => true,
            Err(e) => {
                debug!(user_id, error = %e, "Could not deliver direct message");
                false
            }
        }
    }

    async fn set_voice_mute(
        &self,
        guild_id: u64,
        user_id: u64,
        muted: bool,
    ) -> Result<(), PlatformError> {
        if !self.voice_session(GuildId::new(guild_id), UserId::new(user_id)) {
            return Err(PlatformError::NoVoiceSession(user_id));
        }
        GuildId::new(guild_id)
            .edit_member(
                &self.http,
                UserId::new(user_id),
                EditMember::new().mute(muted),
            )
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn can_moderate(&self, guild_id: u64, actor_id: u64, target_id: u64) -> bool {
        let guild_id = GuildId::new(guild_id);
        {
            let Some(guild) = self.cache.guild(guild_id) else {
                return false;
            };
            if guild.owner_id == UserId::new(actor_id) {
                return true;
            }
            if guild.owner_id == UserId::new(target_id) {
                return false;
            }
        }
        self.top_role_position(guild_id, UserId::new(actor_id))
            > self.top_role_position(guild_id, UserId::new(target_id))
    }

    fn restriction_role(&self, guild_id: u64) -> Option<u64> {
        self.configs
            .get(&guild_id)
            .and_then(|config| config.punish_role_id)
    }

    async fn role_manageable(&self, guild_id: u64, role_id: u64) -> bool {
        let guild_id = GuildId::new(guild_id);
        let bot_id = self.cache.current_user().id;
        let role_position = {
            let Some(guild) = self.cache.guild(guild_id) else {
                return false;
            };
            match guild.roles.get(&RoleId::new(role_id)) {
                Some(role) if !role.managed => i64::from(role.position),
                _ => return false,
            }
        };
        self.top_role_position(guild_id, bot_id) > role_position
    }

    fn has_guild_access(&self, guild_id: u64) -> bool {
        self.cache.guilds().contains(&GuildId::new(guild_id))
    }
}

/// Moderation log backed by a per-guild text channel. A case is the
/// posted message; its id doubles as the case reference, and later
/// notes are appended by editing that message.
pub struct ChannelModLog {
    http: Arc<Http>,
    configs: Arc<DashMap<u64, GuildConfig>>,
}

impl ChannelModLog {
    #[must_use]
    pub fn new(http: Arc<Http>, configs: Arc<DashMap<u64, GuildConfig>>) -> Self {
        Self { http, configs }
    }

    fn channel(&self, guild_id: u64) -> Result<ChannelId, ModLogError> {
        self.configs
            .get(&guild_id)
            .and_then(|config| config.modlog_channel_id)
            .map(ChannelId::new)
            .ok_or_else(|| ModLogError::Unavailable("no log channel configured".to_string()))
    }
}

#[async_trait]
impl ModLog for ChannelModLog {
    async fn open_case<'a>(
        &self,
        guild_id: u64,
        user_id: u64,
        moderator_id: u64,
        action: &str,
        reason: Option<&'a str>,
    ) -> Result<u64, ModLogError> {
        let channel = self.channel(guild_id)?;
        let mut content = format!("**{action}** | member <@{user_id}> | moderator <@{moderator_id}>");
        if let Some(reason) = reason {
            content.push_str(&format!("\nReason: {reason}"));
        }
        let message = channel
            .say(&self.http, content)
            .await
            .map_err(|_| ModLogError::AccessDenied)?;
        Ok(message.id.get())
    }

    async fn update_case(
        &self,
        guild_id: u64,
        case_ref: u64,
        note: &str,
    ) -> Result<(), ModLogError> {
        let channel = self.channel(guild_id)?;
        let message = channel
            .message(&self.http, MessageId::new(case_ref))
            .await
            .map_err(|_| ModLogError::CaseNotFound(case_ref))?;
        let content = format!("{}\n- {note}", message.content);
        channel
            .edit_message(
                &self.http,
                MessageId::new(case_ref),
                EditMessage::new().content(content),
            )
            .await
            .map_err(|_| ModLogError::AccessDenied)?;
        Ok(())
    }
}
