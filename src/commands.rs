use crate::punishment::{PunishError, PunishOutcome, parse_duration, render_duration};
use crate::{Data, Error};
use chrono::Utc;
use poise::serenity_prelude as serenity;
use poise::{Context, command};
use std::fmt::Write as _;

/// Fetch the manager or tell the caller the bot is still starting up
macro_rules! manager {
    ($ctx:expr) => {
        match $ctx.data().manager() {
            Some(manager) => manager,
            None => {
                $ctx.say("Still starting up, try again in a moment.").await?;
                return Ok(());
            }
        }
    };
}

/// Basic ping command
/// This command is used to check if the bot is responsive.
#[command(prefix_command, slash_command, guild_only)]
pub async fn ping(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    ctx.say("Pong!").await?;
    Ok(())
}

/// Mute a member for a duration, or indefinitely if none is given.
///
/// Durations read like `30m`, `1h30m` or `2 hours, 15 minutes`; issuing
/// the command again for an already muted member renews the mute.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_ROLES"
)]
pub async fn punish(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to mute"] member: serenity::User,
    #[description = "How long, e.g. 1h30m (omit for indefinite)"] duration: Option<String>,
    #[description = "Reason shown in the moderation log"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let manager = manager!(ctx);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let seconds = match duration.as_deref() {
        Some(text) => match parse_duration(text) {
            Ok(seconds) => Some(seconds),
            Err(e) => {
                ctx.say(e.to_string()).await?;
                return Ok(());
            }
        },
        None => None,
    };

    let outcome = manager
        .punish(
            guild_id.get(),
            member.id.get(),
            ctx.author().id.get(),
            seconds,
            reason,
        )
        .await;

    let reply = match outcome {
        Ok(PunishOutcome::Applied { until }) => match until {
            Some(until) => format!(
                "{} is now muted for {}.",
                member.name,
                render_duration((until - Utc::now()).num_seconds().max(0), false)
            ),
            None => format!("{} is now muted indefinitely.", member.name),
        },
        Ok(PunishOutcome::Renewed { until, .. }) => match until {
            Some(until) => format!(
                "{} was already muted; now expiring in {}.",
                member.name,
                render_duration((until - Utc::now()).num_seconds().max(0), false)
            ),
            None => format!("{} was already muted; now indefinite.", member.name),
        },
        Err(e @ (PunishError::HierarchyDenied(_)
        | PunishError::RoleNotConfigured(_)
        | PunishError::RoleUnmanageable(_))) => e.to_string(),
        Err(e) => {
            tracing::error!(target: crate::ERROR_TARGET, error = %e, "punish failed");
            "Something went wrong applying the mute.".to_string()
        }
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Lift a member's mute early.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_ROLES"
)]
pub async fn unpunish(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to unmute"] member: serenity::User,
    #[description = "Reason recorded in the moderation log"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let manager = manager!(ctx);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let reply = match manager
        .unpunish(
            guild_id.get(),
            member.id.get(),
            reason.as_deref(),
            ctx.author().id.get(),
        )
        .await
    {
        Ok(true) => format!("{} has been unmuted.", member.name),
        Ok(false) => format!("{} is not muted.", member.name),
        Err(e) => {
            tracing::error!(target: crate::ERROR_TARGET, error = %e, "unpunish failed");
            "Could not remove the mute, it stays in place for now.".to_string()
        }
    };
    ctx.say(reply).await?;
    Ok(())
}

/// List the currently muted members of this guild.
#[command(prefix_command, slash_command, guild_only)]
pub async fn punished(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    let manager = manager!(ctx);
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let entries = manager.list_guild(guild_id.get());
    if entries.is_empty() {
        ctx.say("Nobody is muted right now.").await?;
        return Ok(());
    }

    let mut reply = String::from("Currently muted:\n");
    for (user_id, record) in entries {
        let expiry = match record.remaining_seconds() {
            Some(remaining) => format!("{} left", render_duration(remaining.max(0), true)),
            None => "indefinite".to_string(),
        };
        let reason = record.reason.as_deref().unwrap_or("no reason given");
        let _ = writeln!(reply, "- <@{user_id}> ({expiry}) by <@{}>: {reason}", record.issued_by);
    }
    ctx.say(reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Command definitions are checked at compile time by poise's macro;
    // these only assert the registration metadata.
    #[test]
    fn test_ping_command_definition() {
        let cmd = ping();
        assert_eq!(cmd.name, "ping");
        assert!(cmd.guild_only);
    }

    #[test]
    fn test_punish_command_definition() {
        let cmd = punish();
        assert_eq!(cmd.name, "punish");
        assert!(cmd.guild_only);
        assert_eq!(cmd.parameters.len(), 3);
        assert!(cmd.parameters[0].required);
        assert!(!cmd.parameters[1].required);
        assert!(!cmd.parameters[2].required);
    }

    #[test]
    fn test_unpunish_command_definition() {
        let cmd = unpunish();
        assert_eq!(cmd.name, "unpunish");
        assert!(cmd.guild_only);
        assert_eq!(cmd.parameters.len(), 2);
    }

    #[test]
    fn test_punished_command_definition() {
        let cmd = punished();
        assert_eq!(cmd.name, "punished");
        assert!(cmd.guild_only);
        assert!(cmd.parameters.is_empty());
    }
}
