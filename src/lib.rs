pub mod commands;
pub mod data;
pub mod discord;
pub mod handlers;
pub mod logging;
pub mod punishment;

// Customize these constants for your bot
pub const BOT_NAME: &str = "mutekeeper";
pub const COMMAND_TARGET: &str = "mutekeeper::command";
pub const ERROR_TARGET: &str = "mutekeeper::error";
pub const EVENT_TARGET: &str = "mutekeeper::handlers";
pub const CONSOLE_TARGET: &str = "mutekeeper";

pub use data::{Data, DataInner, GuildConfig};
pub use punishment::{PunishmentManager, PunishmentStore};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
