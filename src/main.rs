use std::env;
use std::sync::Arc;

use mutekeeper::punishment::{ExpirationScheduler, PunishmentManager, PunishmentStore};
use mutekeeper::{Data, Error, commands, discord, handlers, logging};
use poise::serenity_prelude::{self as serenity};
use serenity::GatewayIntents;
use tracing::{info, warn};

const PUNISHMENT_FILE: &str = "data/punishments.yaml";

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    // Initialize logging
    logging::init()?;

    // Load environment variables
    let token = env::var("DISCORD_TOKEN").expect("DISCORD_TOKEN must be set");

    // Set up the bot's data
    let data = Data::load().await;

    // Configure the Poise framework
    let setup_data = data.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                commands::ping(),
                commands::punish(),
                commands::unpunish(),
                commands::punished(),
            ],
            pre_command: |ctx| {
                Box::pin(async move {
                    // Log the start of command execution
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    // Log the end of command execution
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    // Log the error using our logging system
                    mutekeeper::logging::log_command_error(&error);
                })
            },
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(setup_data)
            })
        })
        .build();

    // Role and voice-state tracking both need privileged intents
    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::MESSAGE_CONTENT;
    let mut client = serenity::ClientBuilder::new(token, intents)
        .event_handler(handlers::Handler::new(data.clone()))
        .framework(framework)
        .await
        .expect("Failed to create client");

    // The platform layer shares the client's http and cache handles, so
    // the manager is wired up after the client exists but before it runs.
    let store = PunishmentStore::new(PUNISHMENT_FILE);
    if let Err(e) = store.load().await {
        warn!(error = %e, "Could not load punishment store, starting empty");
    }
    let platform = Arc::new(discord::DiscordPlatform::new(
        Arc::clone(&client.http),
        Arc::clone(&client.cache),
        data.guild_configs_handle(),
    ));
    let modlog = Arc::new(discord::ChannelModLog::new(
        Arc::clone(&client.http),
        data.guild_configs_handle(),
    ));
    let scheduler = Arc::new(ExpirationScheduler::new());
    let manager = Arc::new(PunishmentManager::new(
        store,
        scheduler,
        platform,
        Some(modlog),
    ));
    manager.install_callback();
    data.set_manager(manager);

    info!("Starting bot...");
    // Start the bot; reconciliation and the expiration loop begin once
    // the cache is ready.
    if let Err(err) = client.start().await {
        eprintln!("Error starting the bot: {err}");
    }

    Ok(())
}

fn main() {
    // Run the async main function
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async_main());

    // Handle any errors that occurred during execution
    if let Err(err) = result {
        eprintln!("Error: {err}");
    }
}
