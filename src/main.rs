use std::env;
use std::sync::{Arc, OnceLock};

use poise::serenity_prelude::{self as serenity};
use serenity::GatewayIntents;
use tracing::{error, info};

use ticket_warden::config::BotConfig;
use ticket_warden::platform::DiscordPlatform;
use ticket_warden::tickets::{Storage, TicketService, YamlStorage};
use ticket_warden::{Data, Error, commands, handlers, logging};

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    let config = BotConfig::load(BotConfig::path()).await?;
    logging::init(&config.log_dir)?;

    let token = env::var("DISCORD_TOKEN").map_err(|_| "DISCORD_TOKEN must be set")?;

    let storage: Arc<dyn Storage> = Arc::new(YamlStorage::open(&config.data_dir).await?);
    info!(data_dir = %config.data_dir.display(), "Opened ticket database");

    // Filled in by setup, once the gateway context exists
    let service_slot: Arc<OnceLock<Arc<TicketService>>> = Arc::new(OnceLock::new());
    let setup_slot = Arc::clone(&service_slot);
    let prefix = config.prefix.clone();

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: Some(prefix),
                ..Default::default()
            },
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| Box::pin(logging::on_error(error)),
            event_handler: |ctx, event, framework, data| {
                Box::pin(handlers::event_handler(ctx, event, framework, data))
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                let platform = Arc::new(DiscordPlatform::new(ctx.clone()));
                let service = TicketService::new(storage, platform, config.service_settings());
                let report = service.start().await?;
                logging::log_console(&format!(
                    "Loaded {} guild(s), restored {} queued ticket(s)",
                    report.guilds, report.queued
                ));
                // A second setup would mean a reconnect; keep the first service
                let _ = setup_slot.set(Arc::clone(&service));

                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(Data::new(config, service))
            })
        })
        .build();

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MODERATION
        | GatewayIntents::DIRECT_MESSAGES;
    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await?;

    let shard_manager = Arc::clone(&client.shard_manager);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            return;
        }
        info!("Shutting down...");
        shard_manager.shutdown_all().await;
    });

    info!("Starting bot...");
    let result = client.start().await;

    if let Some(service) = service_slot.get() {
        service.shutdown().await;
    }
    result?;
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error building runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
