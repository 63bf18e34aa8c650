use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use tracing::{error, info};

use tg_imaginebot::queue::ImagineQueue;
use tg_imaginebot::sd::SdClient;
use tg_imaginebot::{config, db, handlers};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/imaginebot.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let sd_client = Arc::new(SdClient::new(&cfg.sd.host)?);
    let queue = Arc::new(ImagineQueue::new(
        pool,
        sd_client,
        Duration::from_millis(cfg.app.queue_poll_ms),
        Duration::from_millis(cfg.app.progress_poll_ms),
    ));

    // Spawn the single generation worker; it stops pulling jobs on interrupt.
    let worker = Arc::clone(&queue);
    tokio::spawn(async move {
        if let Err(err) = worker.run().await {
            error!(?err, "queue worker stopped with error");
        }
    });

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let allowed_users = Arc::new(cfg.telegram.allowed_users.clone());

    info!("starting telegram bot");
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_callback_query().endpoint(on_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![queue, allowed_users])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn on_message(
    bot: Bot,
    queue: Arc<ImagineQueue>,
    allowed_users: Arc<Vec<i64>>,
    msg: Message,
) -> ResponseResult<()> {
    if let Err(err) = handlers::handle_message(&bot, &queue, &allowed_users, &msg).await {
        error!(?err, "failed to handle message");
    }
    Ok(())
}

async fn on_callback(
    bot: Bot,
    queue: Arc<ImagineQueue>,
    allowed_users: Arc<Vec<i64>>,
    callback: CallbackQuery,
) -> ResponseResult<()> {
    if let Err(err) = handlers::handle_callback(&bot, &queue, &allowed_users, &callback).await {
        error!(?err, "failed to handle callback query");
    }
    Ok(())
}
