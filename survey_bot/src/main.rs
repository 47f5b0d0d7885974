mod config;
mod telegram;

use anyhow::Context;
use std::sync::Arc;
use survey_core::Survey;
use survey_core::db;
use survey_core::dispatcher::{ListenerGuard, SurveyDispatcher};
use teloxide::types::Me;
use teloxide::{prelude::*, utils::command::BotCommands};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::telegram::{BotCommand, TelegramGateway};

async fn handle_update(
    update: Update,
    me: Me,
    config: Arc<Config>,
    dispatcher: Arc<SurveyDispatcher>,
) -> ResponseResult<()> {
    let bot_username = if config.bot_username.is_empty() {
        me.username()
    } else {
        config.bot_username.as_str()
    };
    if let Some(inbound) = telegram::inbound(&update, bot_username) {
        dispatcher.handle_update(inbound).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting survey bot...");

    let config = Config::from_env()?;

    let survey = Survey::load(config.survey_path.as_deref()).context("failed to load questionnaire")?;
    info!("Loaded questionnaire \"{}\" with {} questions", survey.title, survey.len());
    let survey = Arc::new(survey);

    let pool = db::init_db(&config.database_url)
        .await
        .with_context(|| format!("failed to open database {}", config.database_url))?;
    info!("Database ready at {}", config.database_url);

    if let Some(admin) = config.admin_bootstrap {
        db::ensure_admin(&pool, admin)
            .await
            .context("failed to grant bootstrap admin")?;
        info!("Bootstrap admin: {}", admin);
    }

    let Some(_listener) = ListenerGuard::acquire() else {
        anyhow::bail!("update listener is already running in this process");
    };

    let bot = Bot::new(&config.bot_token);
    if let Err(e) = bot.set_my_commands(BotCommand::bot_commands()).await {
        warn!("Failed to register command menu: {}", e);
    }

    let gateway = Arc::new(TelegramGateway::new(bot.clone()));
    let dispatcher = Arc::new(SurveyDispatcher::new(pool.clone(), survey, gateway));
    let config = Arc::new(config);

    let handler = dptree::entry().endpoint(handle_update);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![config, dispatcher])
        .distribution_function(|update: &Update| update.from().map(|user| user.id))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    pool.close().await;
    info!("Bot has stopped.");
    Ok(())
}
