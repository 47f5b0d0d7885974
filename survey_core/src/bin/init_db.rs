use anyhow::Context;

const DEFAULT_DATABASE_URL: &str = "sqlite://data/survey.db";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let pool = survey_core::db::init_db(&database_url)
        .await
        .with_context(|| format!("failed to initialise {}", database_url))?;
    pool.close().await;
    Ok(())
}
