use dotenvy::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use trueque_market::{
    app::AppContext,
    config::{database, settings},
    errors::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; env vars can also be set externally
    dotenv().ok();

    // 3. Load settings (config.toml or MARKET_CONFIG)
    let settings = settings::load_default_settings()
        .inspect_err(|e| error!("Failed to load settings: {}", e))?;
    info!(
        "Settings loaded: {} vouchers in catalog.",
        settings.vouchers.len()
    );

    // 4. Connect, create the schema and seed the catalog
    let db = database::create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    let ctx = AppContext::new(db, settings);
    ctx.prepare()
        .await
        .inspect(|()| info!("Database ready at {}", database::get_database_url()))
        .inspect_err(|e| error!("Failed to prepare database: {}", e))?;

    let available = trueque_market::core::voucher::list_available(&ctx.database).await?;
    info!("{} vouchers available for redemption.", available.len());
    Ok(())
}
