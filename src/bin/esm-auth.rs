use clap::Parser;
use esm_broker::{Broker, KiteBroker, KiteEnv};
use esm_trader::manual_auth::run_manual_auth;
use esm_trader::{LogLevel, setup_tracing, store};
use tracing::debug;

#[derive(Parser, Debug)]
struct AuthEnv {
    #[clap(long = "db", env)]
    database_url: String,
    #[clap(long, env, default_value = "info")]
    log_level: LogLevel,
    #[clap(flatten)]
    kite: KiteEnv,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv_override().ok();
    let env = AuthEnv::try_parse()?;
    setup_tracing(&env.log_level);

    debug!("Connecting to SQLite...");
    let pool = sqlx::SqlitePool::connect(&env.database_url).await?;
    store::migrate(&pool).await?;

    let broker = KiteBroker::new(&env.kite)?;
    debug!(broker = %broker.to_supported_broker(), "Broker client ready");

    run_manual_auth(&pool, &broker, &env.kite.api_credentials()).await?;

    Ok(())
}
