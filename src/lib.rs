use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub mod compliance;
pub mod credentials;
pub mod env;
pub mod execution;
pub mod manual_auth;
pub mod notify;
pub mod scheduler;
pub mod stocks;
pub mod store;
pub mod token;

#[cfg(test)]
pub mod test_utils;

pub use env::{Env, LogLevel, setup_tracing};

use crate::compliance::ComplianceValidator;
use crate::credentials::{Credential, CredentialStore};
use crate::execution::ExecutionEngine;
use crate::notify::{LogNotifier, NotificationDispatcher};
use crate::scheduler::{Scheduler, SystemClock};
use crate::token::{TokenConfig, TokenManager};

pub async fn launch(env: Env) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;
    store::migrate(&pool).await?;

    let intents = stocks::load_stock_list(&env.stocks_csv)?;
    let broker = env.get_broker()?;
    let auto_login = env.auto_login()?;
    let validator = ComplianceValidator::new(env.execution.restriction()?);
    let schedule = env.schedule.schedule_config()?;
    let call_timeout = env.kite.request_timeout();

    let stored = store::load_latest(&pool).await?;
    if stored.is_none() {
        warn!("No stored access token, one must be acquired before trading");
    }
    let credentials = Arc::new(CredentialStore::new(Credential::new(
        env.kite.api_credentials(),
        stored,
    )));
    let persistence = store::spawn_persistence(pool.clone(), credentials.subscribe());

    let (notifications, dispatcher) = NotificationDispatcher::spawn(vec![Arc::new(LogNotifier)]);

    let tokens = Arc::new(TokenManager::new(
        broker.clone(),
        credentials,
        auto_login,
        notifications.clone(),
        TokenConfig {
            call_timeout,
            login_timeout: env.login.login_timeout(),
            ..TokenConfig::default()
        },
    ));
    if let Some(request_token) = env.request_token.clone() {
        tokens.supply_request_token(request_token).await;
    }

    match tokens.check_validity().await {
        Ok(state) => info!(?state, broker = %broker.to_supported_broker(), "Startup token check"),
        Err(e) => warn!("Startup token check failed: {e}"),
    }

    let engine = Arc::new(ExecutionEngine::new(
        broker,
        tokens.clone(),
        validator,
        notifications.clone(),
        env.execution.execution_config(call_timeout),
    ));
    let scheduler = Scheduler::new(
        tokens,
        engine,
        intents,
        schedule,
        Arc::new(SystemClock),
        notifications,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mode = env.run_mode();
    let mut scheduler_task = tokio::spawn(async move { scheduler.run(mode, shutdown_rx).await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Received shutdown signal, shutting down gracefully...");
            if shutdown_tx.send(true).is_err() {
                warn!("Scheduler already stopped");
            }
            if let Err(e) = (&mut scheduler_task).await {
                error!("Scheduler task panicked: {e}");
            }
        }

        result = &mut scheduler_task => {
            match result {
                Ok(()) => info!("Scheduler completed"),
                Err(e) => error!("Scheduler task panicked: {e}"),
            }
        }
    }

    // Both tasks end once every sender has been dropped with the scheduler.
    if let Err(e) = dispatcher.await {
        error!("Notification task panicked: {e}");
    }
    if let Err(e) = persistence.await {
        error!("Persistence task panicked: {e}");
    }

    info!("Shutdown complete");
    Ok(())
}
