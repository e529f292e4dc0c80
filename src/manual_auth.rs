use chrono::Utc;
use esm_broker::kite::extract_request_token_from_url;
use esm_broker::{ApiCredentials, Broker, BrokerError};
use sqlx::SqlitePool;
use std::io::{self, Write};
use tracing::info;

use crate::credentials::IssuedToken;
use crate::store::{self, PersistenceError};

#[derive(Debug, thiserror::Error)]
pub enum ManualAuthError {
    #[error("Invalid redirect URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Redirect URL carries no request_token")]
    MissingRequestToken,
    #[error("Request token exchange failed: {0}")]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("Terminal I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Exchanges the request token found in `redirect_url` and stores the
/// resulting access token.
pub async fn exchange_redirect(
    pool: &SqlitePool,
    broker: &dyn Broker,
    credentials: &ApiCredentials,
    redirect_url: &str,
) -> Result<IssuedToken, ManualAuthError> {
    let request_token = extract_request_token_from_url(redirect_url.trim())?
        .ok_or(ManualAuthError::MissingRequestToken)?;

    let grant = broker
        .generate_session(credentials, &request_token)
        .await?;
    let token = IssuedToken::new(grant.access_token, Utc::now());
    store::save(pool, &token).await?;

    info!(user_id = %grant.user_id, "Access token stored");
    Ok(token)
}

/// Interactive flow for the `esm-auth` binary.
pub async fn run_manual_auth(
    pool: &SqlitePool,
    broker: &dyn Broker,
    credentials: &ApiCredentials,
) -> Result<(), ManualAuthError> {
    println!(
        "Log in to Kite and paste the URL you are redirected to: {}",
        broker.login_url(&credentials.api_key)
    );
    print!("Redirect URL: ");
    io::stdout().flush()?;

    let mut redirect_url = String::new();
    io::stdin().read_line(&mut redirect_url)?;

    exchange_redirect(pool, broker, credentials, &redirect_url).await?;
    println!("Access token stored");

    Ok(())
}
