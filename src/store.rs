//! SQLite persistence for issued access tokens.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::credentials::{Credential, IssuedToken};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), PersistenceError> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}

pub async fn save(pool: &SqlitePool, token: &IssuedToken) -> Result<(), PersistenceError> {
    sqlx::query(
        r"
        INSERT INTO kite_sessions (access_token, issued_at)
        VALUES (?, ?)
        ",
    )
    .bind(&token.access_token)
    .bind(token.issued_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recently issued token, if any was ever stored.
pub async fn load_latest(pool: &SqlitePool) -> Result<Option<IssuedToken>, PersistenceError> {
    let row = sqlx::query(
        r"
        SELECT access_token, issued_at
        FROM kite_sessions
        ORDER BY id DESC
        LIMIT 1
        ",
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let access_token: String = row.try_get("access_token")?;
    let issued_at: DateTime<Utc> = row.try_get("issued_at")?;

    Ok(Some(IssuedToken::new(access_token, issued_at)))
}

/// Writes every token change published on `credentials` until the sending
/// side is dropped. Write failures are logged and do not stop the task.
pub fn spawn_persistence(
    pool: SqlitePool,
    mut credentials: watch::Receiver<Credential>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while credentials.changed().await.is_ok() {
            let token = credentials.borrow_and_update().token.clone();
            let Some(token) = token else {
                continue;
            };

            match save(&pool, &token).await {
                Ok(()) => info!(issued_at = %token.issued_at, "Persisted access token"),
                Err(error) => error!(%error, "Failed to persist access token"),
            }
        }

        debug!("Credential store closed, persistence task exiting");
    })
}
