//! Access token lifecycle.
//!
//! The [`TokenManager`] owns the process-wide [`TokenState`] and is the only
//! writer of the token held in the [`CredentialStore`]. Acquisition is
//! serialized: callers that queue up behind an in-flight attempt receive that
//! attempt's outcome rather than starting another login.

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use esm_broker::{BrokerError, DynBroker, LoginAutomator, LoginCredentials, Session};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::credentials::{CredentialStore, IssuedToken};
use crate::notify::{Event, NotificationDispatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Unverified,
    Valid,
    Expired,
    Acquiring,
    Failed,
}

/// Ways of obtaining a usable token, tried in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireStrategy {
    Reuse,
    ManualExchange { request_token: String },
    AutomatedLogin,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Network error while talking to the broker: {0}")]
    TransientNetwork(String),
    #[error("Broker rejected the credential: {0}")]
    AuthRejected(String),
    #[error("Broker refused the request: {0}")]
    BrokerRejected(String),
    #[error("Automated login failed: {0}")]
    LoginAutomationFailed(String),
    #[error("No way to obtain an access token: no valid token, request token or login configured")]
    NoStrategy,
}

impl From<BrokerError> for TokenError {
    fn from(error: BrokerError) -> Self {
        if error.is_auth_invalid() {
            Self::AuthRejected(error.to_string())
        } else if error.is_retryable() {
            Self::TransientNetwork(error.to_string())
        } else {
            Self::BrokerRejected(error.to_string())
        }
    }
}

/// The automator plus the account it logs in as.
#[derive(Debug, Clone)]
pub struct AutoLogin {
    pub automator: Arc<dyn LoginAutomator>,
    pub credentials: LoginCredentials,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Bound on a single broker call made while validating or exchanging.
    pub call_timeout: Duration,
    /// Bound on a whole automated login.
    pub login_timeout: Duration,
    pub validity_attempts: usize,
    pub validity_backoff: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(60),
            validity_attempts: 3,
            validity_backoff: Duration::from_secs(1),
        }
    }
}

type Outcome = Result<Session, TokenError>;

#[derive(Debug, Default)]
struct AcquisitionRecord {
    epoch: u64,
    last: Option<Outcome>,
}

#[derive(Debug)]
pub struct TokenManager {
    broker: DynBroker,
    store: Arc<CredentialStore>,
    auto_login: Option<AutoLogin>,
    notifications: NotificationDispatcher,
    config: TokenConfig,
    state: watch::Sender<TokenState>,
    pending_request_token: Mutex<Option<String>>,
    acquisition: Mutex<AcquisitionRecord>,
    epoch: AtomicU64,
}

impl TokenManager {
    pub fn new(
        broker: DynBroker,
        store: Arc<CredentialStore>,
        auto_login: Option<AutoLogin>,
        notifications: NotificationDispatcher,
        config: TokenConfig,
    ) -> Self {
        let (state, _) = watch::channel(TokenState::Unverified);

        Self {
            broker,
            store,
            auto_login,
            notifications,
            config,
            state,
            pending_request_token: Mutex::new(None),
            acquisition: Mutex::new(AcquisitionRecord::default()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> TokenState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TokenState> {
        self.state.subscribe()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Queues a one-time request token for the next acquisition. It is used
    /// at most once, whatever the outcome.
    pub async fn supply_request_token(&self, request_token: String) {
        *self.pending_request_token.lock().await = Some(request_token);
    }

    fn set_state(&self, state: TokenState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "Token state changed");
        }
    }

    /// Forgets that the stored token was verified, so the next `acquire`
    /// asks the broker again. Kite tokens expire daily, so each batch
    /// re-checks the token it trades with.
    pub fn mark_unverified(&self) {
        self.state.send_if_modified(|state| {
            if *state != TokenState::Valid {
                return false;
            }
            debug!("Stored access token marked unverified");
            *state = TokenState::Unverified;
            true
        });
    }

    /// Asks the broker whether the stored token still works.
    ///
    /// Returns `Valid` or `Expired`; a missing token is `Expired` without a
    /// network call. Connectivity problems surface as `TransientNetwork` and
    /// leave the state untouched.
    pub async fn check_validity(&self) -> Result<TokenState, TokenError> {
        let Some(session) = self.store.session() else {
            debug!("No stored access token");
            self.set_state(TokenState::Expired);
            return Ok(TokenState::Expired);
        };

        match bounded(
            "session validation",
            self.config.call_timeout,
            self.broker.profile(&session),
        )
        .await
        {
            Ok(profile) => {
                debug!(user_id = %profile.user_id, "Stored access token is valid");
                self.set_state(TokenState::Valid);
                Ok(TokenState::Valid)
            }
            Err(TokenError::AuthRejected(reason)) => {
                info!(%reason, "Stored access token is no longer accepted");
                self.set_state(TokenState::Expired);
                Ok(TokenState::Expired)
            }
            Err(error) => Err(error),
        }
    }

    /// Makes sure a valid token is held, acquiring one if needed.
    pub async fn acquire(&self) -> Result<Session, TokenError> {
        let observed = self.epoch.load(Ordering::Acquire);
        let mut record = self.acquisition.lock().await;

        if let Some(outcome) = shared_outcome(&record, observed) {
            return outcome;
        }

        self.run_attempt(&mut record, true).await
    }

    /// Called after the broker rejected `stale`. Reuses a token another task
    /// obtained in the meantime, otherwise re-acquires through reuse or
    /// automated login.
    pub async fn recover(&self, stale: &Session) -> Result<Session, TokenError> {
        let observed = self.epoch.load(Ordering::Acquire);
        let mut record = self.acquisition.lock().await;

        if let Some(outcome) = shared_outcome(&record, observed) {
            return outcome;
        }

        match (self.state(), &record.last) {
            (TokenState::Valid, _) => {
                if let Some(current) = self.store.session() {
                    if current.access_token != stale.access_token {
                        return Ok(current);
                    }
                }
            }
            // A failed acquisition stands until the next batch acquires.
            (TokenState::Failed, Some(Err(error))) => return Err(error.clone()),
            _ => {}
        }

        warn!("Access token rejected mid-batch, re-acquiring");
        self.set_state(TokenState::Expired);
        self.run_attempt(&mut record, false).await
    }

    /// The session placements should use. Waits for any acquisition in
    /// flight, so placements pause while a new token is obtained.
    pub async fn current_session(&self) -> Option<Session> {
        let _guard = self.acquisition.lock().await;
        self.store.session()
    }

    async fn run_attempt(&self, record: &mut AcquisitionRecord, allow_manual: bool) -> Outcome {
        let outcome = self.try_strategies(allow_manual).await;

        if let Err(error) = &outcome {
            let acquiring = self.state() == TokenState::Acquiring;
            if acquiring || !matches!(error, TokenError::TransientNetwork(_)) {
                self.set_state(TokenState::Failed);
            }
            error!(%error, "Token acquisition failed");
            self.notifications.emit(Event::TokenAcquisitionFailed {
                reason: error.to_string(),
            });
        }

        record.epoch += 1;
        record.last = Some(outcome.clone());
        self.epoch.store(record.epoch, Ordering::Release);

        outcome
    }

    async fn strategies(&self, allow_manual: bool) -> Vec<AcquireStrategy> {
        let mut strategies = vec![AcquireStrategy::Reuse];

        if allow_manual {
            if let Some(request_token) = self.pending_request_token.lock().await.clone() {
                strategies.push(AcquireStrategy::ManualExchange { request_token });
            }
        }

        if self.auto_login.is_some() {
            strategies.push(AcquireStrategy::AutomatedLogin);
        }

        strategies
    }

    async fn try_strategies(&self, allow_manual: bool) -> Outcome {
        for strategy in self.strategies(allow_manual).await {
            match strategy {
                AcquireStrategy::Reuse => {
                    if let Some(session) = self.reuse().await? {
                        return Ok(session);
                    }
                }
                AcquireStrategy::ManualExchange { request_token } => {
                    self.pending_request_token.lock().await.take();
                    info!("Exchanging manually supplied request token");
                    self.set_state(TokenState::Acquiring);
                    return self.exchange(&request_token).await;
                }
                AcquireStrategy::AutomatedLogin => {
                    self.set_state(TokenState::Acquiring);
                    return self.automated_login().await;
                }
            }
        }

        Err(TokenError::NoStrategy)
    }

    async fn reuse(&self) -> Result<Option<Session>, TokenError> {
        if self.state() == TokenState::Valid {
            return Ok(self.store.session());
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.validity_backoff)
            .with_max_times(self.config.validity_attempts.saturating_sub(1));

        let state = (|| self.check_validity())
            .retry(backoff)
            .when(|error| matches!(error, TokenError::TransientNetwork(_)))
            .notify(|error, delay| {
                warn!(%error, ?delay, "Session validation failed, retrying");
            })
            .await?;

        Ok(match state {
            TokenState::Valid => self.store.session(),
            _ => None,
        })
    }

    async fn exchange(&self, request_token: &str) -> Outcome {
        let credentials = self.store.api_credentials();
        let grant = bounded(
            "request token exchange",
            self.config.call_timeout,
            self.broker.generate_session(&credentials, request_token),
        )
        .await?;

        self.store.replace_token(IssuedToken::new(
            grant.access_token.clone(),
            Utc::now(),
        ));
        self.set_state(TokenState::Valid);
        info!(user_id = %grant.user_id, "New access token acquired");
        self.notifications.emit(Event::TokenAcquired {
            user_id: grant.user_id,
        });

        Ok(Session {
            api_key: credentials.api_key,
            access_token: grant.access_token,
        })
    }

    async fn automated_login(&self) -> Outcome {
        let Some(auto_login) = &self.auto_login else {
            return Err(TokenError::NoStrategy);
        };

        let login_url = self.broker.login_url(&self.store.api_credentials().api_key);
        info!(user_id = %auto_login.credentials.user_id, "Running automated login");

        let request_token = tokio::time::timeout(
            self.config.login_timeout,
            auto_login
                .automator
                .login(&login_url, &auto_login.credentials),
        )
        .await
        .map_err(|_| {
            TokenError::LoginAutomationFailed(format!(
                "login did not finish within {:?}",
                self.config.login_timeout
            ))
        })?
        .map_err(|error| TokenError::LoginAutomationFailed(error.to_string()))?;

        self.exchange(&request_token).await
    }
}

async fn bounded<T, F>(action: &str, limit: Duration, call: F) -> Result<T, TokenError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| TokenError::TransientNetwork(format!("{action} timed out after {limit:?}")))?
        .map_err(TokenError::from)
}

/// The outcome of an attempt that finished after `observed` was read, if any.
fn shared_outcome(record: &AcquisitionRecord, observed: u64) -> Option<Outcome> {
    if record.epoch == observed {
        return None;
    }
    record.last.clone()
}
