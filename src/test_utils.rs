use async_trait::async_trait;
use esm_broker::{
    ApiCredentials, Broker, BrokerError, LoginAutomator, LoginCredentials, LoginError,
    OrderPlacement, OrderRequest, Session, SessionGrant, SupportedBroker, Symbol, UserProfile,
};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::compliance::OrderIntent;

/// In-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub fn test_api_credentials() -> ApiCredentials {
    ApiCredentials {
        api_key: "test_api_key".to_string(),
        api_secret: "test_api_secret".to_string(),
    }
}

pub fn test_login_credentials() -> LoginCredentials {
    LoginCredentials {
        user_id: "AB1234".to_string(),
        password: "password".to_string(),
        pin: "123456".to_string(),
    }
}

pub fn intent(
    symbol: &str,
    quantity: i64,
    order_type: esm_broker::OrderType,
    limit_price: Option<Decimal>,
    is_active: bool,
) -> OrderIntent {
    OrderIntent {
        symbol: symbol.to_string(),
        quantity,
        order_type,
        limit_price,
        is_active,
    }
}

/// Scripted placement result for one call.
#[derive(Debug, Clone)]
pub enum Reply {
    Transient,
    RateLimited,
    AuthRejected,
    Rejected(&'static str),
}

impl Reply {
    fn into_error(self) -> BrokerError {
        match self {
            Self::Transient => BrokerError::Transient {
                message: "connection reset".to_string(),
            },
            Self::RateLimited => BrokerError::RateLimited {
                message: "Too many requests".to_string(),
            },
            Self::AuthRejected => BrokerError::AuthRejected {
                message: "Incorrect `api_key` or `access_token`.".to_string(),
            },
            Self::Rejected(message) => BrokerError::Rejected {
                message: message.to_string(),
            },
        }
    }
}

/// Broker double that behaves like Kite for the calls the core makes.
///
/// Access tokens are accepted only while registered. Every accepted
/// request token exchange mints a fresh access token.
#[derive(Debug, Default)]
pub struct FakeBroker {
    pub profile_calls: AtomicUsize,
    pub session_calls: AtomicUsize,
    pub place_calls: AtomicUsize,
    pub ltp_calls: AtomicUsize,
    pub margin_calls: AtomicUsize,
    valid_access_tokens: Mutex<HashSet<String>>,
    request_tokens: Mutex<HashSet<String>>,
    profile_failures: AtomicUsize,
    issued: AtomicUsize,
    scripted: Mutex<HashMap<String, VecDeque<Reply>>>,
    ltp_scripted: Mutex<HashMap<String, VecDeque<Reply>>>,
    prices: Mutex<HashMap<String, Decimal>>,
    margins: Mutex<HashMap<String, Decimal>>,
    cash: Mutex<Option<Decimal>>,
    placed: Mutex<Vec<(String, OrderRequest)>>,
    place_delay: Mutex<Option<Duration>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_access_token(&self, token: &str) {
        self.valid_access_tokens
            .lock()
            .unwrap()
            .insert(token.to_string());
    }

    pub fn revoke_access_token(&self, token: &str) {
        self.valid_access_tokens.lock().unwrap().remove(token);
    }

    pub fn revoke_all_access_tokens(&self) {
        self.valid_access_tokens.lock().unwrap().clear();
    }

    pub fn accept_request_token(&self, token: &str) {
        self.request_tokens.lock().unwrap().insert(token.to_string());
    }

    pub fn fail_profile_transiently(&self, times: usize) {
        self.profile_failures.store(times, Ordering::SeqCst);
    }

    /// Queues replies for placements of `symbol`; once exhausted, placements
    /// succeed.
    pub fn script(&self, symbol: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .extend(replies);
    }

    /// Queues replies for price lookups of `symbol`, ahead of the set price.
    pub fn script_ltp(&self, symbol: &str, replies: impl IntoIterator<Item = Reply>) {
        self.ltp_scripted
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices
            .lock()
            .unwrap()
            .insert(symbol.to_string(), price);
    }

    pub fn set_required_margin(&self, symbol: &str, margin: Decimal) {
        self.margins
            .lock()
            .unwrap()
            .insert(symbol.to_string(), margin);
    }

    pub fn set_available_cash(&self, cash: Decimal) {
        *self.cash.lock().unwrap() = Some(cash);
    }

    pub fn set_place_delay(&self, delay: Duration) {
        *self.place_delay.lock().unwrap() = Some(delay);
    }

    /// Successful placements as (access token used, request).
    pub fn placed(&self) -> Vec<(String, OrderRequest)> {
        self.placed.lock().unwrap().clone()
    }

    fn check_session(&self, session: &Session) -> Result<(), BrokerError> {
        if self
            .valid_access_tokens
            .lock()
            .unwrap()
            .contains(&session.access_token)
        {
            Ok(())
        } else {
            Err(Reply::AuthRejected.into_error())
        }
    }
}

#[async_trait]
impl Broker for FakeBroker {
    fn login_url(&self, api_key: &str) -> String {
        format!("https://kite.test/connect/login?v=3&api_key={api_key}")
    }

    async fn profile(&self, session: &Session) -> Result<UserProfile, BrokerError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.profile_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.profile_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Reply::Transient.into_error());
        }

        self.check_session(session)?;
        Ok(UserProfile {
            user_id: "AB1234".to_string(),
            user_name: "Test User".to_string(),
        })
    }

    async fn generate_session(
        &self,
        _credentials: &ApiCredentials,
        request_token: &str,
    ) -> Result<SessionGrant, BrokerError> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);

        if !self.request_tokens.lock().unwrap().contains(request_token) {
            return Err(BrokerError::AuthRejected {
                message: "Token is invalid or has expired.".to_string(),
            });
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let access_token = format!("access_{n}");
        self.accept_access_token(&access_token);

        Ok(SessionGrant {
            user_id: "AB1234".to_string(),
            access_token,
        })
    }

    async fn place_order(
        &self,
        session: &Session,
        order: &OrderRequest,
    ) -> Result<OrderPlacement, BrokerError> {
        let call = self.place_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *self.place_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let symbol = order.symbol.to_string();
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&symbol)
            .and_then(VecDeque::pop_front);
        if let Some(reply) = scripted {
            return Err(reply.into_error());
        }

        self.check_session(session)?;

        self.placed
            .lock()
            .unwrap()
            .push((session.access_token.clone(), order.clone()));

        Ok(OrderPlacement {
            order_id: format!("ORDER_{call}"),
            symbol: order.symbol.clone(),
            placed_at: chrono::Utc::now(),
        })
    }

    async fn last_price(
        &self,
        session: &Session,
        symbol: &Symbol,
    ) -> Result<Decimal, BrokerError> {
        self.ltp_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self
            .ltp_scripted
            .lock()
            .unwrap()
            .get_mut(&symbol.to_string())
            .and_then(VecDeque::pop_front);
        if let Some(reply) = scripted {
            return Err(reply.into_error());
        }

        self.check_session(session)?;

        self.prices
            .lock()
            .unwrap()
            .get(&symbol.to_string())
            .copied()
            .ok_or_else(|| BrokerError::MissingField {
                action: "get ltp".to_string(),
                field: symbol.to_string(),
            })
    }

    async fn required_margin(
        &self,
        _session: &Session,
        order: &OrderRequest,
    ) -> Result<Decimal, BrokerError> {
        self.margin_calls.fetch_add(1, Ordering::SeqCst);
        self.margins
            .lock()
            .unwrap()
            .get(&order.symbol.to_string())
            .copied()
            .ok_or_else(|| Reply::Transient.into_error())
    }

    async fn available_cash(&self, _session: &Session) -> Result<Decimal, BrokerError> {
        (*self.cash.lock().unwrap()).ok_or_else(|| Reply::Transient.into_error())
    }

    fn to_supported_broker(&self) -> SupportedBroker {
        SupportedBroker::DryRun
    }
}

/// Login automator double with a call counter and optional delay.
#[derive(Debug)]
pub struct FakeLoginAutomator {
    pub calls: AtomicUsize,
    request_token: String,
    failure: Mutex<Option<LoginError>>,
    delay: Mutex<Duration>,
}

impl FakeLoginAutomator {
    pub fn succeeding(request_token: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            request_token: request_token.to_string(),
            failure: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn fail_with(&self, error: LoginError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl LoginAutomator for FakeLoginAutomator {
    async fn login(
        &self,
        _login_url: &str,
        _credentials: &LoginCredentials,
    ) -> Result<String, LoginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        match self.failure.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(self.request_token.clone()),
        }
    }
}
