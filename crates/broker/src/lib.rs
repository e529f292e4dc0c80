use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt::{Debug, Display};
use std::sync::Arc;

pub mod dry_run;
pub mod error;
pub mod kite;
pub mod login;
pub mod order;

pub use dry_run::DryRunBroker;
pub use error::{BrokerError, ErrorClass};
pub use kite::{KiteBroker, KiteEnv};
pub use login::{LoginAutomator, LoginCredentials, LoginError};
pub use order::{
    Exchange, InvalidSymbolError, OrderPlacement, OrderRequest, OrderType, ProductType, Symbol,
    TransactionType,
};

/// Type alias for a dynamic broker trait object wrapped in Arc
pub type DynBroker = Arc<dyn Broker>;

/// App-level credentials used to sign the request-token exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// An authenticated session, i.e. what every trading call needs.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub api_key: String,
    pub access_token: String,
}

impl Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("api_key", &self.api_key)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Result of exchanging a one-time request token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub user_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedBroker {
    Kite,
    DryRun,
}

impl Display for SupportedBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kite => write!(f, "kite"),
            Self::DryRun => write!(f, "dry_run"),
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync + Debug + 'static {
    /// URL a human (or the login automator) visits to obtain a request token.
    fn login_url(&self, api_key: &str) -> String;

    /// Fetches the account profile; doubles as the session validity check.
    async fn profile(&self, session: &Session) -> Result<UserProfile, BrokerError>;

    /// Exchanges a one-time request token for an access token.
    async fn generate_session(
        &self,
        credentials: &ApiCredentials,
        request_token: &str,
    ) -> Result<SessionGrant, BrokerError>;

    async fn place_order(
        &self,
        session: &Session,
        order: &OrderRequest,
    ) -> Result<OrderPlacement, BrokerError>;

    /// Last traded price, used as the reference when a market order must be
    /// converted into a limit order.
    async fn last_price(&self, session: &Session, symbol: &Symbol)
    -> Result<Decimal, BrokerError>;

    /// Margin the broker would block for this order.
    async fn required_margin(
        &self,
        session: &Session,
        order: &OrderRequest,
    ) -> Result<Decimal, BrokerError>;

    /// Cash available in the equity segment.
    async fn available_cash(&self, session: &Session) -> Result<Decimal, BrokerError>;

    fn to_supported_broker(&self) -> SupportedBroker;
}
