use async_trait::async_trait;
use clap::Parser;
use reqwest::header::{self, HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::classify;
use crate::{
    ApiCredentials, Broker, BrokerError, OrderPlacement, OrderRequest, Session, SessionGrant,
    SupportedBroker, Symbol, UserProfile,
};

pub mod auth;
pub mod login;
pub mod order;

pub use auth::extract_request_token_from_url;
pub use login::KiteWebLogin;

const KITE_VERSION: &str = "3";

#[derive(Parser, Debug, Clone)]
pub struct KiteEnv {
    #[clap(long, env)]
    pub api_key: String,
    #[clap(long, env)]
    pub api_secret: String,
    #[clap(long, env, default_value = "https://api.kite.trade")]
    pub api_base_url: String,
    /// Web host serving the login pages and the connect redirect flow
    #[clap(long, env, default_value = "https://kite.zerodha.com")]
    pub web_base_url: String,
    /// Upper bound for any single HTTP call to Kite, in seconds
    #[clap(long, env, default_value = "10")]
    pub request_timeout_secs: u64,
}

impl KiteEnv {
    pub fn api_credentials(&self) -> ApiCredentials {
        ApiCredentials {
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
        }
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Kite Connect v3 REST client.
#[derive(Debug, Clone)]
pub struct KiteBroker {
    api_base_url: String,
    web_base_url: String,
    client: reqwest::Client,
}

impl KiteBroker {
    pub fn new(env: &KiteEnv) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(env.request_timeout())
            .build()?;

        Ok(Self {
            api_base_url: env.api_base_url.trim_end_matches('/').to_string(),
            web_base_url: env.web_base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

/// Headers every Kite call carries; the authorization header is added only
/// for authenticated endpoints.
pub(crate) fn kite_headers(session: Option<&Session>) -> Result<HeaderMap, BrokerError> {
    let mut headers = HeaderMap::new();
    headers.insert("X-Kite-Version", HeaderValue::from_static(KITE_VERSION));

    if let Some(session) = session {
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!(
                "token {}:{}",
                session.api_key, session.access_token
            ))?,
        );
    }

    Ok(headers)
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
    error_type: Option<String>,
}

/// Unwraps Kite's `{status, data}` envelope, classifying any error payload.
pub(crate) async fn parse_response<T: DeserializeOwned>(
    action: &str,
    response: reqwest::Response,
) -> Result<T, BrokerError> {
    let status = response.status();
    let response_text = response.text().await?;

    debug!(action, %status, "Kite response received");

    if !status.is_success() {
        let (error_type, message) = serde_json::from_str::<Envelope<serde_json::Value>>(
            &response_text,
        )
        .map_or((None, response_text.clone()), |envelope| {
            (
                envelope.error_type,
                envelope.message.unwrap_or_else(|| response_text.clone()),
            )
        });

        return Err(classify(status, error_type.as_deref(), message));
    }

    let envelope: Envelope<T> = serde_json::from_str(&response_text).map_err(|parse_error| {
        error!(
            action,
            response_text = %response_text,
            parse_error = %parse_error,
            "Failed to parse Kite response"
        );
        BrokerError::ApiResponseParse {
            action: action.to_string(),
            response_text: response_text.clone(),
            parse_error: parse_error.to_string(),
        }
    })?;

    if envelope.status != "success" {
        return Err(classify(
            status,
            envelope.error_type.as_deref(),
            envelope.message.unwrap_or(response_text),
        ));
    }

    envelope.data.ok_or_else(|| BrokerError::MissingField {
        action: action.to_string(),
        field: "data".to_string(),
    })
}

#[async_trait]
impl Broker for KiteBroker {
    fn login_url(&self, api_key: &str) -> String {
        auth::login_url(&self.web_base_url, api_key)
    }

    async fn profile(&self, session: &Session) -> Result<UserProfile, BrokerError> {
        auth::profile(self, session).await
    }

    async fn generate_session(
        &self,
        credentials: &ApiCredentials,
        request_token: &str,
    ) -> Result<SessionGrant, BrokerError> {
        auth::generate_session(self, credentials, request_token).await
    }

    async fn place_order(
        &self,
        session: &Session,
        order: &OrderRequest,
    ) -> Result<OrderPlacement, BrokerError> {
        order::place_order(self, session, order).await
    }

    async fn last_price(
        &self,
        session: &Session,
        symbol: &Symbol,
    ) -> Result<Decimal, BrokerError> {
        order::last_price(self, session, symbol).await
    }

    async fn required_margin(
        &self,
        session: &Session,
        order: &OrderRequest,
    ) -> Result<Decimal, BrokerError> {
        order::required_margin(self, session, order).await
    }

    async fn available_cash(&self, session: &Session) -> Result<Decimal, BrokerError> {
        order::available_cash(self, session).await
    }

    fn to_supported_broker(&self) -> SupportedBroker {
        SupportedBroker::Kite
    }
}
