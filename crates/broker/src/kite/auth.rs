use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{KiteBroker, kite_headers, parse_response};
use crate::{ApiCredentials, BrokerError, Session, SessionGrant, UserProfile};

#[derive(Debug, Deserialize)]
struct ProfileData {
    user_id: String,
    user_name: String,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    user_id: String,
    access_token: String,
}

pub(crate) fn login_url(web_base_url: &str, api_key: &str) -> String {
    format!("{web_base_url}/connect/login?v=3&api_key={api_key}")
}

/// SHA-256 over `api_key + request_token + api_secret`, hex encoded, as
/// required by `/session/token`.
pub(crate) fn checksum(credentials: &ApiCredentials, request_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credentials.api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(credentials.api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) async fn profile(
    broker: &KiteBroker,
    session: &Session,
) -> Result<UserProfile, BrokerError> {
    let response = broker
        .client()
        .get(broker.url("/user/profile"))
        .headers(kite_headers(Some(session))?)
        .send()
        .await?;

    let data: ProfileData = parse_response("get profile", response).await?;
    debug!(user_id = %data.user_id, "Session validated");

    Ok(UserProfile {
        user_id: data.user_id,
        user_name: data.user_name,
    })
}

pub(crate) async fn generate_session(
    broker: &KiteBroker,
    credentials: &ApiCredentials,
    request_token: &str,
) -> Result<SessionGrant, BrokerError> {
    let checksum = checksum(credentials, request_token);
    let form = [
        ("api_key", credentials.api_key.as_str()),
        ("request_token", request_token),
        ("checksum", checksum.as_str()),
    ];

    let response = broker
        .client()
        .post(broker.url("/session/token"))
        .headers(kite_headers(None)?)
        .form(&form)
        .send()
        .await?;

    let data: SessionData = parse_response("generate session", response).await?;

    Ok(SessionGrant {
        user_id: data.user_id,
        access_token: data.access_token,
    })
}

/// Pulls `request_token` out of the redirect URL Kite sends the user to after
/// a successful login.
pub fn extract_request_token_from_url(url: &str) -> Result<Option<String>, url::ParseError> {
    let parsed_url = url::Url::parse(url)?;

    Ok(parsed_url
        .query_pairs()
        .find(|(key, _)| key == "request_token")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty()))
}
