use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::auth::extract_request_token_from_url;
use crate::login::{LoginAutomator, LoginCredentials, LoginError};

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Deserialize)]
struct LoginEnvelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    request_id: String,
    #[serde(default)]
    twofa_type: Option<String>,
}

enum Followed {
    RequestToken(String),
    Landed(Url),
}

/// Browserless automation of the Kite web login.
///
/// Walks the same HTTP exchange the login page performs: open the connect
/// URL to obtain a session, post user id and password, post the second
/// factor, then follow the connect redirects until one carries
/// `request_token`. Redirects are followed by hand so the final hop to the
/// app's redirect URL is never requested.
#[derive(Debug, Clone)]
pub struct KiteWebLogin {
    web_base_url: String,
    client: reqwest::Client,
}

impl KiteWebLogin {
    pub fn new(web_base_url: &str, timeout: Duration) -> Result<Self, LoginError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .redirect(Policy::none())
            .timeout(timeout)
            .build()?;

        Ok(Self {
            web_base_url: web_base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn follow(&self, start: Url) -> Result<Followed, LoginError> {
        let mut current = start;

        for _ in 0..MAX_REDIRECTS {
            if let Some(token) = extract_request_token_from_url(current.as_str())? {
                return Ok(Followed::RequestToken(token));
            }

            let response = self.client.get(current.clone()).send().await?;
            if !response.status().is_redirection() {
                return Ok(Followed::Landed(current));
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| LoginError::UnexpectedResponse {
                    endpoint: current.to_string(),
                    body: "redirect without Location header".to_string(),
                })?;

            debug!(from = %current, to = %location, "Following login redirect");
            current = current.join(location)?;
        }

        Err(LoginError::TooManyRedirects {
            url: current.to_string(),
        })
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<Option<T>, LoginError> {
        let endpoint = format!("{}{path}", self.web_base_url);
        let response = self
            .client
            .post(&endpoint)
            .header("X-Kite-Version", "3")
            .form(form)
            .send()
            .await?;

        let body = response.text().await?;
        let envelope: LoginEnvelope<T> =
            serde_json::from_str(&body).map_err(|_| LoginError::UnexpectedResponse {
                endpoint: endpoint.clone(),
                body: body.clone(),
            })?;

        if envelope.status != "success" {
            return Err(LoginError::Rejected(
                envelope
                    .message
                    .unwrap_or_else(|| format!("{endpoint} returned status {}", envelope.status)),
            ));
        }

        Ok(envelope.data)
    }
}

#[async_trait]
impl LoginAutomator for KiteWebLogin {
    async fn login(
        &self,
        login_url: &str,
        credentials: &LoginCredentials,
    ) -> Result<String, LoginError> {
        info!(user_id = %credentials.user_id, "Starting automated Kite login");

        let landed = match self.follow(Url::parse(login_url)?).await? {
            Followed::RequestToken(token) => return Ok(token),
            Followed::Landed(url) => url,
        };

        let login: LoginData = self
            .post_form(
                "/api/login",
                &[
                    ("user_id", credentials.user_id.as_str()),
                    ("password", credentials.password.as_str()),
                ],
            )
            .await?
            .ok_or_else(|| LoginError::UnexpectedResponse {
                endpoint: "/api/login".to_string(),
                body: "missing data".to_string(),
            })?;

        let twofa_type = login.twofa_type.as_deref().unwrap_or("totp");
        self.post_form::<serde_json::Value>(
            "/api/twofa",
            &[
                ("user_id", credentials.user_id.as_str()),
                ("request_id", login.request_id.as_str()),
                ("twofa_value", credentials.pin.as_str()),
                ("twofa_type", twofa_type),
            ],
        )
        .await?;

        let mut finish = landed;
        finish.set_path("/connect/finish");

        match self.follow(finish).await? {
            Followed::RequestToken(token) => {
                info!(user_id = %credentials.user_id, "Automated login produced a request token");
                Ok(token)
            }
            Followed::Landed(url) => Err(LoginError::MissingRequestToken {
                url: url.to_string(),
            }),
        }
    }
}
