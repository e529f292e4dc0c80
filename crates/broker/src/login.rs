use async_trait::async_trait;
use std::fmt::Debug;

/// Account credentials for the interactive web login.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginCredentials {
    pub user_id: String,
    pub password: String,
    /// Second factor: the account PIN or a current TOTP code
    pub pin: String,
}

impl Debug for LoginCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("user_id", &self.user_id)
            .field("password", &"<redacted>")
            .field("pin", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("Login rejected: {0}")]
    Rejected(String),
    #[error("Login flow ended at {url} without a request token")]
    MissingRequestToken { url: String },
    #[error("Too many redirects while following {url}")]
    TooManyRedirects { url: String },
    #[error("Login request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("URL parsing failed: {0}")]
    Url(#[from] url::ParseError),
    #[error("Unexpected login response from {endpoint}: {body}")]
    UnexpectedResponse { endpoint: String, body: String },
}

/// Drives the broker's interactive login and returns the one-time request
/// token it redirects to.
#[async_trait]
pub trait LoginAutomator: Send + Sync + Debug {
    async fn login(
        &self,
        login_url: &str,
        credentials: &LoginCredentials,
    ) -> Result<String, LoginError>;
}
