use chrono::{DateTime, Utc};
use esm_broker::{ApiCredentials, Session};
use std::fmt::Debug;
use tokio::sync::watch;

/// An access token together with the instant it was issued. Kept as one
/// value so a stored token can never lack its issue time.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub access_token: String,
    pub issued_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn new(access_token: String, issued_at: DateTime<Utc>) -> Self {
        Self {
            access_token,
            issued_at,
        }
    }
}

impl Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("access_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub api_key: String,
    pub api_secret: String,
    pub token: Option<IssuedToken>,
}

impl Credential {
    pub fn new(api: ApiCredentials, token: Option<IssuedToken>) -> Self {
        Self {
            api_key: api.api_key,
            api_secret: api.api_secret,
            token,
        }
    }

    pub fn api_credentials(&self) -> ApiCredentials {
        ApiCredentials {
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
        }
    }

    pub fn session(&self) -> Option<Session> {
        self.token.as_ref().map(|token| Session {
            api_key: self.api_key.clone(),
            access_token: token.access_token.clone(),
        })
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("token", &self.token)
            .finish()
    }
}

/// Holds the process-wide credential.
///
/// Readers always see a whole credential: the token and its issue time are
/// swapped in a single step. Every replacement is published on a `watch`
/// channel so an adapter can persist it without the core knowing about
/// storage.
#[derive(Debug)]
pub struct CredentialStore {
    sender: watch::Sender<Credential>,
}

impl CredentialStore {
    pub fn new(credential: Credential) -> Self {
        let (sender, _) = watch::channel(credential);
        Self { sender }
    }

    pub fn snapshot(&self) -> Credential {
        self.sender.borrow().clone()
    }

    pub fn api_credentials(&self) -> ApiCredentials {
        self.sender.borrow().api_credentials()
    }

    pub fn session(&self) -> Option<Session> {
        self.sender.borrow().session()
    }

    pub fn replace_token(&self, token: IssuedToken) {
        self.sender.send_modify(|credential| {
            credential.token = Some(token);
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Credential> {
        self.sender.subscribe()
    }
}
