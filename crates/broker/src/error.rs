use reqwest::StatusCode;
use reqwest::header::InvalidHeaderValue;

/// How the core should react to a failed broker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The session token is no longer accepted; re-acquire before retrying.
    AuthInvalid,
    /// Connectivity, timeout or upstream outage; safe to retry with backoff.
    Transient,
    /// Broker throttled the request; retry with backoff.
    RateLimited,
    /// Business-rule rejection (funds, instrument, market closed); terminal.
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Session rejected by broker: {message}")]
    AuthRejected { message: String },

    #[error("Rate limited by broker: {message}")]
    RateLimited { message: String },

    #[error("Transient broker failure: {message}")]
    Transient { message: String },

    #[error("Rejected by broker: {message}")]
    Rejected { message: String },

    #[error("Failed to create header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("URL parsing failed: {0}")]
    Url(#[from] url::ParseError),

    #[error(
        "Failed to parse API response: {action}, response: {response_text}, error: {parse_error}"
    )]
    ApiResponseParse {
        action: String,
        response_text: String,
        parse_error: String,
    },

    #[error("Response for {action} is missing {field}")]
    MissingField { action: String, field: String },
}

impl BrokerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AuthRejected { .. } => ErrorClass::AuthInvalid,
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::Transient { .. } => ErrorClass::Transient,
            Self::Reqwest(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                ErrorClass::Transient
            }
            Self::Reqwest(e) => match e.status() {
                Some(StatusCode::FORBIDDEN) => ErrorClass::AuthInvalid,
                Some(StatusCode::TOO_MANY_REQUESTS) => ErrorClass::RateLimited,
                Some(status) if status.is_server_error() => ErrorClass::Transient,
                _ => ErrorClass::Rejected,
            },
            Self::Rejected { .. }
            | Self::InvalidHeader(_)
            | Self::Url(_)
            | Self::ApiResponseParse { .. }
            | Self::MissingField { .. } => ErrorClass::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::RateLimited
        )
    }

    pub fn is_auth_invalid(&self) -> bool {
        self.class() == ErrorClass::AuthInvalid
    }
}

/// Maps a Kite error envelope onto the error taxonomy.
///
/// Kite reports `TokenException` with HTTP 403 when the access token has
/// expired or was invalidated by a fresh login elsewhere.
pub(crate) fn classify(status: StatusCode, error_type: Option<&str>, message: String) -> BrokerError {
    match (status, error_type) {
        (StatusCode::FORBIDDEN, _) | (_, Some("TokenException")) => {
            BrokerError::AuthRejected { message }
        }
        (StatusCode::TOO_MANY_REQUESTS, _) => BrokerError::RateLimited { message },
        (_, Some("NetworkException" | "DataException")) => BrokerError::Transient { message },
        (status, _) if status.is_server_error() => BrokerError::Transient { message },
        _ => BrokerError::Rejected { message },
    }
}
