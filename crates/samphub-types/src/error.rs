//! Shared error types for the SAMP hub.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for hub operations.
///
/// Every variant maps to a stable fault code ([`HubError::code`]) so that the
/// error survives a round trip over the wire binding.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum HubError {
    /// Bad or missing private key, or the hub refuses new registrations.
    #[error("Auth denied: {0}")]
    Auth(String),

    /// The recipient has no handler matching the MType.
    #[error("Not subscribed: {0}")]
    NotSubscribed(String),

    /// The recipient unregistered before replying.
    #[error("Recipient gone: {0}")]
    RecipientGone(String),

    /// A synchronous call exceeded its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Delivery failed at the channel level.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed message, pattern or correlation id.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The waiting caller was unregistered, or the hub shut down.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl HubError {
    /// Numeric fault code used on the wire.
    pub fn code(&self) -> i32 {
        match self {
            Self::Auth(_) => 401,
            Self::NotSubscribed(_) => 404,
            Self::Timeout(_) => 408,
            Self::RecipientGone(_) => 410,
            Self::Protocol(_) => 400,
            Self::Cancelled(_) => 499,
            Self::Transport(_) => 502,
        }
    }

    /// Rebuild an error from a wire fault code and message.
    ///
    /// Unknown codes become [`HubError::Protocol`].
    pub fn from_code(code: i32, message: String) -> Self {
        match code {
            401 => Self::Auth(message),
            404 => Self::NotSubscribed(message),
            408 => Self::Timeout(parse_timeout(&message)),
            410 => Self::RecipientGone(message),
            499 => Self::Cancelled(message),
            502 => Self::Transport(message),
            _ => Self::Protocol(message),
        }
    }

    /// Message text without the variant prefix, paired with [`HubError::code`].
    pub fn detail(&self) -> String {
        match self {
            Self::Auth(m)
            | Self::NotSubscribed(m)
            | Self::RecipientGone(m)
            | Self::Transport(m)
            | Self::Protocol(m)
            | Self::Cancelled(m) => m.clone(),
            Self::Timeout(d) => d.as_millis().to_string(),
        }
    }
}

fn parse_timeout(detail: &str) -> std::time::Duration {
    std::time::Duration::from_millis(detail.trim().parse().unwrap_or(0))
}

/// Alias for Result with HubError.
pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_code_roundtrip() {
        let errors = vec![
            HubError::Auth("bad key".into()),
            HubError::NotSubscribed("cli#2".into()),
            HubError::Timeout(Duration::from_millis(1500)),
            HubError::RecipientGone("cli#1".into()),
            HubError::Protocol("bad tag".into()),
            HubError::Cancelled("caller unregistered".into()),
            HubError::Transport("closed".into()),
        ];
        for err in errors {
            let rebuilt = HubError::from_code(err.code(), err.detail());
            assert_eq!(rebuilt, err);
        }
    }

    #[test]
    fn test_unknown_code_is_protocol() {
        let err = HubError::from_code(999, "weird".into());
        assert_eq!(err, HubError::Protocol("weird".into()));
    }

    #[test]
    fn test_display() {
        let err = HubError::Auth("unknown private key".into());
        assert_eq!(err.to_string(), "Auth denied: unknown private key");
    }
}
