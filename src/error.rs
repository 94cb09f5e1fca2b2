use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::config::ConfigError;
use crate::net::session::SessionError;
use crate::scan::scanner::ScanError;

pub const DUPLICATED_BACKOFF: Duration = Duration::from_secs(5);
pub const RATE_LIMITED_BACKOFF: Duration = Duration::from_secs(60 * 60);

pub const CODE_DUPLICATED: &str = "duplicated";
pub const CODE_EXCEED_LIMIT_PACKET: &str = "exceed_limit_packet";
pub const CODE_NO_AUTH: &str = "no_auth";
pub const CODE_NEED_CAPTCHA: &str = "need_captcha";
pub const CODE_NOT_ONLINE: &str = "not_online";

/// Classification attached to every remote-call failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable(RetryableKind),
    Fatal(FatalKind),
    Unclassified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableKind {
    Duplicated,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalKind {
    NoAuth,
    CaptchaRequired,
    NotOnline,
    Other(String),
}

impl ErrorKind {
    /// Maps a service error code; codes outside the known set become `Fatal(Other)`.
    pub fn from_code(code: &str) -> Self {
        Self::from_known_code(code).unwrap_or_else(|| ErrorKind::Fatal(FatalKind::Other(code.to_string())))
    }

    pub fn from_known_code(code: &str) -> Option<Self> {
        let kind = match code.trim() {
            CODE_DUPLICATED => ErrorKind::Retryable(RetryableKind::Duplicated),
            CODE_EXCEED_LIMIT_PACKET => ErrorKind::Retryable(RetryableKind::RateLimited),
            CODE_NO_AUTH => ErrorKind::Fatal(FatalKind::NoAuth),
            CODE_NEED_CAPTCHA => ErrorKind::Fatal(FatalKind::CaptchaRequired),
            CODE_NOT_ONLINE => ErrorKind::Fatal(FatalKind::NotOnline),
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Fatal(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Retryable(_))
    }

    /// Delay before the failed work may be attempted again.
    pub fn backoff(&self) -> Option<Duration> {
        match self {
            ErrorKind::Retryable(RetryableKind::Duplicated) => Some(DUPLICATED_BACKOFF),
            ErrorKind::Retryable(RetryableKind::RateLimited) => Some(RATE_LIMITED_BACKOFF),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ErrorKind::Retryable(RetryableKind::Duplicated) => {
                "Retryable API error (duplicated): request duplicated by the server-side limiter".to_string()
            }
            ErrorKind::Retryable(RetryableKind::RateLimited) => {
                "Retryable API error (rate limited): too many requests, waiting 1 hour".to_string()
            }
            ErrorKind::Fatal(FatalKind::NoAuth) => {
                "Fatal API error (no auth): invalid or expired token".to_string()
            }
            ErrorKind::Fatal(FatalKind::CaptchaRequired) => {
                "Fatal API error (captcha required): bot detection triggered".to_string()
            }
            ErrorKind::Fatal(FatalKind::NotOnline) => {
                "Fatal API error (not online): account is not currently online or accessible"
                    .to_string()
            }
            ErrorKind::Fatal(FatalKind::Other(code)) if code.is_empty() => {
                "Fatal API error (other): unknown API error occurred".to_string()
            }
            ErrorKind::Fatal(FatalKind::Other(code)) => {
                format!("Fatal API error (other): service returned code {code}")
            }
            ErrorKind::Unclassified => "Unclassified error: unhandled fault".to_string(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Inspects a service response body. Returns `None` for successful responses.
///
/// Failed responses look like `{"result": false, "err": {"code": "no_auth"}}`;
/// numeric codes are treated as their decimal text.
pub fn classify_response(response: &Value) -> Option<ErrorKind> {
    if response.get("result").and_then(Value::as_bool) != Some(false) {
        return None;
    }
    let code = match response.get("err").and_then(|err| err.get("code")) {
        Some(Value::String(code)) => code.clone(),
        Some(Value::Number(code)) => code.to_string(),
        _ => String::new(),
    };
    Some(ErrorKind::from_code(&code))
}

pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Fatal(FatalKind::NoAuth),
        429 => ErrorKind::Retryable(RetryableKind::RateLimited),
        _ => ErrorKind::Unclassified,
    }
}

/// Failure surfaced out of a scheduled task's function.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Api(ErrorKind),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Api(kind) => kind.clone(),
            TaskError::Scan(err) => err.kind(),
            TaskError::Session(err) => err.kind(),
            TaskError::Config(err) => err.kind(),
            TaskError::Failed(_) => ErrorKind::Unclassified,
        }
    }
}

impl From<ErrorKind> for TaskError {
    fn from(kind: ErrorKind) -> Self {
        TaskError::Api(kind)
    }
}
