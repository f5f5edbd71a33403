//! Error types and macros.

use std::fmt;

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use backtrace::Backtrace;
use thiserror::Error;

use crate::store::StoreError;

/// Common `Result` type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Top-level error type.
#[derive(Debug)]
pub struct ApiError {
    kind: ApiErrorKind,
    pub(crate) backtrace: Box<Backtrace>,
    status: StatusCode,
}

/// Top-level ErrorKind.
#[derive(Error, Debug)]
pub enum ApiErrorKind {
    #[error("{}", _0)]
    Store(StoreError),

    #[error("invalid mock configuration: {}", _0)]
    Config(String),

    #[error("step execution failed: {}", _0)]
    Step(String),

    #[error("response file error: {}", _0)]
    ResponseFile(String),

    #[error("path {} escapes the configuration directory", _0)]
    PathTraversal(String),

    #[error("{}", _0)]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &ApiErrorKind {
        &self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn step(msg: &str) -> Self {
        ApiErrorKind::Step(msg.to_owned()).into()
    }
}

impl From<ApiErrorKind> for ApiError {
    fn from(kind: ApiErrorKind) -> Self {
        let status = match &kind {
            ApiErrorKind::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
            status,
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        // Mock clients get a terse diagnostic; the details go to the log.
        warn!("request failed: {}", self.kind);
        HttpResponse::build(self.status)
            .content_type("text/plain")
            .body(format!("{}", self.kind))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(inner: std::io::Error) -> Self {
        ApiErrorKind::Internal(inner.to_string()).into()
    }
}

impl From<cadence::MetricError> for ApiError {
    fn from(inner: cadence::MetricError) -> Self {
        ApiErrorKind::Internal(inner.to_string()).into()
    }
}

#[macro_export]
macro_rules! from_error {
    ($from:ty, $to:ty, $to_kind:expr) => {
        impl From<$from> for $to {
            fn from(inner: $from) -> $to {
                $to_kind(inner).into()
            }
        }
    };
}

#[macro_export]
macro_rules! impl_fmt_display {
    ($error:ty, $kind:ty) => {
        impl fmt::Display for $error {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.kind, formatter)
            }
        }
    };
}

impl_fmt_display!(ApiError, ApiErrorKind);

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

from_error!(StoreError, ApiError, ApiErrorKind::Store);
