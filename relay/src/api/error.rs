// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::intake::IntakeError;
use crate::submitter::RetryError;

#[derive(Debug, Error, Clone)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    InvalidTransaction(String),
    #[error("{0}")]
    Duplicate(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    InternalError(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    ok: bool,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidTransaction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Duplicate(_) | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::InvalidTransaction(_) => "INVALID_TRANSACTION",
            Self::Duplicate(_) => "DUPLICATE_TRANSACTION",
            Self::Conflict(_) => "CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<IntakeError> for ApiError {
    fn from(value: IntakeError) -> Self {
        match value {
            IntakeError::Duplicate { .. } => Self::Duplicate(value.to_string()),
            IntakeError::Invalid(reason) => Self::InvalidTransaction(reason.to_string()),
            IntakeError::Storage { source } => {
                Self::InternalError(format!("cannot persist transaction: {source}"))
            }
        }
    }
}

impl From<RetryError> for ApiError {
    fn from(value: RetryError) -> Self {
        match value {
            RetryError::NotFound { .. } => Self::NotFound(value.to_string()),
            RetryError::NotFailed { .. }
            | RetryError::Busy { .. }
            | RetryError::NotRetryable { .. } => Self::Conflict(value.to_string()),
            RetryError::SubmitterClosed => Self::Unavailable(value.to_string()),
            RetryError::Storage { .. } => Self::InternalError(value.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            ok: false,
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
