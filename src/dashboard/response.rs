//! JSON response envelope and error mapping.

use crate::error::{CoreError, ErrorCode};
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// `{success, data?, error?, code?, field?, message?}`
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            field: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// 200 with data.
pub fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope::ok(data)).into_response()
}

/// 200 with data and a human-readable message.
pub fn ok_with<T: Serialize>(data: T, message: impl Into<String>) -> Response {
    Json(Envelope::ok(data).with_message(message)).into_response()
}

/// 201 with data and a message.
pub fn created<T: Serialize>(data: T, message: impl Into<String>) -> Response {
    (
        StatusCode::CREATED,
        Json(Envelope::ok(data).with_message(message)),
    )
        .into_response()
}

/// HTTP status for a core error.
pub fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Validation { .. }
        | CoreError::InvalidState(_)
        | CoreError::AgentUnavailable { .. }
        | CoreError::AlreadyIdle(_)
        | CoreError::SessionAlreadyTerminal { .. } => StatusCode::BAD_REQUEST,
        CoreError::NoAgentAvailable | CoreError::GatewayUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CoreError::Io(_) | CoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler error; renders as the failure envelope.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(CoreError::validation("body", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body: Envelope<()> = Envelope {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
            code: Some(self.0.code()),
            field: self.0.field().map(str::to_string),
            message: None,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult = Result<Response, ApiError>;
