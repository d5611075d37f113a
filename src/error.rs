use crate::admission::AdmissionError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("配置错误: GEMINI_API_KEYS 为空，至少需要一个上游 key")]
    PoolExhausted,

    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("上游请求失败: {0}")]
    Upstream(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Admission(e) => match e {
                AdmissionError::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
                AdmissionError::TimedOut(_) | AdmissionError::Closed => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            },
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::PoolExhausted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "unauthorized",
            AppError::BadRequest(_) => "bad_request",
            AppError::Admission(_) => "admission",
            AppError::Upstream(_) => "upstream",
            AppError::Config(_) | AppError::PoolExhausted => "config",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: Some(self.kind().to_string()),
            },
        };

        (status, Json(body)).into_response()
    }
}
