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

    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("参数错误: {message}")]
    BadRequest { message: String, param: Option<String> },

    #[error("账号池暂无可用账号: {0}")]
    PoolExhausted(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("暂未实现: {message}")]
    NotImplemented { message: String, param: Option<String> },

    #[error("上游请求失败: {0}")]
    Upstream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            param: None,
        }
    }

    pub fn bad_request_param(message: impl Into<String>, param: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            param: Some(param.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            AppError::PoolExhausted(_) => (StatusCode::SERVICE_UNAVAILABLE, "pool_exhausted"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::NotImplemented { .. } => (StatusCode::NOT_IMPLEMENTED, "not_implemented"),
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            AppError::Anyhow(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    fn param(&self) -> Option<String> {
        match self {
            AppError::BadRequest { param, .. } | AppError::NotImplemented { param, .. } => {
                param.clone()
            }
            _ => None,
        }
    }

    /// OpenAI 方言错误体：`{"error":{"message","type","code","param"}}`。
    pub fn into_openai_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = OpenAIErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: "server_error".to_string(),
                code: code.to_string(),
                param: self.param(),
            },
        };
        (status, Json(body)).into_response()
    }

    /// Anthropic 方言错误体：`{"type":"error","error":{...}}`。
    pub fn into_claude_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = ClaudeErrorBody {
            r#type: "error".to_string(),
            error: ErrorDetail {
                message: self.to_string(),
                r#type: "api_error".to_string(),
                code: code.to_string(),
                param: self.param(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    r#type: String,
    code: String,
    param: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAIErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ClaudeErrorBody {
    r#type: String,
    error: ErrorDetail,
}

/// 默认按 OpenAI 方言渲染（admin 及非对话路由也使用该形状）。
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_openai_response()
    }
}
