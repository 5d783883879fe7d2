//! Error types for the proxy.

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use obsctl_context::ContextError;
use serde::Serialize;

/// Proxy-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("serving proxy: {0}")]
    Serve(#[source] std::io::Error),

    #[error("path {0:?} contains a dot segment")]
    InvalidPath(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
            code: &'static str,
        }

        let (status, code) = match &self {
            ProxyError::Context(ContextError::Request(_)) => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR")
            }
            ProxyError::Context(ContextError::TokenFetch(_)) => {
                (StatusCode::BAD_GATEWAY, "TOKEN_ERROR")
            }
            ProxyError::InvalidPath(_) => (StatusCode::BAD_REQUEST, "INVALID_PATH"),
            ProxyError::Context(_) | ProxyError::Bind { .. } | ProxyError::Serve(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PROXY_ERROR")
            }
            ProxyError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorBody {
            error: self.to_string(),
            code,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
