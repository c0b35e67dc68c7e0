use axum::{
    Json,
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::audit::AuditOutcome;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("no route matched the request")]
    RouteNotFound,
    #[error("method not allowed")]
    MethodNotAllowed { allowed: Vec<Method> },
    #[error("request body exceeds configured limit")]
    PayloadTooLarge,
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("upstream timed out")]
    UpstreamTimeout,
    #[error("upstream returned a malformed body")]
    InvalidUpstreamResponse,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::RouteNotFound => "route_not_found",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::PayloadTooLarge => "payload_too_large",
            Self::UpstreamUnreachable(_) => "upstream_unreachable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::InvalidUpstreamResponse => "invalid_upstream_response",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Client-facing message. Upstream and internal detail stays in the logs.
    pub fn message(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "Rate limit exceeded",
            Self::RouteNotFound => "No route matched the request",
            Self::MethodNotAllowed { .. } => "Method not allowed for this route",
            Self::PayloadTooLarge => "Request body exceeds configured limit",
            Self::UpstreamUnreachable(_) => "Upstream service is unreachable",
            Self::UpstreamTimeout => "Upstream service timed out",
            Self::InvalidUpstreamResponse => "Upstream service returned an invalid response",
            Self::Internal(_) => "Internal gateway error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidUpstreamResponse => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn outcome(&self) -> AuditOutcome {
        match self {
            Self::RateLimited { .. } => AuditOutcome::RateLimited,
            Self::RouteNotFound => AuditOutcome::RouteNotFound,
            Self::MethodNotAllowed { .. } => AuditOutcome::MethodNotAllowed,
            Self::PayloadTooLarge => AuditOutcome::PayloadTooLarge,
            Self::UpstreamUnreachable(_)
            | Self::UpstreamTimeout
            | Self::InvalidUpstreamResponse => AuditOutcome::UpstreamError,
            Self::Internal(_) => AuditOutcome::InternalError,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let retry_after_secs = match &self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        let mut response = (
            self.status(),
            Json(ErrorBody {
                error: self.code(),
                message: self.message(),
                retry_after_secs,
            }),
        )
            .into_response();

        if let Some(secs) = retry_after_secs
            && let Ok(v) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        if let Self::MethodNotAllowed { allowed } = &self {
            let allow = allowed
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(v) = HeaderValue::from_str(&allow) {
                response.headers_mut().insert(header::ALLOW, v);
            }
        }

        response
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout
        } else {
            Self::UpstreamUnreachable(err.to_string())
        }
    }
}
