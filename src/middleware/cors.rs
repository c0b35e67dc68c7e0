use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::Response,
};

use crate::{
    audit::AuditOutcome,
    config::CorsConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
    router::RouteTable,
};

const EXPOSED_HEADERS: &str = "x-request-id, x-ratelimit-remaining, retry-after";

/// Answers preflights for routed paths and stamps CORS headers on every
/// response, gateway errors included. Sits behind the audit stage so
/// preflights are recorded like any other request.
pub struct CorsMiddleware {
    config: CorsConfig,
    routes: Arc<RouteTable>,
}

impl CorsMiddleware {
    pub fn new(config: CorsConfig, routes: Arc<RouteTable>) -> Self {
        Self { config, routes }
    }

    fn allowed_origin(&self, request_headers: &HeaderMap) -> Option<HeaderValue> {
        if self.config.allows_any_origin() {
            return Some(HeaderValue::from_static("*"));
        }

        let origin = request_headers.get(header::ORIGIN)?;
        let value = origin.to_str().ok()?;
        self.config
            .allow_origins
            .iter()
            .any(|o| o == value)
            .then(|| origin.clone())
    }

    fn apply(&self, request_headers: &HeaderMap, response: &mut Response<Body>) {
        let Some(origin) = self.allowed_origin(request_headers) else {
            return;
        };

        let headers = response.headers_mut();
        if !self.config.allows_any_origin() {
            headers.append(header::VARY, HeaderValue::from_static("origin"));
        }
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(EXPOSED_HEADERS),
        );
    }
}

fn is_preflight(ctx: &RequestContext) -> bool {
    ctx.method == Method::OPTIONS
        && ctx
            .headers
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

#[async_trait]
impl GatewayMiddleware for CorsMiddleware {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if !is_preflight(ctx) || self.allowed_origin(&ctx.headers).is_none() {
            return Ok(ControlFlow::Continue);
        }

        // Unrouted paths fall through to the usual 404.
        let Some(route) = self.routes.resolve(ctx.uri.path()) else {
            return Ok(ControlFlow::Continue);
        };

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let methods = route
            .methods_for(ctx.uri.path())
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&methods) {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
        }
        if let Some(requested) = ctx.headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        self.apply(&ctx.headers, &mut response);

        ctx.outcome = AuditOutcome::Preflight;
        tracing::debug!(
            request_id = %ctx.request_id,
            path = %ctx.uri.path(),
            service = %route.service,
            "answered CORS preflight"
        );
        Ok(ControlFlow::ShortCircuit(response))
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        self.apply(&ctx.headers, response);
        Ok(())
    }
}
