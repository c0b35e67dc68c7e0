use std::{
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use axum::{
    body::{
        Body,
        to_bytes,
    },
    http::{
        HeaderName,
        HeaderValue,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use uuid::Uuid;

use crate::{
    audit::{
        AuditLogger,
        store::{AuditStore, AuditStoreError, RedisAuditStore},
    },
    config::GatewayConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    identity::IdentityResolver,
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        audit::AuditMiddleware,
        cors::CorsMiddleware,
        identity::IdentityMiddleware,
        rate_limit::RateLimitMiddleware,
    },
    ratelimit::{
        RateLimiter,
        in_memory::InMemoryRateLimitBackend,
    },
    router::RouteTable,
    upstream::Dispatcher,
};

const STORE_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Runs every request through audit → cors → identity → rate limit → dispatch
/// and back out through the response hooks.
pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    routes: Arc<RouteTable>,
    dispatcher: Dispatcher,
    limiter: Option<RateLimiter>,
    max_body_bytes: usize,
}

impl Gateway {
    pub async fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        let store = match &config.audit.redis_url {
            Some(url) => connect_audit_store(url, config.audit.redis_key.clone()).await,
            None => None,
        };

        let audit = AuditLogger::from_config(&config.audit, store)?;
        Self::new(config, audit)
    }

    pub fn new(config: GatewayConfig, audit: AuditLogger) -> GatewayResult<Self> {
        let routes = Arc::new(RouteTable::from_config(&config.routes, &config.upstreams)?);

        let mut middlewares: Vec<Arc<dyn GatewayMiddleware>> =
            vec![Arc::new(AuditMiddleware::new(Arc::new(audit)))];
        if config.cors.enabled {
            middlewares.push(Arc::new(CorsMiddleware::new(config.cors.clone(), routes.clone())));
        }
        middlewares.push(Arc::new(IdentityMiddleware::new(IdentityResolver::new(
            &config.identity,
        ))));

        let limiter = config.rate_limit.enabled.then(|| {
            let backend = Arc::new(InMemoryRateLimitBackend::new(config.rate_limit.algorithm));
            RateLimiter::from_config(&config.rate_limit, backend)
        });
        if let Some(limiter) = &limiter {
            middlewares.push(Arc::new(RateLimitMiddleware::new(limiter.clone())));
        }

        let dispatcher = Dispatcher::new(routes.clone())?;

        Ok(Self {
            middlewares,
            routes,
            dispatcher,
            limiter,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            client_ip,
        );
        ctx.service = self.routes.service_name(ctx.uri.path());

        let mut executed = Vec::new();
        let mut response = match self.process(&mut ctx, body, &mut executed).await {
            Ok(response) => response,
            Err(err) => {
                ctx.outcome = err.outcome();
                tracing::warn!(
                    request_id = %ctx.request_id,
                    method = %ctx.method,
                    path = %ctx.uri.path(),
                    service = %ctx.service,
                    error_code = err.code(),
                    error = %err,
                    "request not forwarded"
                );
                err.into_response()
            }
        };

        self.apply_response_middlewares(&executed, &ctx, &mut response)
            .await;
        self.attach_hardening_headers(&ctx.request_id, &mut response);
        response
    }

    async fn process(
        &self,
        ctx: &mut RequestContext,
        body: Body,
        executed: &mut Vec<usize>,
    ) -> GatewayResult<Response<Body>> {
        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(response)) => return Ok(response),
                Err(err) => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err,
                        "middleware rejected request"
                    );
                    return Err(err);
                }
            }
        }

        // Buffered only once the request has been admitted.
        ctx.body = to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|_| GatewayError::PayloadTooLarge)?;

        self.dispatcher.dispatch(ctx).await
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err,
                    "middleware post-response hook failed"
                );
            }
        }
    }

    fn attach_hardening_headers(&self, request_id: &str, response: &mut Response<Body>) {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-request-id"), value);
        }

        response.headers_mut().insert(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        );
        response.headers_mut().insert(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        );
        response.headers_mut().insert(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        );
    }
}

async fn connect_audit_store(url: &str, key: String) -> Option<Arc<dyn AuditStore>> {
    let connected = tokio::time::timeout(STORE_CONNECT_TIMEOUT, RedisAuditStore::connect(url, key))
        .await
        .unwrap_or_else(|_| Err(AuditStoreError::Unavailable("connection timed out".into())));

    match connected {
        Ok(store) => {
            tracing::info!(store = store.name(), "audit store connected");
            Some(Arc::new(store))
        }
        Err(err) => {
            tracing::warn!(error = %err, "audit store unavailable; continuing with local audit log only");
            None
        }
    }
}
