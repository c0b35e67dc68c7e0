use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue},
    response::Response,
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::RateLimiter,
};

const REMAINING_KEY: &str = "ratelimit.remaining";

pub struct RateLimitMiddleware {
    limiter: RateLimiter,
}

impl RateLimitMiddleware {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let key = ctx.identity_or_anonymous().rate_limit_key();
        let decision = self.limiter.admit(&key, ctx.uri.path()).await?;

        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            });
        }

        ctx.metadata
            .insert(REMAINING_KEY.to_string(), decision.remaining.to_string());
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        if let Some(remaining) = ctx.metadata.get(REMAINING_KEY)
            && let Ok(value) = HeaderValue::from_str(remaining)
        {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-ratelimit-remaining"), value);
        }

        Ok(())
    }
}
