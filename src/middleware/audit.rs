use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;

use crate::{
    audit::{AuditLogger, AuditRecord},
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
};

/// First stage in, last stage out: sees every request, whatever the outcome,
/// and emits exactly one audit record for it.
pub struct AuditMiddleware {
    logger: Arc<AuditLogger>,
}

impl AuditMiddleware {
    pub fn new(logger: Arc<AuditLogger>) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl GatewayMiddleware for AuditMiddleware {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_ip = ?ctx.client_ip,
            "incoming request"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut axum::response::Response,
    ) -> GatewayResult<()> {
        let duration_ms = u64::try_from(ctx.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.logger.record(AuditRecord {
            timestamp: Local::now(),
            method: ctx.method.to_string(),
            path: ctx.uri.path().to_string(),
            service: ctx.service.clone(),
            identity: ctx.identity_or_anonymous().to_string(),
            status: response.status().as_u16(),
            duration_ms,
            outcome: ctx.outcome,
        });
        Ok(())
    }
}
