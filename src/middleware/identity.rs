use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    identity::IdentityResolver,
    middleware::{ControlFlow, GatewayMiddleware},
};

/// Attributes the request to a principal or to the caller address. Never
/// rejects; access control stays with the backends.
pub struct IdentityMiddleware {
    resolver: IdentityResolver,
}

impl IdentityMiddleware {
    pub fn new(resolver: IdentityResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl GatewayMiddleware for IdentityMiddleware {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let identity = self.resolver.resolve(&ctx.headers, ctx.client_ip);
        tracing::debug!(
            request_id = %ctx.request_id,
            identity = %identity,
            authenticated = identity.is_authenticated(),
            "identity resolved"
        );
        ctx.identity = Some(identity);
        Ok(ControlFlow::Continue)
    }
}
