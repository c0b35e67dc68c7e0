pub mod audit;
pub mod cors;
pub mod identity;
pub mod rate_limit;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
};

pub enum ControlFlow {
    Continue,
    /// Answer the client directly; later stages and dispatch are skipped.
    ShortCircuit(Response<Body>),
}

/// One stage of the request pipeline. `on_request` hooks run in order until one
/// fails or answers; `on_response` hooks run in reverse for every stage that
/// let the request continue.
#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow>;

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}
