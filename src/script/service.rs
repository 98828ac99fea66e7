use super::schema::{ScriptCall, ScriptOp, WireRequest, WireResponse};
use super::ScriptModule;
use crate::exchange::{Request, Response};
use crate::service::{Service, ServiceError};
use async_trait::async_trait;
use std::sync::Arc;

/// Service backed by a script module's `handle` export.
pub struct ScriptService {
    module: Arc<dyn ScriptModule>,
}

impl ScriptService {
    pub fn new(module: Arc<dyn ScriptModule>) -> Self {
        Self { module }
    }
}

#[async_trait]
impl Service for ScriptService {
    async fn handle(&self, request: &Request, response: &mut Response) -> Result<(), ServiceError> {
        let call = ScriptCall::new(
            ScriptOp::Handle,
            WireRequest::from_request(request, true),
            WireResponse::from_response(response, false),
        );

        let reply = self.module.invoke(call).await?;
        if let Some(wire) = reply.response {
            wire.apply_to(response)?;
        }
        Ok(())
    }
}
