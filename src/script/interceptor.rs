use super::schema::{ScriptCall, ScriptOp, WireRequest, WireResponse};
use super::ScriptModule;
use crate::exchange::{Request, Response};
use crate::interceptor::{Interceptor, InterceptorError};
use async_trait::async_trait;
use std::sync::Arc;

/// Interceptor backed by a script module's `resolve` and `handle` exports.
///
/// The response body is only shipped to the script when the plugin declares
/// `requiresContent`.
pub struct ScriptInterceptor {
    module: Arc<dyn ScriptModule>,
}

impl ScriptInterceptor {
    pub fn new(module: Arc<dyn ScriptModule>) -> Self {
        Self { module }
    }

    fn call(&self, op: ScriptOp, request: &Request, response: &Response) -> ScriptCall {
        let with_content = self.module.options().requires_content;
        ScriptCall::new(
            op,
            WireRequest::from_request(request, true),
            WireResponse::from_response(response, with_content),
        )
    }
}

#[async_trait]
impl Interceptor for ScriptInterceptor {
    async fn resolve(&self, request: &Request, response: &Response) -> Result<bool, InterceptorError> {
        let reply = self
            .module
            .invoke(self.call(ScriptOp::Resolve, request, response))
            .await?;
        Ok(reply.result.unwrap_or(false))
    }

    async fn handle(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), InterceptorError> {
        let reply = self
            .module
            .invoke(self.call(ScriptOp::Handle, request, response))
            .await?;

        if let Some(wire) = reply.request {
            wire.apply_to(request);
        }
        if let Some(wire) = reply.response {
            wire.apply_to(response)?;
        }
        Ok(())
    }
}
