//! Upstream forwarding for proxied mounts
//!
//! The request is sent to the mount's upstream with its resource path
//! appended. The upstream body is streamed through the exchange's conduit
//! chosen by the [`ConduitInjector`](crate::conduit::ConduitInjector), so
//! response interceptors see it the same way they see service output.

use crate::conduit;
use crate::error::PipelineError;
use crate::exchange::Exchange;
use crate::interceptor::InterceptorExecutor;
use crate::pipeline::{Next, Stage};
use crate::routing::PipelineInfo;
use async_trait::async_trait;
use futures::StreamExt;
use http::{header, HeaderMap, HeaderName};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

const HOP_BY_HOP: [HeaderName; 5] = [
    header::HOST,
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub struct ProxyForwarder {
    client: reqwest::Client,
    executor: Arc<InterceptorExecutor>,
}

impl ProxyForwarder {
    pub fn new(executor: Arc<InterceptorExecutor>) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::Upstream(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, executor))
    }

    pub fn with_client(client: reqwest::Client, executor: Arc<InterceptorExecutor>) -> Self {
        Self { client, executor }
    }
}

/// Upstream URL for `resource_path` under `upstream`.
pub fn upstream_url(upstream: &str, resource_path: &str, query: Option<&str>) -> Result<Url, PipelineError> {
    let mut target = format!("{}{}", upstream.trim_end_matches('/'), resource_path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }
    Url::parse(&target).map_err(|e| PipelineError::Upstream(format!("invalid upstream URL {target}: {e}")))
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out
}

#[async_trait]
impl Stage for ProxyForwarder {
    fn name(&self) -> &'static str {
        "proxy-forwarder"
    }

    async fn handle(&self, exchange: &Arc<Exchange>, next: Next<'_>) -> Result<(), PipelineError> {
        let Some(info) = exchange.pipeline_info() else {
            return next.run(exchange).await;
        };
        let PipelineInfo::Proxy { name, upstream, .. } = info.as_ref() else {
            return next.run(exchange).await;
        };

        let builder = {
            let request = exchange.request().await;
            let url = upstream_url(upstream, request.resource_path(), request.query())?;
            debug!(proxy = %name, url = %url, method = %request.method(), "Forwarding request");

            self.client
                .request(request.method().clone(), url)
                .headers(forwardable(request.headers()))
                .body(request.body().clone())
        };

        let start = Instant::now();
        let upstream_response = builder.send().await.map_err(|e| {
            warn!(proxy = %name, error = %e, "Upstream request failed");
            PipelineError::Upstream(e.to_string())
        })?;

        let status = upstream_response.status();
        debug!(
            proxy = %name,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Upstream answered"
        );

        {
            let mut response = exchange.response_mut().await;
            response.set_status(status);
            for (name, value) in forwardable(upstream_response.headers()).iter() {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }

        let mut sink = conduit::for_exchange(exchange, &self.executor);
        let mut body = upstream_response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| PipelineError::Upstream(e.to_string()))?;
            sink.write(chunk).await?;
        }
        sink.terminate_writes().await?;

        next.run(exchange).await
    }
}
