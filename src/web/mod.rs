//! warp transport adapter
//!
//! Every request that is not a change-stream upgrade becomes an
//! [`Exchange`](crate::exchange::Exchange) and runs through the gateway
//! pipeline. warp speaks `http` 0.2 while the pipeline uses `http` 1, so
//! method, headers and status are converted at this edge.

pub mod ws;

use crate::conduit::Downstream;
use crate::error::{ConfigError, GatewayError, Result};
use crate::exchange::Request;
use crate::gateway::Gateway;
use crate::pipeline::error_body;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use warp::http as http02;
use warp::hyper::Body;
use warp::path::FullPath;
use warp::{Filter, Rejection, Reply};

/// Body chunks buffered between the pipeline and hyper.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Serve the gateway until `shutdown` resolves.
pub async fn serve<F>(gateway: Arc<Gateway>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = gateway.config().listen_addr().parse().map_err(|e| {
        GatewayError::Config(ConfigError::Parse(format!("Invalid listen address: {e}")))
    })?;

    let (bound, server) = warp::serve(routes(gateway))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| GatewayError::Io(io::Error::new(io::ErrorKind::AddrInUse, e)))?;

    info!(addr = %bound, "Gateway listening");
    server.await;
    info!("Gateway stopped");
    Ok(())
}

pub fn routes(gateway: Arc<Gateway>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let pipeline = {
        let gateway = gateway.clone();
        warp::method()
            .and(warp::path::full())
            .and(raw_query())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(move |method, path, query, headers, body| {
                handle(gateway.clone(), method, path, query, headers, body)
            })
    };

    ws::upgrade(gateway.clone())
        .or(ws::not_websocket(gateway))
        .or(pipeline)
}

/// The raw query string, empty when absent.
pub(crate) fn raw_query() -> impl Filter<Extract = (String,), Error = std::convert::Infallible> + Clone {
    warp::query::raw()
        .or(warp::any().map(String::new))
        .unify()
}

async fn handle(
    gateway: Arc<Gateway>,
    method: http02::Method,
    path: FullPath,
    query: String,
    headers: http02::HeaderMap,
    body: Bytes,
) -> std::result::Result<http02::Response<Body>, Rejection> {
    let request = match to_request(&method, path.as_str(), &query, &headers, body) {
        Ok(request) => request,
        Err(message) => {
            debug!(path = %path.as_str(), error = %message, "Rejected unparseable request");
            return Ok(json_reply(http::StatusCode::BAD_REQUEST, &message));
        }
    };

    let (downstream, head_rx, body_rx) = ChannelDownstream::new();
    let exchange = gateway.exchange(request, Box::new(downstream));

    // The pipeline keeps writing the body after the head is handed to hyper
    tokio::spawn(async move { gateway.handle(exchange).await });

    match head_rx.await {
        Ok((status, headers)) => {
            let body = Body::wrap_stream(ReceiverStream::new(body_rx));
            Ok(to_response(status, &headers, body))
        }
        Err(_) => {
            warn!(path = %path.as_str(), "Pipeline finished without a response");
            Ok(json_reply(http::StatusCode::INTERNAL_SERVER_ERROR, "no response"))
        }
    }
}

fn to_request(
    method: &http02::Method,
    path: &str,
    query: &str,
    headers: &http02::HeaderMap,
    body: Bytes,
) -> std::result::Result<Request, String> {
    let method = http::Method::from_bytes(method.as_str().as_bytes()).map_err(|e| e.to_string())?;
    let uri: http::Uri = if query.is_empty() {
        path.parse()
    } else {
        format!("{path}?{query}").parse()
    }
    .map_err(|e: http::uri::InvalidUri| e.to_string())?;

    let mut converted = http::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = http::HeaderName::from_bytes(name.as_str().as_bytes()).map_err(|e| e.to_string())?;
        let value = http::HeaderValue::from_bytes(value.as_bytes()).map_err(|e| e.to_string())?;
        converted.append(name, value);
    }

    Ok(Request::new(method, uri).with_headers(converted).with_body(body))
}

fn to_response(status: http::StatusCode, headers: &http::HeaderMap, body: Body) -> http02::Response<Body> {
    let mut response = http02::Response::new(body);
    *response.status_mut() =
        http02::StatusCode::from_u16(status.as_u16()).unwrap_or(http02::StatusCode::INTERNAL_SERVER_ERROR);

    let target = response.headers_mut();
    for (name, value) in headers {
        match (
            http02::HeaderName::from_bytes(name.as_str().as_bytes()),
            http02::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            (Ok(name), Ok(value)) => {
                target.append(name, value);
            }
            _ => warn!(header = %name, "Dropping header that cannot be converted"),
        }
    }
    response
}

/// JSON error answered by the adapter itself.
pub(crate) fn json_reply(status: http::StatusCode, message: &str) -> http02::Response<Body> {
    let body = error_body(status, message).to_string();
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    to_response(status, &headers, Body::from(body))
}

type Head = (http::StatusCode, http::HeaderMap);

/// [`Downstream`] feeding a hyper response: the head goes over a oneshot,
/// body chunks over a bounded channel that hyper drains.
struct ChannelDownstream {
    head: Option<oneshot::Sender<Head>>,
    body: Option<mpsc::Sender<io::Result<Bytes>>>,
}

impl ChannelDownstream {
    fn new() -> (Self, oneshot::Receiver<Head>, mpsc::Receiver<io::Result<Bytes>>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (
            Self {
                head: Some(head_tx),
                body: Some(body_tx),
            },
            head_rx,
            body_rx,
        )
    }
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

#[async_trait]
impl Downstream for ChannelDownstream {
    async fn send_head(&mut self, status: http::StatusCode, headers: &http::HeaderMap) -> io::Result<()> {
        let head = self
            .head
            .take()
            .ok_or_else(|| io::Error::other("response head already sent"))?;
        head.send((status, headers.clone())).map_err(|_| client_gone())
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let body = self.body.as_ref().ok_or_else(client_gone)?;
        body.send(Ok(chunk)).await.map_err(|_| client_gone())
    }

    async fn end(&mut self) -> io::Result<()> {
        self.body.take();
        Ok(())
    }
}
