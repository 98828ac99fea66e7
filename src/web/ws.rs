//! Change-stream WebSocket endpoint at `/{db}/{coll}/_streams/{uri}`

use super::{json_reply, raw_query};
use crate::changestream::{
    parse_stream_path, ChangeStreamError, MpscSessionChannel, ResolvedStream, SessionMessage,
};
use crate::gateway::Gateway;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use warp::path::FullPath;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

/// Messages queued per session before the worker's send awaits.
const SESSION_QUEUE: usize = 64;

fn stream_path() -> impl Filter<Extract = (String, String), Error = Rejection> + Clone {
    warp::get()
        .and(warp::path::full())
        .and_then(|path: FullPath| async move {
            match parse_stream_path(path.as_str()) {
                Some(_) => Ok(path.as_str().to_string()),
                None => Err(warp::reject::not_found()),
            }
        })
        .and(raw_query())
}

/// Upgrade requests for a stream path. Unknown streams and bad variables
/// are answered before the upgrade.
pub fn upgrade(gateway: Arc<Gateway>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    stream_path()
        .and(warp::ws())
        .map(move |path: String, query: String, ws: Ws| {
            let query = (!query.is_empty()).then_some(query);
            match gateway.catalog().resolve(&path, query.as_deref()) {
                Ok(resolved) => {
                    let gateway = gateway.clone();
                    ws.on_upgrade(move |socket| session(socket, gateway, resolved))
                        .into_response()
                }
                Err(e) => {
                    debug!(path = %path, error = %e, "Refused change stream");
                    json_reply(e.status(), &e.to_string()).into_response()
                }
            }
        })
}

/// Plain GETs on a known stream path. Paths the catalog does not know fall
/// through to the pipeline.
pub fn not_websocket(gateway: Arc<Gateway>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    stream_path().and_then(move |path: String, _query: String| {
        let known = parse_stream_path(&path)
            .and_then(|p| gateway.catalog().find(&p.db, &p.coll, &p.stream))
            .is_some();
        async move {
            if known {
                let e = ChangeStreamError::NotWebSocket;
                Ok(json_reply(e.status(), &e.to_string()))
            } else {
                Err(warp::reject::not_found())
            }
        }
    })
}

async fn session(socket: WebSocket, gateway: Arc<Gateway>, stream: ResolvedStream) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (channel, mut messages) = MpscSessionChannel::new(SESSION_QUEUE);

    let handle = gateway.workers().attach(
        &stream.key,
        &stream.stages,
        &stream.db,
        &stream.coll,
        Arc::new(channel),
    );
    info!(session = %handle.id(), key = %stream.key, "Change stream session opened");

    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(SessionMessage::Text(text)) => {
                    if let Err(e) = ws_tx.send(Message::text(text)).await {
                        debug!(session = %handle.id(), error = %e, "WebSocket send failed");
                        break;
                    }
                }
                // The worker closed the session
                None => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session = %handle.id(), error = %e, "WebSocket receive failed");
                    break;
                }
                None => break,
            },
        }
    }

    handle.close();
    let _ = ws_tx.close().await;
    info!(session = %handle.id(), "Change stream session closed");
}
