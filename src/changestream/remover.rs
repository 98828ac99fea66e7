use super::catalog::StreamCatalog;
use super::registry::ChangeStreamWorkers;
use super::ChangeStreamDefinition;
use crate::exchange::{Request, Response};
use crate::interceptor::{Interceptor, InterceptorError};
use async_trait::async_trait;
use http::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Closes the change streams of a database or collection whose stream
/// definitions can no longer be trusted, and brings the catalog in line.
///
/// Applies after a successful `DELETE` of a database or collection, which
/// drops its definitions, and after a `PUT` or `PATCH` of a collection
/// whose body carries `streams`, which replaces them.
pub struct ObsoleteChangeStreamRemover {
    workers: Arc<ChangeStreamWorkers>,
    catalog: Arc<StreamCatalog>,
}

impl ObsoleteChangeStreamRemover {
    pub fn new(workers: Arc<ChangeStreamWorkers>, catalog: Arc<StreamCatalog>) -> Self {
        Self { workers, catalog }
    }
}

/// One entry of a collection's `streams` array.
#[derive(Debug, Deserialize)]
struct StreamEntry {
    uri: String,
    #[serde(default)]
    stages: Vec<Value>,
}

/// Definitions carried by a collection body. Malformed entries are skipped.
fn stream_definitions(db: &str, coll: &str, streams: &Value) -> Vec<ChangeStreamDefinition> {
    let Some(entries) = streams.as_array() else {
        warn!(db = %db, coll = %coll, "Ignoring streams that are not an array");
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match StreamEntry::deserialize(entry) {
            Ok(entry) => Some(ChangeStreamDefinition {
                db: db.to_string(),
                coll: coll.to_string(),
                uri: entry.uri,
                stages: entry.stages,
            }),
            Err(e) => {
                warn!(db = %db, coll = %coll, error = %e, "Ignoring invalid stream definition");
                None
            }
        })
        .collect()
}

fn target(request: &Request) -> Option<(String, Option<String>)> {
    let segments: Vec<&str> = request
        .resource_path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    match segments.as_slice() {
        [db] => Some((db.to_string(), None)),
        [db, coll] => Some((db.to_string(), Some(coll.to_string()))),
        _ => None,
    }
}

fn defines_streams(request: &Request) -> bool {
    matches!(request.json(), Ok(Some(body)) if body.get("streams").is_some())
}

#[async_trait]
impl Interceptor for ObsoleteChangeStreamRemover {
    async fn resolve(&self, request: &Request, response: &Response) -> Result<bool, InterceptorError> {
        if response.is_in_error() || !response.status_or_ok().is_success() {
            return Ok(false);
        }

        let applies = match (request.method(), target(request)) {
            (&Method::DELETE, Some(_)) => true,
            (&Method::PUT | &Method::PATCH, Some((_, Some(_)))) => defines_streams(request),
            _ => false,
        };
        Ok(applies)
    }

    async fn handle(&self, request: &mut Request, _response: &mut Response) -> Result<(), InterceptorError> {
        let Some((db, coll)) = target(request) else {
            return Ok(());
        };

        match (request.method(), coll.as_deref()) {
            (&Method::DELETE, coll) => {
                let dropped = self.catalog.remove_matching(&db, coll);
                debug!(db = %db, coll = ?coll, dropped, "Dropped stream definitions");
            }
            (_, Some(coll)) => {
                let body = request.json().ok().flatten();
                if let Some(streams) = body.as_ref().and_then(|b| b.get("streams")) {
                    let definitions = stream_definitions(&db, coll, streams);
                    info!(db = %db, coll = %coll, streams = definitions.len(), "Updated stream definitions");
                    self.catalog.replace_collection(&db, coll, definitions);
                }
            }
            _ => {}
        }

        let closed = self.workers.close_matching(&db, coll.as_deref());
        debug!(db = %db, coll = ?coll, closed, "Closed obsolete change streams");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::changestream::{ChangeStreamWorkerKey, JsonMode, MemoryChangeSource};
    use crate::metrics::Metrics;
    use http::StatusCode;
    use serde_json::json;
    use std::time::Duration;

    fn remover() -> (ObsoleteChangeStreamRemover, Arc<ChangeStreamWorkers>) {
        let (remover, workers, _catalog) = remover_with_catalog(Vec::new());
        (remover, workers)
    }

    fn remover_with_catalog(
        streams: Vec<ChangeStreamDefinition>,
    ) -> (ObsoleteChangeStreamRemover, Arc<ChangeStreamWorkers>, Arc<StreamCatalog>) {
        let workers = ChangeStreamWorkers::new(
            Arc::new(MemoryChangeSource::default()),
            Duration::from_millis(10),
            Arc::new(Metrics::new()),
        );
        let catalog = Arc::new(StreamCatalog::new(streams));
        (
            ObsoleteChangeStreamRemover::new(workers.clone(), catalog.clone()),
            workers,
            catalog,
        )
    }

    fn definition(db: &str, coll: &str, uri: &str) -> ChangeStreamDefinition {
        ChangeStreamDefinition {
            db: db.into(),
            coll: coll.into(),
            uri: uri.into(),
            stages: vec![],
        }
    }

    fn response(status: StatusCode) -> Response {
        let mut response = Response::new(BufferPool::new(16, 1024));
        response.set_status(status);
        response
    }

    #[tokio::test]
    async fn test_applies_to_successful_deletes_and_stream_updates() {
        let (remover, _) = remover();

        let delete = Request::new(Method::DELETE, "/shop/orders".parse().unwrap());
        assert!(remover.resolve(&delete, &response(StatusCode::NO_CONTENT)).await.unwrap());
        assert!(!remover.resolve(&delete, &response(StatusCode::NOT_FOUND)).await.unwrap());

        let put = Request::new(Method::PUT, "/shop/orders".parse().unwrap())
            .with_body(json!({"streams": []}).to_string());
        assert!(remover.resolve(&put, &response(StatusCode::OK)).await.unwrap());

        let put_plain = Request::new(Method::PUT, "/shop/orders".parse().unwrap())
            .with_body(json!({"descr": "orders"}).to_string());
        assert!(!remover.resolve(&put_plain, &response(StatusCode::OK)).await.unwrap());

        let doc = Request::new(Method::DELETE, "/shop/orders/42".parse().unwrap());
        assert!(!remover.resolve(&doc, &response(StatusCode::NO_CONTENT)).await.unwrap());
    }

    #[tokio::test]
    async fn test_handle_interrupts_collection_workers() {
        let (remover, workers) = remover();
        let key = ChangeStreamWorkerKey::new("/shop/orders/_streams/all", json!({}), JsonMode::Relaxed);
        let worker = workers.get_or_create(&key, &[], "shop", "orders");

        let mut request = Request::new(Method::DELETE, "/shop".parse().unwrap());
        let mut response = response(StatusCode::NO_CONTENT);
        remover.handle(&mut request, &mut response).await.unwrap();

        for _ in 0..100 {
            if workers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(workers.is_empty());
        assert!(worker.is_terminated());
    }

    #[tokio::test]
    async fn test_put_replaces_collection_streams() {
        let (remover, _workers, catalog) = remover_with_catalog(vec![
            definition("shop", "orders", "old"),
            definition("shop", "invoices", "all"),
        ]);

        let mut request = Request::new(Method::PUT, "/shop/orders".parse().unwrap()).with_body(
            json!({"streams": [
                {"uri": "paid", "stages": [{"$match": {"fullDocument.status": "paid"}}]},
                {"stages": []}
            ]})
            .to_string(),
        );
        let mut response = response(StatusCode::OK);
        remover.handle(&mut request, &mut response).await.unwrap();

        assert!(catalog.find("shop", "orders", "old").is_none());
        let paid = catalog.find("shop", "orders", "paid").unwrap();
        assert_eq!(paid.stages, vec![json!({"$match": {"fullDocument.status": "paid"}})]);
        assert!(catalog.find("shop", "invoices", "all").is_some());
        assert_eq!(catalog.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_drops_database_streams() {
        let (remover, _workers, catalog) = remover_with_catalog(vec![
            definition("shop", "orders", "all"),
            definition("shop", "invoices", "all"),
            definition("crm", "leads", "all"),
        ]);

        let mut request = Request::new(Method::DELETE, "/shop".parse().unwrap());
        let mut response = response(StatusCode::NO_CONTENT);
        remover.handle(&mut request, &mut response).await.unwrap();

        assert_eq!(catalog.len(), 1);
        assert!(catalog.find("crm", "leads", "all").is_some());
    }
}
