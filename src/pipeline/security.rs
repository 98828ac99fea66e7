use super::cors::add_cors_headers;
use super::sender::send_response;
use super::{Next, Stage};
use crate::config::CorsConfig;
use crate::error::PipelineError;
use crate::exchange::{Account, Exchange, Request};
use async_trait::async_trait;
use http::{header, HeaderValue, StatusCode};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(Account),
    /// No credentials were presented
    Anonymous,
    /// Credentials were presented and rejected
    Failed(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &Request) -> AuthOutcome;
}

/// Lets every request through without an account.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousAuthenticator;

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _request: &Request) -> AuthOutcome {
        AuthOutcome::Anonymous
    }
}

/// Authenticates the request; a rejected one is answered with 401.
pub struct Security {
    authenticator: Arc<dyn Authenticator>,
    cors: CorsConfig,
}

impl Security {
    pub fn new(authenticator: Arc<dyn Authenticator>, cors: CorsConfig) -> Self {
        Self {
            authenticator,
            cors,
        }
    }
}

#[async_trait]
impl Stage for Security {
    fn name(&self) -> &'static str {
        "security"
    }

    async fn handle(&self, exchange: &Arc<Exchange>, next: Next<'_>) -> Result<(), PipelineError> {
        let outcome = {
            let request = exchange.request().await;
            self.authenticator.authenticate(&request).await
        };

        match outcome {
            AuthOutcome::Authenticated(account) => {
                debug!(account = %account.name, "Authenticated");
                exchange.request_mut().await.set_account(Some(account));
                next.run(exchange).await
            }
            AuthOutcome::Anonymous => next.run(exchange).await,
            AuthOutcome::Failed(reason) => {
                info!(reason = %reason, "Authentication failed");
                exchange.set_in_error();
                let preflight = exchange.request().await.is_options();
                {
                    let mut response = exchange.response_mut().await;
                    response.set_in_error(StatusCode::UNAUTHORIZED, reason);
                    response.headers_mut().insert(
                        header::WWW_AUTHENTICATE,
                        HeaderValue::from_static("Basic realm=\"restpipe\""),
                    );
                    add_cors_headers(response.headers_mut(), &self.cors, preflight);
                }
                send_response(exchange).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::MemoryDownstream;
    use crate::pipeline::Pipeline;
    use crate::test_utils::harness;
    use http::Method;
    use parking_lot::Mutex;

    struct Reached(Arc<Mutex<bool>>);

    #[async_trait]
    impl Stage for Reached {
        fn name(&self) -> &'static str {
            "reached"
        }

        async fn handle(&self, _exchange: &Arc<Exchange>, _next: Next<'_>) -> Result<(), PipelineError> {
            *self.0.lock() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_authenticated_account_is_attached() {
        let mut authenticator = MockAuthenticator::new();
        authenticator.expect_authenticate().times(1).returning(|_| {
            AuthOutcome::Authenticated(Account {
                name: "admin".to_string(),
                roles: vec!["admin".to_string()],
            })
        });

        let harness = harness();
        let reached = Arc::new(Mutex::new(false));
        let exchange = harness.exchange(
            Request::new(Method::GET, "/".parse().unwrap()),
            MemoryDownstream::new(),
        );

        Pipeline::builder()
            .stage(Security::new(Arc::new(authenticator), CorsConfig::default()))
            .stage(Reached(reached.clone()))
            .build()
            .execute(exchange.clone())
            .await;

        assert!(*reached.lock());
        assert_eq!(exchange.request().await.account().unwrap().name, "admin");
    }

    #[tokio::test]
    async fn test_failed_authentication_answers_401() {
        let mut authenticator = MockAuthenticator::new();
        authenticator
            .expect_authenticate()
            .returning(|_| AuthOutcome::Failed("bad password".to_string()));

        let harness = harness();
        let reached = Arc::new(Mutex::new(false));
        let downstream = MemoryDownstream::new();
        let exchange = harness.exchange(
            Request::new(Method::GET, "/".parse().unwrap()),
            downstream.clone(),
        );

        Pipeline::builder()
            .stage(Security::new(Arc::new(authenticator), CorsConfig::default()))
            .stage(Reached(reached.clone()))
            .build()
            .execute(exchange.clone())
            .await;

        assert!(!*reached.lock());
        let recorded = downstream.recorded();
        assert_eq!(recorded.status, Some(StatusCode::UNAUTHORIZED));
        assert!(recorded.headers.contains_key(header::WWW_AUTHENTICATE));
        assert!(exchange.is_in_error());
    }
}
