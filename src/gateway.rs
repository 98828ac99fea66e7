//! Wires the registries, the handler chain and the change-stream subsystem
//! together from a [`Config`].

use crate::buffer::BufferPool;
use crate::changestream::{
    ChangeStreamSource, ChangeStreamWorkers, MemoryChangeSource, ObsoleteChangeStreamRemover,
    StreamCatalog,
};
use crate::conduit::{ConduitInjector, Downstream};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::exchange::{ContentKind, Exchange, Request};
use crate::interceptor::{AsyncDispatcher, InterceptPoint, InterceptorExecutor};
use crate::metrics::Metrics;
use crate::pipeline::{
    AnonymousAuthenticator, Authenticator, Branch, ErrorReporter, InterceptorsStage, NotFound,
    Pipeline, RequestInitializer, ResponseInterceptors, ResponseSender, Security,
    ServiceDispatcher, TracingInstrumentation,
};
use crate::plugin::{
    spawn_hot_deploy, DeployReport, InterceptorRecord, PluginDeployer, PluginRegistry,
    PluginWatcher, ServiceRecord,
};
use crate::proxy::ProxyForwarder;
use crate::routing::PrefixRouter;
use crate::script::{NodeScriptEngine, ScriptEngine};
use crate::service::{MetricsService, PingService, Service};
use notify::RecommendedWatcher;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Gateway {
    config: Config,
    metrics: Arc<Metrics>,
    registry: Arc<PluginRegistry>,
    dispatcher: Arc<AsyncDispatcher>,
    executor: Arc<InterceptorExecutor>,
    pool: Arc<BufferPool>,
    pipeline: Pipeline,
    workers: Arc<ChangeStreamWorkers>,
    catalog: Arc<StreamCatalog>,
    deployer: Option<Arc<PluginDeployer>>,
}

/// Hot deploy resources; dropping the watcher stops it.
pub struct HotDeploy {
    pub watcher: RecommendedWatcher,
    pub task: JoinHandle<()>,
}

pub struct GatewayBuilder {
    config: Config,
    authenticator: Option<Arc<dyn Authenticator>>,
    change_source: Option<Arc<dyn ChangeStreamSource>>,
    script_engine: Option<Arc<dyn ScriptEngine>>,
    metrics: Option<Arc<Metrics>>,
}

impl GatewayBuilder {
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn change_source(mut self, source: Arc<dyn ChangeStreamSource>) -> Self {
        self.change_source = Some(source);
        self
    }

    pub fn script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.script_engine = Some(engine);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let config = self.config;
        crate::config::validate(&config)?;

        let metrics = self.metrics.unwrap_or_else(|| Arc::new(Metrics::new()));
        let registry = Arc::new(PluginRegistry::new());
        let dispatcher = Arc::new(AsyncDispatcher::new(config.async_interceptors.max_concurrent));
        let executor = Arc::new(InterceptorExecutor::new(
            registry.clone(),
            dispatcher.clone(),
            metrics.clone(),
        ));
        let pool = BufferPool::from_config(&config.buffers);

        let change_source = self
            .change_source
            .unwrap_or_else(|| Arc::new(MemoryChangeSource::default()));
        let workers = ChangeStreamWorkers::new(change_source, config.reconnect_backoff(), metrics.clone());
        let catalog = Arc::new(StreamCatalog::new(config.change_streams.streams.clone()));

        register_builtin_services(&config, &registry, &metrics);
        registry.register_interceptor(
            InterceptorRecord::interceptor(
                "obsoleteChangeStreamRemover",
                InterceptPoint::Response,
                Arc::new(ObsoleteChangeStreamRemover::new(workers.clone(), catalog.clone())),
            )
            .with_kind(ContentKind::ByteArray)
            .with_description("Updates stream definitions and closes the streams of dropped or redefined collections")
            .required(),
        );

        let deployer = match (&config.plugins.plugin_dir, self.script_engine) {
            (Some(_), engine) => {
                let engine = engine
                    .unwrap_or_else(|| Arc::new(NodeScriptEngine::new(config.plugins.clone())));
                Some(Arc::new(PluginDeployer::new(
                    registry.clone(),
                    engine,
                    config.plugins.clone(),
                )))
            }
            (None, _) => None,
        };

        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(AnonymousAuthenticator));
        let router = Arc::new(PrefixRouter::new(registry.clone(), config.proxies.clone()));
        let cors = config.cors.clone();

        let service_chain = Pipeline::builder()
            .stage(ServiceDispatcher::new(registry.clone()))
            .stage(ResponseInterceptors::new(executor.clone()))
            .stage(ResponseSender::new(executor.clone()))
            .into_chain();
        let proxy_chain = Pipeline::builder()
            .stage(ConduitInjector::new(registry.clone()))
            .stage(ProxyForwarder::new(executor.clone())?)
            .into_chain();
        let unrouted_chain = Pipeline::builder()
            .stage(NotFound::new(cors.clone()))
            .into_chain();

        let pipeline = Pipeline::builder()
            .stage(TracingInstrumentation::new(config.tracing.clone()))
            .stage(InterceptorsStage::new(
                executor.clone(),
                InterceptPoint::RequestBeforeExchangeInit,
                cors.clone(),
            ))
            .stage(RequestInitializer::new(router, config.buffers.max_content_size))
            .stage(InterceptorsStage::new(
                executor.clone(),
                InterceptPoint::RequestBeforeAuth,
                cors.clone(),
            ))
            .stage(Security::new(authenticator, cors.clone()))
            .stage(InterceptorsStage::new(
                executor.clone(),
                InterceptPoint::RequestAfterAuth,
                cors.clone(),
            ))
            .stage(Branch::new(service_chain, proxy_chain, unrouted_chain))
            .reporter(ErrorReporter::new(cors))
            .metrics(metrics.clone())
            .build();

        info!(stages = ?pipeline.stage_names(), "Handler chain assembled");

        Ok(Gateway {
            config,
            metrics,
            registry,
            dispatcher,
            executor,
            pool,
            pipeline,
            workers,
            catalog,
            deployer,
        })
    }
}

fn register_builtin_services(config: &Config, registry: &PluginRegistry, metrics: &Arc<Metrics>) {
    let builtins: [(&str, Arc<dyn Service>, ContentKind); 2] = [
        ("ping", Arc::new(PingService::default()), ContentKind::Json),
        (
            "metrics",
            Arc::new(MetricsService::new(metrics.clone())),
            ContentKind::String,
        ),
    ];

    for (name, instance, kind) in builtins {
        let mount = config.services.get(name);
        if mount.is_some_and(|m| !m.enabled) {
            info!(service = name, "Built-in service disabled by configuration");
            continue;
        }
        let uri = mount.map_or_else(|| format!("/{name}"), |m| m.uri_for(name));
        let dont_intercept = mount.map(|m| m.dont_intercept.clone()).unwrap_or_default();

        registry.register_service(
            ServiceRecord::service(name, uri, instance)
                .with_kind(kind)
                .dont_intercept(dont_intercept),
        );
    }

    for name in config.services.keys() {
        if !matches!(name.as_str(), "ping" | "metrics") {
            warn!(service = %name, "No built-in service with this name, mount ignored");
        }
    }
}

impl Gateway {
    pub fn builder(config: Config) -> GatewayBuilder {
        GatewayBuilder {
            config,
            authenticator: None,
            change_source: None,
            script_engine: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<InterceptorExecutor> {
        &self.executor
    }

    pub fn dispatcher(&self) -> &Arc<AsyncDispatcher> {
        &self.dispatcher
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn workers(&self) -> &Arc<ChangeStreamWorkers> {
        &self.workers
    }

    pub fn catalog(&self) -> &StreamCatalog {
        &self.catalog
    }

    pub fn exchange(&self, request: Request, downstream: Box<dyn Downstream>) -> Arc<Exchange> {
        Exchange::new(request, self.pool.clone(), downstream)
    }

    /// Run one request through the handler chain.
    pub async fn handle(&self, exchange: Arc<Exchange>) {
        self.pipeline.execute(exchange).await;
    }

    /// Deploy the script plugins in the plugin directory, if one is set.
    pub async fn deploy_plugins(&self) -> Result<DeployReport> {
        match &self.deployer {
            Some(deployer) => Ok(deployer.deploy_all().await?),
            None => Ok(DeployReport::default()),
        }
    }

    /// Start redeploying scripts on plugin directory changes, when enabled.
    pub fn start_hot_deploy(&self) -> Result<Option<HotDeploy>> {
        let (Some(deployer), Some(dir)) = (&self.deployer, &self.config.plugins.plugin_dir) else {
            return Ok(None);
        };
        if !self.config.plugins.hot_deploy {
            return Ok(None);
        }

        let (watcher, events) = PluginWatcher::new(dir);
        let watcher = watcher
            .run()
            .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?;
        let task = spawn_hot_deploy(deployer.clone(), events);
        Ok(Some(HotDeploy { watcher, task }))
    }

    pub async fn shutdown(&self) {
        info!("Shutting down gateway");
        self.workers.shutdown().await;
        self.dispatcher.shutdown().await;
        if let Some(deployer) = &self.deployer {
            deployer.shutdown().await;
        }
    }
}
