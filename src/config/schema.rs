use crate::changestream::ChangeStreamDefinition;
use crate::interceptor::InterceptPoint;
use crate::plugin::config::PluginConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub plugins: PluginConfig,
    /// Built-in services keyed by service name
    #[serde(default)]
    pub services: HashMap<String, ServiceMount>,
    #[serde(default)]
    pub proxies: Vec<ProxyMount>,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub async_interceptors: AsyncInterceptorsConfig,
    #[serde(default)]
    pub change_streams: ChangeStreamsConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferConfig {
    /// Size of each pooled buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum request or response content held in memory
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMount {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Mount point; defaults to `/<service name>`
    #[serde(default)]
    pub uri: Option<String>,
    /// Intercept points at which only required interceptors run
    #[serde(default)]
    pub dont_intercept: Vec<InterceptPoint>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMount {
    pub name: String,
    /// Path prefix, e.g. `/api`
    pub uri: String,
    /// Upstream base URL, e.g. `http://localhost:8080/`
    pub upstream: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingConfig {
    #[serde(default = "default_trace_header")]
    pub trace_header: String,
    /// Request headers copied into the diagnostic context and echoed back
    #[serde(default)]
    pub echo_headers: Vec<String>,
    #[serde(default)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncInterceptorsConfig {
    #[serde(default = "default_async_concurrency")]
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStreamsConfig {
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
    #[serde(default)]
    pub streams: Vec<ChangeStreamDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_allow_origin")]
    pub allow_origin: String,
    #[serde(default = "default_allow_methods")]
    pub allow_methods: String,
    #[serde(default = "default_allow_headers")]
    pub allow_headers: String,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_max_content_size() -> usize {
    16 * 1024 * 1024
}

fn default_enabled() -> bool {
    true
}

fn default_trace_header() -> String {
    "x-request-id".to_string()
}

fn default_async_concurrency() -> usize {
    num_cpus::get() * 16
}

fn default_reconnect_backoff() -> u64 {
    1000
}

fn default_allow_origin() -> String {
    "*".to_string()
}

fn default_allow_methods() -> String {
    "GET, PUT, POST, PATCH, DELETE, OPTIONS".to_string()
}

fn default_allow_headers() -> String {
    "Accept, Authorization, Content-Type, Origin, X-Requested-With".to_string()
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_content_size: default_max_content_size(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            trace_header: default_trace_header(),
            echo_headers: Vec::new(),
            json_logs: false,
        }
    }
}

impl Default for AsyncInterceptorsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_async_concurrency(),
        }
    }
}

impl Default for ChangeStreamsConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: default_reconnect_backoff(),
            streams: Vec::new(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            allow_origin: default_allow_origin(),
            allow_methods: default_allow_methods(),
            allow_headers: default_allow_headers(),
        }
    }
}

impl ServiceMount {
    pub fn uri_for(&self, service_name: &str) -> String {
        self.uri
            .clone()
            .unwrap_or_else(|| format!("/{service_name}"))
    }
}

impl BufferConfig {
    /// Number of pooled buffers needed to hold `max_content_size` bytes.
    pub fn max_buffers(&self) -> usize {
        1 + self.max_content_size / self.buffer_size
    }
}

impl Config {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.change_streams.reconnect_backoff_ms)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listener.host, self.listener.port)
    }
}
