//! Request routing: which service or proxy a path belongs to

use crate::config::ProxyMount;
use crate::exchange::AttachmentKey;
use crate::plugin::PluginRegistry;
use std::sync::Arc;

pub const PIPELINE_INFO: AttachmentKey<PipelineInfo> = AttachmentKey::new("pipeline-info");

/// Where the request goes after the request-side interceptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineInfo {
    Service {
        name: String,
        uri: String,
    },
    Proxy {
        name: String,
        prefix: String,
        upstream: String,
    },
    Unrouted,
}

impl PipelineInfo {
    /// Mount prefix the request matched, if any.
    pub fn prefix(&self) -> Option<&str> {
        match self {
            Self::Service { uri, .. } => Some(uri),
            Self::Proxy { prefix, .. } => Some(prefix),
            Self::Unrouted => None,
        }
    }
}

pub trait Router: Send + Sync {
    fn route(&self, path: &str) -> PipelineInfo;
}

/// Longest-prefix router over the registered services and configured proxies.
pub struct PrefixRouter {
    registry: Arc<PluginRegistry>,
    proxies: Vec<ProxyMount>,
}

impl PrefixRouter {
    pub fn new(registry: Arc<PluginRegistry>, proxies: Vec<ProxyMount>) -> Self {
        Self { registry, proxies }
    }
}

impl Router for PrefixRouter {
    fn route(&self, path: &str) -> PipelineInfo {
        let mut best: Option<(usize, PipelineInfo)> = None;
        let mut consider = |prefix: &str, info: PipelineInfo| {
            if matches_prefix(path, prefix) && best.as_ref().map_or(true, |(len, _)| prefix.len() > *len) {
                best = Some((prefix.len(), info));
            }
        };

        for service in self.registry.services() {
            consider(
                &service.descriptor.uri,
                PipelineInfo::Service {
                    name: service.name.clone(),
                    uri: service.descriptor.uri.clone(),
                },
            );
        }

        for proxy in &self.proxies {
            consider(
                &proxy.uri,
                PipelineInfo::Proxy {
                    name: proxy.name.clone(),
                    prefix: proxy.uri.clone(),
                    upstream: proxy.upstream.clone(),
                },
            );
        }

        best.map(|(_, info)| info).unwrap_or(PipelineInfo::Unrouted)
    }
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// `path` relative to `prefix`, always starting with `/`.
pub fn strip_mount(path: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rest = path.strip_prefix(prefix).unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}
