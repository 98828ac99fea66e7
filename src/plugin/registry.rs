//! Catalog of deployed interceptors and services
//!
//! Lookups happen on every intercept point of every request, registration
//! only at boot and on hot deploy. Interceptors live in an [`ArcSwap`]ed
//! vector kept in execution order, so a lookup is a lock-free load plus a
//! filter. Services are keyed by name in a [`DashMap`].

use super::record::{InterceptorRecord, PluginOrigin, ServiceRecord};
use crate::exchange::{ContentKind, Exchange};
use crate::interceptor::InterceptPoint;
use crate::routing::PipelineInfo;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct PluginRegistry {
    interceptors: ArcSwap<Vec<Arc<InterceptorRecord>>>,
    services: DashMap<String, Arc<ServiceRecord>>,
    seq: AtomicU64,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            interceptors: ArcSwap::from_pointee(Vec::new()),
            services: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Register an interceptor, replacing any previous one with the same name.
    pub fn register_interceptor(&self, mut record: InterceptorRecord) -> Arc<InterceptorRecord> {
        record.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(record);

        info!(
            interceptor = %record.name,
            point = %record.descriptor.point,
            priority = record.priority,
            required = record.required,
            "Registered interceptor"
        );

        self.interceptors.rcu(|current| {
            let mut next: Vec<_> = current
                .iter()
                .filter(|r| r.name != record.name)
                .cloned()
                .collect();
            next.push(record.clone());
            next.sort_by(|a, b| a.execution_order(b));
            next
        });

        record
    }

    pub fn unregister_interceptor(&self, name: &str) -> bool {
        let previous = self.interceptors.rcu(|current| {
            current
                .iter()
                .filter(|r| r.name != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|r| r.name == name)
    }

    pub fn register_service(&self, mut record: ServiceRecord) -> Arc<ServiceRecord> {
        record.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(record);

        info!(
            service = %record.name,
            uri = %record.descriptor.uri,
            "Registered service"
        );

        self.services.insert(record.name.clone(), record.clone());
        record
    }

    pub fn unregister_service(&self, name: &str) -> bool {
        self.services.remove(name).is_some()
    }

    /// Drop every plugin deployed from `origin`; returns how many went away.
    pub fn unregister_origin(&self, origin: &PluginOrigin) -> usize {
        let previous = self.interceptors.rcu(|current| {
            current
                .iter()
                .filter(|r| &r.origin != origin)
                .cloned()
                .collect::<Vec<_>>()
        });
        let interceptors = previous.iter().filter(|r| &r.origin == origin).count();

        let before = self.services.len();
        self.services.retain(|_, s| &s.origin != origin);

        interceptors + before.saturating_sub(self.services.len())
    }

    /// Enabled interceptors at `point`, in execution order.
    pub fn interceptors(&self, point: InterceptPoint) -> Vec<Arc<InterceptorRecord>> {
        self.select(point, |_| true)
    }

    /// Interceptors at `point` that apply to the named service's content kind.
    pub fn service_interceptors(
        &self,
        service: &str,
        point: InterceptPoint,
    ) -> Vec<Arc<InterceptorRecord>> {
        match self.services.get(service) {
            Some(record) => {
                let kind = record.descriptor.kind;
                self.select(point, |r| r.descriptor.kind == kind)
            }
            None => Vec::new(),
        }
    }

    /// Interceptors at `point` that apply to proxied requests.
    pub fn proxy_interceptors(&self, point: InterceptPoint) -> Vec<Arc<InterceptorRecord>> {
        self.select(point, |r| r.descriptor.kind == ContentKind::ByteArray)
    }

    /// Candidate interceptors for `exchange` at `point`.
    ///
    /// Before the exchange is initialized it has no route yet, so every
    /// interceptor registered at that point is a candidate.
    pub fn candidates(&self, exchange: &Exchange, point: InterceptPoint) -> Vec<Arc<InterceptorRecord>> {
        if point == InterceptPoint::RequestBeforeExchangeInit {
            return self.interceptors(point);
        }

        match exchange.pipeline_info().as_deref() {
            Some(PipelineInfo::Service { name, .. }) => self.service_interceptors(name, point),
            _ => self.proxy_interceptors(point),
        }
    }

    pub fn service(&self, name: &str) -> Option<Arc<ServiceRecord>> {
        self.services
            .get(name)
            .filter(|s| s.enabled)
            .map(|s| s.value().clone())
    }

    pub fn services(&self) -> Vec<Arc<ServiceRecord>> {
        let mut services: Vec<_> = self
            .services
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.value().clone())
            .collect();
        services.sort_by_key(|s| s.seq);
        services
    }

    /// Service the exchange was routed to, if any.
    pub fn handling_service(&self, exchange: &Exchange) -> Option<Arc<ServiceRecord>> {
        match exchange.pipeline_info().as_deref() {
            Some(PipelineInfo::Service { name, .. }) => self.service(name),
            _ => None,
        }
    }

    pub fn interceptor_count(&self) -> usize {
        self.interceptors.load().len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    fn select(
        &self,
        point: InterceptPoint,
        filter: impl Fn(&InterceptorRecord) -> bool,
    ) -> Vec<Arc<InterceptorRecord>> {
        self.interceptors
            .load()
            .iter()
            .filter(|r| {
                let record: &InterceptorRecord = r;
                record.enabled && record.descriptor.point == point && filter(record)
            })
            .cloned()
            .collect()
    }
}
