//! Registry entries for interceptors and services

use crate::exchange::ContentKind;
use crate::interceptor::{InterceptPoint, Interceptor};
use crate::service::Service;
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Where a plugin came from. Script plugins are undeployed by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOrigin {
    Native,
    Script(PathBuf),
}

/// Metadata shared by every plugin kind plus the instance itself.
pub struct PluginRecord<T: ?Sized, D> {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    /// Higher runs first
    pub priority: i32,
    /// Runs even when the handling service opts out of the point
    pub required: bool,
    /// Registration order, assigned by the registry
    pub seq: u64,
    pub origin: PluginOrigin,
    pub descriptor: D,
    pub instance: Arc<T>,
}

#[derive(Debug, Clone)]
pub struct InterceptorDescriptor {
    pub point: InterceptPoint,
    pub kind: ContentKind,
    /// Needs the response body, which forces the buffering conduit
    pub requires_content: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub uri: String,
    pub kind: ContentKind,
    pub dont_intercept: Vec<InterceptPoint>,
    /// Run on a spawned task instead of the request task
    pub blocking: bool,
}

pub type InterceptorRecord = PluginRecord<dyn Interceptor, InterceptorDescriptor>;
pub type ServiceRecord = PluginRecord<dyn Service, ServiceDescriptor>;

impl<T: ?Sized, D> PluginRecord<T, D> {
    fn with_descriptor(name: impl Into<String>, descriptor: D, instance: Arc<T>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled: true,
            priority: 0,
            required: false,
            seq: 0,
            origin: PluginOrigin::Native,
            descriptor,
            instance,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_origin(mut self, origin: PluginOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Execution order: priority descending, then registration order.
    pub fn execution_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

impl InterceptorRecord {
    pub fn interceptor(
        name: impl Into<String>,
        point: InterceptPoint,
        instance: Arc<dyn Interceptor>,
    ) -> Self {
        Self::with_descriptor(
            name,
            InterceptorDescriptor {
                point,
                kind: ContentKind::default(),
                requires_content: false,
            },
            instance,
        )
    }

    pub fn with_kind(mut self, kind: ContentKind) -> Self {
        self.descriptor.kind = kind;
        self
    }

    pub fn requiring_content(mut self) -> Self {
        self.descriptor.requires_content = true;
        self
    }
}

impl ServiceRecord {
    pub fn service(name: impl Into<String>, uri: impl Into<String>, instance: Arc<dyn Service>) -> Self {
        Self::with_descriptor(
            name,
            ServiceDescriptor {
                uri: uri.into(),
                kind: ContentKind::Json,
                dont_intercept: Vec::new(),
                blocking: false,
            },
            instance,
        )
    }

    pub fn with_kind(mut self, kind: ContentKind) -> Self {
        self.descriptor.kind = kind;
        self
    }

    pub fn dont_intercept(mut self, points: impl IntoIterator<Item = InterceptPoint>) -> Self {
        self.descriptor.dont_intercept.extend(points);
        self
    }

    pub fn blocking(mut self) -> Self {
        self.descriptor.blocking = true;
        self
    }
}

impl ServiceDescriptor {
    /// Whether only required interceptors run at `point` for this service.
    pub fn opts_out_of(&self, point: InterceptPoint) -> bool {
        self.dont_intercept
            .iter()
            .any(|p| *p == point || *p == InterceptPoint::Any)
    }
}

impl<T: ?Sized, D: fmt::Debug> fmt::Debug for PluginRecord<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("required", &self.required)
            .field("seq", &self.seq)
            .field("origin", &self.origin)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
