use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed key into an exchange's attachment slots.
pub struct AttachmentKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttachmentKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttachmentKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttachmentKey<T> {}

impl<T> fmt::Debug for AttachmentKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentKey({})", self.name)
    }
}

#[derive(Default)]
pub struct Attachments {
    slots: DashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl Attachments {
    pub fn put<T: Any + Send + Sync>(&self, key: AttachmentKey<T>, value: T) {
        self.slots.insert(key.name, Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: AttachmentKey<T>) -> Option<Arc<T>> {
        let slot = self.slots.get(key.name)?.value().clone();
        slot.downcast::<T>().ok()
    }

    pub fn remove<T: Any + Send + Sync>(&self, key: AttachmentKey<T>) -> Option<Arc<T>> {
        let (_, slot) = self.slots.remove(key.name)?;
        slot.downcast::<T>().ok()
    }

    pub fn contains<T>(&self, key: AttachmentKey<T>) -> bool {
        self.slots.contains_key(key.name)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.slots.iter().map(|e| *e.key()).collect();
        f.debug_struct("Attachments").field("keys", &names).finish()
    }
}
