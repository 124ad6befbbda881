use std::{
    any::Any,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::refqueue::{ReferenceQueue, Token};

/// A strong reference to a managed object. Clones share identity; equality is
/// identity, never payload comparison. The payload itself is opaque to this
/// crate, the embedding decides what lives inside.
pub struct ObjectRef {
    data: Arc<ObjectData>,
}

/// Weak counterpart to [`ObjectRef`]. Holding one never keeps the object
/// alive.
#[derive(Clone)]
pub struct WeakObj {
    data: Weak<ObjectData>,
}

struct ObjectData {
    payload: Box<dyn Any + Send + Sync>,
    watchers: Mutex<Vec<Watcher>>,
}

struct Watcher {
    queue: ReferenceQueue,
    token: Token,
}

impl ObjectRef {
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            data: Arc::new(ObjectData {
                payload: Box::new(payload),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.data.payload.downcast_ref::<T>()
    }

    pub fn downgrade(&self) -> WeakObj {
        WeakObj {
            data: Arc::downgrade(&self.data),
        }
    }

    /// Register a death notification: once the last strong reference to this
    /// object is gone, `token` is posted on `queue`.
    pub(crate) fn watch(&self, queue: &ReferenceQueue, token: Token) {
        self.data.watchers.lock().push(Watcher {
            queue: queue.clone(),
            token,
        });
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for ObjectRef {}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("addr", &Arc::as_ptr(&self.data))
            .finish()
    }
}

impl WeakObj {
    pub fn upgrade(&self) -> Option<ObjectRef> {
        self.data.upgrade().map(|data| ObjectRef { data })
    }
}

impl fmt::Debug for WeakObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakObj")
            .field("alive", &(self.data.strong_count() > 0))
            .finish()
    }
}

impl Drop for ObjectData {
    fn drop(&mut self) {
        for watcher in self.watchers.get_mut().drain(..) {
            watcher.queue.push(watcher.token);
        }
    }
}
