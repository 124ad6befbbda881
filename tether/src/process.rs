use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use crate::marking::MarkingShared;
use crate::refqueue::ServiceKind;

/// Doubly linked registry of live entries, kept as an arena of slots with
/// `prev`/`next` indices. Insertion happens at the head from any thread;
/// unlinking only ever happens on the processor thread. That split is what
/// allows a traversal to capture `next` for a node, release the lock while
/// user code runs, and trust the captured index afterwards.
pub struct EntryList<T> {
    links: Mutex<Links<T>>,
}

struct Links<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
}

struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<T> EntryList<T> {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(Links {
                slots: Vec::new(),
                free: Vec::new(),
                head: None,
            }),
        }
    }

    /// Insert at the list head. O(1), callable from any thread.
    pub fn add(&self, value: T) -> usize {
        let mut links = self.links.lock();
        let node = Node {
            value,
            prev: None,
            next: links.head,
        };
        let idx = match links.free.pop() {
            Some(idx) => {
                links.slots[idx] = Some(node);
                idx
            }
            None => {
                links.slots.push(Some(node));
                links.slots.len() - 1
            }
        };
        if let Some(old_head) = links.head {
            links.slots[old_head]
                .as_mut()
                .expect("list head points at an empty slot")
                .prev = Some(idx);
        }
        links.head = Some(idx);
        idx
    }

    /// Unlink an entry and free its slot. Processor thread only.
    pub fn remove(&self, idx: usize) -> Option<T> {
        let mut links = self.links.lock();
        let node = links.slots.get_mut(idx)?.take()?;
        match node.prev {
            Some(prev) => {
                links.slots[prev]
                    .as_mut()
                    .expect("prev link points at an empty slot")
                    .next = node.next;
            }
            None => links.head = node.next,
        }
        if let Some(next) = node.next {
            links.slots[next]
                .as_mut()
                .expect("next link points at an empty slot")
                .prev = node.prev;
        }
        links.free.push(idx);
        Some(node.value)
    }

    pub fn head(&self) -> Option<usize> {
        self.links.lock().head
    }

    /// Snapshot an entry's value together with its successor index, so the
    /// caller can drop the lock before running user code.
    pub fn get_with_next(&self, idx: usize) -> Option<(T, Option<usize>)>
    where
        T: Clone,
    {
        let links = self.links.lock();
        let node = links.slots.get(idx)?.as_ref()?;
        Some((node.value.clone(), node.next))
    }

    pub fn len(&self) -> usize {
        let links = self.links.lock();
        links.slots.len() - links.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn corrupt_next(&self, idx: usize, next: Option<usize>) {
        let mut links = self.links.lock();
        links.slots[idx]
            .as_mut()
            .expect("corrupting an empty slot")
            .next = next;
    }
}

impl<T> Default for EntryList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a user-supplied callback with error isolation: a panicking callback is
/// logged and must not take down the processor thread or suppress the entries
/// that come after it.
pub(crate) fn run_isolated<F: FnOnce()>(what: &str, f: F) {
    if let Err(err) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = if let Some(s) = err.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = err.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        log::error!("{what} failed: {message}");
    }
}

/// Spawn the single dedicated thread that consumes the reference queue and
/// dispatches notifications. Mark execution and entry cleanup share this
/// thread on purpose: serializing them removes the need for a lock between
/// the two, and with it one class of deadlock.
pub(crate) fn spawn_processor(shared: Arc<MarkingShared>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("reference-processor".to_string())
        .spawn(move || {
            while let Some(token) = shared.queue.pop() {
                match token.service {
                    ServiceKind::Marker => shared.process_marker(token.entry),
                    ServiceKind::Runner => shared.process_runner(token.entry),
                }
            }
            log::debug!("reference processor exiting");
        })
        .expect("spawn reference processor")
}
