//! Keep-alive and deferred marking for objects handed to foreign code.
//!
//! Foreign extensions expect two guarantees the collector alone cannot give:
//! an object converted to a native handle must stay alive even when the only
//! remaining reference to it sits in a native struct, and wrapper objects
//! with a custom mark callback must get that callback run so they can re-mark
//! whatever they point at. Both are provided here without touching real GC
//! roots: every handle is appended to a per-thread kept buffer (and to the
//! current foreign-call frame), full buffers are handed off to a queue, and a
//! dedicated runner thread reacts to each hand-off by invoking every
//! registered mark action.
//!
//! Mark owners are held weakly so a registration never keeps its owner alive
//! on its own.

use std::{
    collections::VecDeque,
    mem,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;

use crate::object::{ObjectRef, WeakObj};
use crate::process::{self, EntryList, run_isolated};
use crate::refqueue::{ReferenceQueue, ServiceKind, Token};

pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

#[derive(Debug, Default)]
pub struct MarkingCreateInfo {
    /// Per-thread kept buffer capacity; trades mark-pass frequency against
    /// per-thread footprint.
    pub buffer_capacity: Option<usize>,
}

#[derive(Debug)]
pub struct MarkingSettings {
    buffer_capacity: usize,
}

impl Default for MarkingSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

struct MarkerNode {
    owner: WeakObj,
    action: Arc<dyn Fn(&ObjectRef) + Send + Sync>,
}

impl Clone for MarkerNode {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            action: Arc::clone(&self.action),
        }
    }
}

/// State shared between producer threads, their proxies and the processor
/// thread.
pub struct MarkingShared {
    settings: MarkingSettings,
    pub(crate) queue: ReferenceQueue,
    markers: EntryList<MarkerNode>,
    runners: EntryList<()>,
    handoff: Mutex<VecDeque<Vec<ObjectRef>>>,
    survivors: Mutex<KeptObjects>,
    finalizing: AtomicBool,
    handoffs: AtomicUsize,
    mark_passes: AtomicUsize,
}

impl MarkingShared {
    pub(crate) fn new(info: &MarkingCreateInfo) -> Arc<Self> {
        let mut settings = MarkingSettings::default();
        info.buffer_capacity
            .inspect(|&val| settings.buffer_capacity = val);
        assert!(settings.buffer_capacity > 0, "buffer capacity must be > 0");

        let capacity = settings.buffer_capacity;
        Arc::new(Self {
            settings,
            queue: ReferenceQueue::new(),
            markers: EntryList::new(),
            runners: EntryList::new(),
            handoff: Mutex::new(VecDeque::new()),
            survivors: Mutex::new(KeptObjects::new(capacity)),
            finalizing: AtomicBool::new(false),
            handoffs: AtomicUsize::new(0),
            mark_passes: AtomicUsize::new(0),
        })
    }

    /// Hand a completed buffer over to the runner. Ownership of `batch`
    /// transfers here; the producer must not touch it again. Each hand-off
    /// registers a throwaway wake-up reference whose death notification
    /// drives the processor thread, so the batch itself needs no signal.
    pub(crate) fn queue_for_marking(&self, batch: Vec<ObjectRef>) {
        log::trace!("handing off {} kept objects", batch.len());
        self.handoff.lock().push_back(batch);
        self.handoffs.fetch_add(1, Ordering::Relaxed);

        let wake = ObjectRef::new(());
        let entry = self.runners.add(());
        wake.watch(
            &self.queue,
            Token {
                service: ServiceKind::Runner,
                entry,
            },
        );
        drop(wake);
    }

    /// Base notification behavior: the owner died, unlink its entry.
    pub(crate) fn process_marker(&self, entry: usize) {
        self.markers.remove(entry);
    }

    /// Runner notification: drain every queued buffer, run a full mark pass
    /// if anything was drained, then perform the base cleanup for the
    /// wake-up entry. The drained buffers stay alive until after the pass.
    pub(crate) fn process_runner(&self, entry: usize) {
        let drained: VecDeque<Vec<ObjectRef>> = mem::take(&mut *self.handoff.lock());
        if !drained.is_empty() {
            self.run_all_markers();
        }
        self.runners.remove(entry);
        drop(drained);
    }

    /// One full mark pass: visit every registered marker from head to tail.
    /// `next` is captured before the action runs, and unlinking only happens
    /// on this same thread, so concurrent head insertions cannot corrupt the
    /// walk (they are simply picked up by the next pass).
    fn run_all_markers(&self) {
        let mut current = self.markers.head();
        while let Some(idx) = current {
            let (node, next) = self
                .markers
                .get_with_next(idx)
                .expect("marker entry vanished during a pass");
            run_isolated("mark action", || self.run_marker(&node));
            if next == Some(idx) {
                panic!("marker registry linked structure has become broken");
            }
            current = next;
        }
        self.mark_passes.fetch_add(1, Ordering::Relaxed);
    }

    fn run_marker(&self, node: &MarkerNode) {
        if self.finalizing.load(Ordering::Acquire) {
            return;
        }
        if let Some(owner) = node.owner.upgrade() {
            (node.action)(&owner);
        }
    }

    #[cfg(test)]
    fn handoff_len(&self) -> usize {
        self.handoff.lock().len()
    }

    #[cfg(test)]
    fn pop_handoff(&self) -> Option<Vec<ObjectRef>> {
        self.handoff.lock().pop_front()
    }

    #[cfg(test)]
    fn survivors_len(&self) -> usize {
        self.survivors.lock().len()
    }
}

/// Fixed-capacity buffer of objects kept alive for foreign code. Owned by
/// exactly one thread; overflow hands the whole buffer off and starts fresh.
pub struct KeptObjects {
    objects: Vec<ObjectRef>,
    capacity: usize,
}

impl KeptObjects {
    fn new(capacity: usize) -> Self {
        Self {
            objects: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_full(&self) -> bool {
        self.objects.len() == self.capacity
    }

    fn queue_and_reset(&mut self, shared: &MarkingShared) {
        let batch = mem::replace(&mut self.objects, Vec::with_capacity(self.capacity));
        shared.queue_for_marking(batch);
    }

    /// Append an object, handing the buffer off first if it is already full.
    ///
    /// The ordering matters: a handle is created and only afterwards stored
    /// in its native struct. Handing off right after inserting would let a
    /// mark pass run before the store, and the freshly inserted handle could
    /// be collected. Objects already in the buffer are past that window, so
    /// fullness is checked on entry, never after the insert.
    fn keep(&mut self, shared: &MarkingShared, object: ObjectRef) {
        if self.is_full() {
            self.queue_and_reset(shared);
        }
        self.objects.push(object);
    }

    /// Fold another buffer into this one without losing or reordering a
    /// single entry. Used when a thread dies with a partially filled buffer.
    fn keep_objects(&mut self, shared: &MarkingShared, mut other: KeptObjects) {
        if self.is_full() {
            self.queue_and_reset(shared);
        }
        if other.is_full() {
            // Already a complete batch, hand it off as-is.
            shared.queue_for_marking(mem::take(&mut other.objects));
            return;
        }
        if other.objects.is_empty() {
            return;
        }
        if self.objects.len() + other.objects.len() <= self.capacity {
            self.objects.append(&mut other.objects);
            return;
        }
        let overflow = self.objects.len() + other.objects.len() - self.capacity;
        let initial = other.objects.len() - overflow;
        let tail = other.objects.split_off(initial);
        self.objects.append(&mut other.objects);
        self.queue_and_reset(shared);
        self.objects.extend(tail);
    }
}

/// Stack of preservation frames, one frame per foreign call in flight. The
/// top frame pins everything kept during the current call; popping discards
/// the frame wholesale.
pub struct MarkerStack {
    current: MarkerFrame,
}

struct MarkerFrame {
    entries: Vec<ObjectRef>,
    parent: Option<Box<MarkerFrame>>,
}

impl MarkerFrame {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            parent: None,
        }
    }
}

impl MarkerStack {
    fn new() -> Self {
        Self {
            current: MarkerFrame::new(),
        }
    }

    pub fn push(&mut self) {
        let parent = mem::replace(&mut self.current, MarkerFrame::new());
        self.current.parent = Some(Box::new(parent));
    }

    pub fn pop(&mut self) {
        let parent = self
            .current
            .parent
            .take()
            .expect("popping the base preservation frame");
        self.current = *parent;
    }

    fn preserve(&mut self, object: ObjectRef) {
        self.current.entries.push(object);
    }

    /// Number of frames above the base frame.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut frame = &self.current;
        while let Some(parent) = &frame.parent {
            depth += 1;
            frame = parent;
        }
        depth
    }

    #[cfg(test)]
    fn top_len(&self) -> usize {
        self.current.entries.len()
    }
}

/// Per-thread marking context: the kept buffer plus the preservation stack.
/// Created from the service, moved onto the producer thread. Dropping the
/// proxy folds any still-buffered objects into the service's survivor buffer
/// so nothing a dying thread kept is silently lost.
pub struct MarkerProxy {
    shared: Arc<MarkingShared>,
    kept: KeptObjects,
    stack: MarkerStack,
}

impl MarkerProxy {
    fn new(shared: Arc<MarkingShared>) -> Self {
        let capacity = shared.settings.buffer_capacity;
        Self {
            shared,
            kept: KeptObjects::new(capacity),
            stack: MarkerStack::new(),
        }
    }

    /// Keep `object` alive: pin it in the current preservation frame and
    /// append it to the kept buffer. Call this strictly after the native
    /// side has durably stored the handle.
    pub fn keep(&mut self, object: ObjectRef) {
        self.stack.preserve(object.clone());
        self.kept.keep(&self.shared, object);
    }

    pub fn enter_foreign_call(&mut self) {
        self.stack.push();
    }

    /// Must pair with a preceding [`enter_foreign_call`]; popping the base
    /// frame is a caller bug and panics.
    ///
    /// [`enter_foreign_call`]: Self::enter_foreign_call
    pub fn exit_foreign_call(&mut self) {
        self.stack.pop();
    }

    /// Bracket a foreign call with a guard so the frame is popped on every
    /// exit path, including unwinds.
    pub fn foreign_call(&mut self) -> ForeignCall<'_> {
        self.stack.push();
        ForeignCall { proxy: self }
    }

    pub fn buffered(&self) -> usize {
        self.kept.len()
    }

    pub fn call_depth(&self) -> usize {
        self.stack.depth()
    }
}

impl Drop for MarkerProxy {
    fn drop(&mut self) {
        let capacity = self.kept.capacity;
        let leftover = mem::replace(&mut self.kept, KeptObjects::new(capacity));
        if !leftover.is_empty() {
            self.shared
                .survivors
                .lock()
                .keep_objects(&self.shared, leftover);
        }
    }
}

/// RAII frame for one foreign call boundary.
pub struct ForeignCall<'a> {
    proxy: &'a mut MarkerProxy,
}

impl ForeignCall<'_> {
    pub fn keep(&mut self, object: ObjectRef) {
        self.proxy.keep(object);
    }
}

impl Drop for ForeignCall<'_> {
    fn drop(&mut self) {
        self.proxy.exit_foreign_call();
    }
}

/// Owner of the shared marking state and the reference processor thread.
pub struct MarkingService {
    shared: Arc<MarkingShared>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl MarkingService {
    pub fn new(info: MarkingCreateInfo) -> Self {
        let shared = MarkingShared::new(&info);
        let processor = process::spawn_processor(Arc::clone(&shared));
        Self {
            shared,
            processor: Mutex::new(Some(processor)),
        }
    }

    pub fn create_proxy(&self) -> MarkerProxy {
        MarkerProxy::new(Arc::clone(&self.shared))
    }

    /// Register a mark action for `owner`. The owner is held weakly; once it
    /// becomes unreachable the registration is drained and the action never
    /// runs again.
    pub fn register_mark<F>(&self, owner: &ObjectRef, action: F)
    where
        F: Fn(&ObjectRef) + Send + Sync + 'static,
    {
        let entry = self.shared.markers.add(MarkerNode {
            owner: owner.downgrade(),
            action: Arc::new(action),
        });
        owner.watch(
            &self.shared.queue,
            Token {
                service: ServiceKind::Marker,
                entry,
            },
        );
    }

    pub fn mark_pass_count(&self) -> usize {
        self.shared.mark_passes.load(Ordering::Relaxed)
    }

    pub fn handoff_count(&self) -> usize {
        self.shared.handoffs.load(Ordering::Relaxed)
    }

    pub fn marker_count(&self) -> usize {
        self.shared.markers.len()
    }

    /// Enter the terminal phase: mark actions are suppressed from here on,
    /// the queue is closed and the processor thread joined.
    pub fn shutdown(&self) {
        self.shared.finalizing.store(true, Ordering::Release);
        self.shared.queue.close();
        if let Some(handle) = self.processor.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MarkingService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
