use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Condvar, Mutex};

/// Which registry a queued notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// A registered mark owner died; its entry must be unlinked.
    Marker,
    /// A hand-off wake-up reference died; the runner must drain and mark.
    Runner,
}

/// Notification posted when a watched object becomes unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub service: ServiceKind,
    pub entry: usize,
}

/// Unbounded blocking queue of death notifications. Producers are object
/// drops on arbitrary threads and never block; the single consumer is the
/// reference processor thread.
#[derive(Clone)]
pub struct ReferenceQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    tokens: Mutex<VecDeque<Token>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl ReferenceQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                tokens: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn push(&self, token: Token) {
        {
            let mut tokens = self.shared.tokens.lock();
            // Objects still die during teardown; their notifications are moot.
            if self.shared.closed.load(Ordering::Acquire) {
                return;
            }
            tokens.push_back(token);
        }
        self.shared.ready.notify_one();
    }

    /// Blocking pop. Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<Token> {
        let mut tokens = self.shared.tokens.lock();
        loop {
            if let Some(token) = tokens.pop_front() {
                return Some(token);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.ready.wait(&mut tokens);
        }
    }

    pub fn try_pop(&self) -> Option<Token> {
        self.shared.tokens.lock().pop_front()
    }

    pub fn close(&self) {
        {
            let _tokens = self.shared.tokens.lock();
            self.shared.closed.store(true, Ordering::Release);
        }
        self.shared.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReferenceQueue {
    fn default() -> Self {
        Self::new()
    }
}
