//! Bounded drop-oldest ring for per-reader unit delivery
//!
//! Single producer (the stream write path), single consumer (the reader's
//! delivery task). A full ring drops its oldest element and counts the
//! overflow; the producer never blocks. Closing discards everything still
//! queued without running it.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Queued delivery, ready to invoke on the consumer task.
pub type RingItem = Box<dyn FnOnce() + Send>;

struct RingState {
    queue: VecDeque<RingItem>,
    capacity: usize,
    overflow: u64,
    closed: bool,
}

pub struct UnitRing {
    state: Mutex<RingState>,
    notify: Notify,
}

impl UnitRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                overflow: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue an item, dropping the oldest one if the ring is full.
    /// Returns false if the ring is already closed.
    pub fn push(&self, item: RingItem) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return false;
            }
            if state.queue.len() == state.capacity {
                state.queue.pop_front();
                state.overflow += 1;
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Dequeue the next item, waiting until one is available. Returns
    /// `None` once the ring is closed; anything still queued at close time
    /// is discarded.
    pub async fn pull(&self) -> Option<RingItem> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    return Some(item);
                }
            }
            // notify_one stores a permit, so a push between the unlock
            // above and this await is not lost
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.queue.clear();
        }
        self.notify.notify_one();
    }

    /// Number of items dropped because the ring was full.
    pub fn overflow(&self) -> u64 {
        self.state.lock().unwrap().overflow
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
