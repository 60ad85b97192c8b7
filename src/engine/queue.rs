//! Bounded received-ASDU queue
//!
//! Single producer (the engine), drained by scheduler tasks. On overflow the
//! oldest entry is dropped and a `queue_overflow` event is logged; monitoring
//! data is idempotent enough that dropping beats blocking the engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::codec::asdu::Asdu;

#[derive(Debug)]
struct Inner {
    deque: Mutex<VecDeque<Asdu>>,
    capacity: usize,
    overflows: AtomicU64,
}

/// Handle to the session's inbound queue; clones share the same buffer
#[derive(Debug, Clone)]
pub struct ReceiveQueue {
    inner: Arc<Inner>,
}

impl ReceiveQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                deque: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
                capacity,
                overflows: AtomicU64::new(0),
            }),
        }
    }

    /// Append one ASDU, evicting the oldest entry when full.
    pub fn push(&self, asdu: Asdu, channel: &str) {
        let mut deque = self.inner.deque.lock();
        if deque.len() >= self.inner.capacity {
            deque.pop_front();
            let total = self.inner.overflows.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                session = %channel,
                event_kind = "queue_overflow",
                detail = total,
                "received-ASDU queue full, dropped oldest entry"
            );
        }
        deque.push_back(asdu);
    }

    /// Atomically drain everything in on-wire order.
    pub fn drain(&self) -> Vec<Asdu> {
        self.inner.deque.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.deque.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.deque.lock().clear();
    }

    /// Total entries dropped to overflow since creation.
    pub fn overflow_count(&self) -> u64 {
        self.inner.overflows.load(Ordering::Relaxed)
    }
}
