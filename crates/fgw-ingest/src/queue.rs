//! ---
//! fgw_section: "04-ingestion"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Value-update ingestion into the shared store."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fgw_common::model::ValueUpdate;
use fgw_metrics::IngestMetrics;
use parking_lot::Mutex;
use tracing::warn;

/// Bounded FIFO between field adapters and the drain loop.
///
/// Producers never block: when full, the oldest entries are discarded.
#[derive(Debug)]
pub struct UpdateQueue {
    bound: usize,
    items: Mutex<VecDeque<ValueUpdate>>,
    dropped: AtomicU64,
    overflowing: AtomicBool,
    metrics: Option<IngestMetrics>,
}

impl UpdateQueue {
    pub fn new(bound: usize) -> Self {
        let bound = bound.max(1);
        Self {
            bound,
            items: Mutex::new(VecDeque::with_capacity(bound.min(4096))),
            dropped: AtomicU64::new(0),
            overflowing: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Accept an update, evicting the oldest entries if the bound is reached.
    /// Returns the number of evicted entries.
    pub fn enqueue(&self, update: ValueUpdate) -> usize {
        let (evicted, depth) = {
            let mut items = self.items.lock();
            let mut evicted = 0;
            while items.len() >= self.bound {
                items.pop_front();
                evicted += 1;
            }
            items.push_back(update);
            (evicted, items.len())
        };
        self.account(evicted, depth);
        if let Some(metrics) = &self.metrics {
            metrics.record_enqueue(evicted as u64);
        }
        evicted
    }

    pub fn pop(&self) -> Option<ValueUpdate> {
        let mut items = self.items.lock();
        let item = items.pop_front();
        if items.is_empty() {
            self.overflowing.store(false, Ordering::Relaxed);
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(items.len());
        }
        item
    }

    /// Put a failed batch back at the head, in its original order, then trim
    /// anything beyond the bound from the oldest end. Returns the number trimmed.
    pub fn requeue_front(&self, batch: Vec<ValueUpdate>) -> usize {
        let (evicted, depth) = {
            let mut items = self.items.lock();
            for update in batch.into_iter().rev() {
                items.push_front(update);
            }
            let mut evicted = 0;
            while items.len() > self.bound {
                items.pop_front();
                evicted += 1;
            }
            (evicted, items.len())
        };
        self.account(evicted, depth);
        evicted
    }

    /// Discard everything queued. Returns the number discarded.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let discarded = items.len();
        items.clear();
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(0);
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Entries evicted by the bound since startup.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn account(&self, evicted: usize, depth: usize) {
        if evicted > 0 {
            let total = self.dropped.fetch_add(evicted as u64, Ordering::Relaxed) + evicted as u64;
            // One warning per overflow episode; totals go to the cycle stats.
            if !self.overflowing.swap(true, Ordering::Relaxed) {
                warn!(evicted, total, bound = self.bound, "ingestion queue full; dropping oldest updates");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(depth);
        }
    }
}
