// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU64, Ordering};

use log::warn;

/// A snapshot of the statistics of an [`InvalidationQueue`](crate::InvalidationQueue).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QiStats {
    /// Spin iterations spent waiting for the device to free queue slots.
    pub queue_full_stalls: u64,
    /// Generation changes forced by sequence exhaustion.
    pub forced_wraps: u64,
    /// Descriptors written to the queue, wait descriptors included.
    pub descriptors_emitted: u64,
    /// Invalidation wait descriptors written to the queue.
    pub wait_descriptors: u64,
    /// Reclaim records attached to the ledger.
    pub records_attached: u64,
    /// Reclaim records released after confirmation.
    pub records_released: u64,
    /// Runs of the completion bottom half.
    pub completion_interrupts: u64,
    /// Threads currently waiting for a stamp.
    pub live_waiters: u64,
}

#[derive(Debug, Default)]
pub(crate) struct QiCounters {
    pub(crate) queue_full_stalls: AtomicU64,
    pub(crate) forced_wraps: AtomicU64,
    pub(crate) descriptors_emitted: AtomicU64,
    pub(crate) wait_descriptors: AtomicU64,
    pub(crate) records_attached: AtomicU64,
    pub(crate) records_released: AtomicU64,
    pub(crate) completion_interrupts: AtomicU64,
}

impl QiCounters {
    pub(crate) fn add(counter: &AtomicU64, val: u64) {
        counter.fetch_add(val, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, live_waiters: u64) -> QiStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        QiStats {
            queue_full_stalls: load(&self.queue_full_stalls),
            forced_wraps: load(&self.forced_wraps),
            descriptors_emitted: load(&self.descriptors_emitted),
            wait_descriptors: load(&self.wait_descriptors),
            records_attached: load(&self.records_attached),
            records_released: load(&self.records_released),
            completion_interrupts: load(&self.completion_interrupts),
            live_waiters,
        }
    }
}

/// The bookkeeping of one busy-wait on the device.
///
/// The device is assumed to always make progress, so a busy-wait never gives
/// up. A stall that lasts suspiciously long is reported once.
pub struct StallWatch<'a> {
    what: &'static str,
    warn_after: Option<u64>,
    spins: u64,
    counter: Option<&'a AtomicU64>,
}

impl<'a> StallWatch<'a> {
    /// Creates a watch that warns after `warn_after` spins, if any.
    pub fn new(what: &'static str, warn_after: Option<u64>) -> Self {
        Self {
            what,
            warn_after,
            spins: 0,
            counter: None,
        }
    }

    /// Also accumulates the spins into `counter`.
    pub(crate) fn counting(mut self, counter: &'a AtomicU64) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Records one unsuccessful poll and relaxes the CPU.
    pub fn spin(&mut self) {
        self.spins += 1;
        if let Some(counter) = self.counter {
            QiCounters::add(counter, 1);
        }
        if self.warn_after == Some(self.spins) {
            warn!(
                "IOMMU QI: {} has not progressed after {} polls; the device may be hung",
                self.what, self.spins
            );
        }
        core::hint::spin_loop();
    }

    /// Returns the number of unsuccessful polls so far.
    pub fn spins(&self) -> u64 {
        self.spins
    }
}
