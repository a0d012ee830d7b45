// SPDX-License-Identifier: MPL-2.0

//! Synchronous waiting for a completion stamp.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    genseq::{CompletionMark, GenSeq},
    hal::{CompletionWaitQueue, DmaWord},
    options::QiOptions,
    stats::StallWatch,
};

/// How a thread waits for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Sleeps on the completion wait queue.
    ///
    /// The wait descriptor then requests an interrupt, whose bottom half
    /// wakes the sleeper up.
    Sleep,
    /// Busy-polls the completion marker.
    ///
    /// Required where sleeping is impossible, e.g., with other spin locks
    /// held or before the scheduler runs.
    Spin,
}

impl WaitMode {
    /// Returns [`WaitMode::Sleep`] if the caller may sleep, [`WaitMode::Spin`] otherwise.
    pub fn from_allow_sleep(allow_sleep: bool) -> Self {
        if allow_sleep { Self::Sleep } else { Self::Spin }
    }
}

/// A registration in the live-waiter count.
///
/// The completion bottom half only wakes up the wait queue while the count is
/// non-zero, so a ticket must exist before the wait descriptor it waits for
/// is published.
pub(crate) struct WaiterTicket<'a> {
    waiters: &'a AtomicU64,
}

impl<'a> WaiterTicket<'a> {
    pub(crate) fn new(waiters: &'a AtomicU64) -> Self {
        waiters.fetch_add(1, Ordering::SeqCst);
        Self { waiters }
    }
}

impl Drop for WaiterTicket<'_> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Blocks until the device has executed everything up to `stamp`.
///
/// The caller must hold a [`WaiterTicket`] and must not hold the engine lock.
pub(crate) fn wait_for<W: DmaWord, Q: CompletionWaitQueue>(
    mark: &CompletionMark<W>,
    wait_queue: &Q,
    stamp: GenSeq,
    mode: WaitMode,
    options: &QiOptions,
) {
    match mode {
        WaitMode::Spin => {
            let mut watch = StallWatch::new("completion wait", options.warn_after());
            while !mark.is_confirmed(stamp) {
                watch.spin();
            }
        }
        WaitMode::Sleep => {
            // A missed interrupt costs at most one recheck period.
            while !mark.is_confirmed(stamp) {
                wait_queue.wait_until(&mut || mark.is_confirmed(stamp), options.recheck());
            }
        }
    }
}
