// SPDX-License-Identifier: MPL-2.0

use core::time::Duration;

use crate::{QiError, Result};

/// Options for creating an [`InvalidationQueue`](crate::InvalidationQueue).
#[derive(Debug, Clone)]
pub struct QiOptions {
    queue_pages: usize,
    recheck_period: Duration,
    stall_warn_spins: Option<u64>,
}

impl QiOptions {
    /// The largest queue that the hardware accepts, in pages.
    pub const MAX_QUEUE_PAGES: usize = 1 << 7;
    /// The default number of unsuccessful polls before a busy-wait is reported.
    pub const DEFAULT_STALL_WARN_SPINS: u64 = 1_000_000;

    /// Creates options for a queue of `queue_pages` pages.
    ///
    /// By default, sleeping waiters re-check their stamp every second and a
    /// busy-wait warns after a million unsuccessful polls.
    pub fn new(queue_pages: usize) -> Self {
        Self {
            queue_pages,
            recheck_period: Duration::from_secs(1),
            stall_warn_spins: Some(Self::DEFAULT_STALL_WARN_SPINS),
        }
    }

    /// Sets the longest time a sleeping waiter goes without re-checking its stamp.
    pub fn recheck_period(mut self, period: Duration) -> Self {
        self.recheck_period = period;
        self
    }

    /// Sets after how many unsuccessful polls a busy-wait is reported.
    ///
    /// `None` disables the report. Busy-waits never give up either way.
    pub fn stall_warn_spins(mut self, spins: Option<u64>) -> Self {
        self.stall_warn_spins = spins;
        self
    }

    pub(crate) fn queue_pages(&self) -> usize {
        self.queue_pages
    }

    pub(crate) fn recheck(&self) -> Duration {
        self.recheck_period
    }

    pub(crate) fn warn_after(&self) -> Option<u64> {
        self.stall_warn_spins
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.queue_pages.is_power_of_two() || self.queue_pages > Self::MAX_QUEUE_PAGES {
            return Err(QiError::InvalidQueueSize);
        }
        Ok(())
    }
}

impl Default for QiOptions {
    fn default() -> Self {
        Self::new(1)
    }
}
