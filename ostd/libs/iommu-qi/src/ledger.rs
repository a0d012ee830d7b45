// SPDX-License-Identifier: MPL-2.0

//! The ledger of resources waiting for an invalidation to complete.

use alloc::collections::VecDeque;

use smallvec::SmallVec;

use crate::genseq::GenSeq;

/// A deferred release, stamped with the invalidation that must complete first.
#[derive(Debug)]
pub(crate) struct ReclaimRecord<T> {
    stamp: GenSeq,
    payload: T,
}

impl<T> ReclaimRecord<T> {
    pub(crate) fn stamp(&self) -> GenSeq {
        self.stamp
    }

    pub(crate) fn into_payload(self) -> T {
        self.payload
    }
}

/// The number of records released per acquisition of the engine lock.
pub(crate) const DRAIN_BATCH: usize = 16;

/// A batch of records taken off the ledger.
pub(crate) type DrainBatch<T> = SmallVec<[ReclaimRecord<T>; DRAIN_BATCH]>;

/// A FIFO of [`ReclaimRecord`]s in stamp order.
///
/// Records enter in the order their stamps were allocated, so the stamps
/// never decrease from front to back and draining can stop at the first
/// record that is not confirmed yet.
#[derive(Debug)]
pub(crate) struct ReclaimLedger<T> {
    pending: VecDeque<ReclaimRecord<T>>,
}

impl<T> ReclaimLedger<T> {
    pub(crate) const fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Appends a record stamped with `stamp`.
    ///
    /// Must happen before the descriptors covered by `stamp` are published.
    pub(crate) fn attach(&mut self, payload: T, stamp: GenSeq) {
        debug_assert!(self.pending.back().is_none_or(|last| last.stamp <= stamp));
        self.pending.push_back(ReclaimRecord { stamp, payload });
    }

    /// Moves confirmed records from the front into `batch`, until the first
    /// unconfirmed record, the end of the ledger, or a full batch.
    ///
    /// Returns whether confirmed records may remain.
    pub(crate) fn take_confirmed(
        &mut self,
        mut is_confirmed: impl FnMut(GenSeq) -> bool,
        batch: &mut DrainBatch<T>,
    ) -> bool {
        while let Some(front) = self.pending.front() {
            if batch.len() == DRAIN_BATCH {
                return true;
            }
            if !is_confirmed(front.stamp) {
                return false;
            }
            // The front exists, as checked above.
            if let Some(record) = self.pending.pop_front() {
                batch.push(record);
            }
        }
        false
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns the stamp of the oldest record.
    pub(crate) fn oldest(&self) -> Option<GenSeq> {
        self.pending.front().map(ReclaimRecord::stamp)
    }
}
