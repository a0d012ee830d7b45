// SPDX-License-Identifier: MPL-2.0

//! Completion sequencing.
//!
//! Each submission is stamped with a [`GenSeq`]. Stamps are handed out in
//! the same order as descriptors enter the queue, so the device completes
//! them in stamp order and "has the device reached stamp S" becomes a
//! comparison against the highest stamp the device has reported.
//!
//! The device only reports the 32-bit sequence number, through a wait
//! descriptor that writes it to the completion marker. The generation lives
//! in software and changes only at a point where the device is known to
//! have drained everything of the old generation.

use core::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use crate::hal::DmaWord;

/// A (generation, sequence) completion stamp.
///
/// Stamps are totally ordered: first by generation, then by sequence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenSeq {
    generation: u32,
    sequence: u32,
}

impl GenSeq {
    /// The first sequence number of each generation.
    pub const FIRST_SEQUENCE: u32 = 1;
    /// The reserved sequence number that forces a generation change.
    pub const SENTINEL: u32 = u32::MAX;

    /// Creates a stamp.
    pub const fn new(generation: u32, sequence: u32) -> Self {
        Self {
            generation,
            sequence,
        }
    }

    /// Returns the generation.
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns the sequence number within the generation.
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.sequence as u64
    }

    const fn from_bits(bits: u64) -> Self {
        Self::new((bits >> 32) as u32, bits as u32)
    }
}

impl fmt::Debug for GenSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:#x})", self.generation, self.sequence)
    }
}

/// The producer of stamps.
///
/// It is only touched with the engine lock held.
#[derive(Debug)]
pub(crate) struct Sequencer {
    generation: u32,
    next_sequence: u32,
}

impl Sequencer {
    pub(crate) const fn new() -> Self {
        Self::starting_at(0, GenSeq::FIRST_SEQUENCE)
    }

    pub(crate) const fn starting_at(generation: u32, next_sequence: u32) -> Self {
        Self {
            generation,
            next_sequence,
        }
    }

    /// Returns whether the sequence space of the current generation is exhausted.
    pub(crate) fn needs_wrap(&self) -> bool {
        self.next_sequence == GenSeq::SENTINEL
    }

    /// Returns the stamp that retires the current generation.
    pub(crate) fn expiring(&self) -> GenSeq {
        GenSeq::new(self.generation, GenSeq::SENTINEL)
    }

    /// Moves to the next generation and returns it.
    ///
    /// The caller must have confirmed [`Self::expiring`] first.
    pub(crate) fn advance_generation(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.next_sequence = GenSeq::FIRST_SEQUENCE;
        self.generation
    }

    /// Allocates the next stamp.
    pub(crate) fn allocate(&mut self) -> GenSeq {
        debug_assert!(!self.needs_wrap());
        let stamp = GenSeq::new(self.generation, self.next_sequence);
        self.next_sequence += 1;
        stamp
    }

    /// Returns the last allocated stamp.
    pub(crate) fn last(&self) -> GenSeq {
        GenSeq::new(self.generation, self.next_sequence - 1)
    }
}

/// The high-water mark of stamps confirmed by the device.
///
/// Any context may refresh the mark from the completion marker; the mark
/// only ever moves forward, so concurrent refreshes cannot undo each other.
pub(crate) struct CompletionMark<W: DmaWord> {
    marker: W,
    marker_generation: AtomicU32,
    confirmed: AtomicU64,
}

impl<W: DmaWord> CompletionMark<W> {
    pub(crate) fn new(marker: W) -> Self {
        marker.store(0);
        Self {
            marker,
            marker_generation: AtomicU32::new(0),
            confirmed: AtomicU64::new(GenSeq::new(0, 0).to_bits()),
        }
    }

    /// Returns the physical address that wait descriptors write to.
    pub(crate) fn marker_paddr(&self) -> crate::hal::Paddr {
        self.marker.paddr()
    }

    /// Returns the confirmed high-water mark without reading the marker.
    pub(crate) fn confirmed(&self) -> GenSeq {
        GenSeq::from_bits(self.confirmed.load(Ordering::Acquire))
    }

    /// Folds the current marker value into the high-water mark.
    pub(crate) fn refresh(&self) -> GenSeq {
        // The generation must be loaded before the marker. A generation
        // change resets the marker first, so a new generation is never paired
        // with a marker value of an older one.
        let generation = self.marker_generation.load(Ordering::Acquire);
        let sequence = self.marker.load();
        let observed = GenSeq::new(generation, sequence).to_bits();
        let prev = self.confirmed.fetch_max(observed, Ordering::AcqRel);
        GenSeq::from_bits(prev.max(observed))
    }

    /// Returns whether the device has executed everything up to `stamp`.
    pub(crate) fn is_confirmed(&self, stamp: GenSeq) -> bool {
        stamp <= self.confirmed() || stamp <= self.refresh()
    }

    /// Starts accepting marker values of `generation`.
    ///
    /// The device must have completed every wait descriptor of the previous
    /// generation and no wait descriptor of `generation` may be visible yet.
    pub(crate) fn start_generation(&self, generation: u32) {
        self.marker.store(0);
        self.marker_generation.store(generation, Ordering::Release);
    }
}

impl<W: DmaWord> fmt::Debug for CompletionMark<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionMark")
            .field("marker_paddr", &self.marker.paddr())
            .field("confirmed", &self.confirmed())
            .finish()
    }
}
