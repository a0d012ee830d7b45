// SPDX-License-Identifier: MPL-2.0

//! The queued-invalidation (QI) engine of IOMMU drivers.
//!
//! Invalidation commands are submitted to the IOMMU through a circular
//! command queue that lives in DMA-visible memory. The device consumes the
//! queue on its own; software learns how far it got through *invalidation
//! wait descriptors*, which make the device write a sequence number to a
//! completion marker in memory (and optionally raise an interrupt) once
//! every earlier command has executed.
//!
//! This crate implements the software side of that protocol:
//!
//! - [`DescriptorRing`] manages the producer side of the command queue;
//! - [`GenSeq`] stamps order submissions and survive 32-bit wraparound;
//! - the reclaim ledger defers the release of resources (e.g., freed I/O
//!   virtual address ranges) until the device can no longer reach them;
//! - [`InvalidationQueue`] ties everything together behind one lock and
//!   exposes submission, synchronous waiting, the interrupt bottom half,
//!   and the enable/quiesce lifecycle.
//!
//! The hardware and the host kernel are reached through the traits in
//! [`hal`]. [`registers::VtdInvalidationRegisters`] implements the register
//! side for Intel VT-d.
//!
//! # Example
//!
//! ```ignore
//! let queue = InvalidationQueue::<MyPlatform>::new(
//!     registers,
//!     wait_queue,
//!     &allocator,
//!     QiOptions::new(1),
//! )?;
//! queue.enable()?;
//!
//! // Unmap a range and free its IOVA space once the IOTLB forgot it.
//! let commands: Vec<_> = PageRangeSplitter::new(domain, base, size, max_am).collect();
//! queue.submit_invalidate(&commands, Some(iova_range))?;
//!
//! // Tear down a context entry only after the device dropped its cache.
//! queue.invalidate_sync(&[Descriptor::context_cache_global()], WaitMode::Sleep)?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod descriptor;
mod engine;
mod genseq;
pub mod hal;
mod ledger;
mod options;
mod queue;
pub mod registers;
mod stats;
mod waiter;

#[cfg(test)]
mod sim;

pub use descriptor::{Descriptor, DescriptorType, PageRangeSplitter, WaitFlags, DESCRIPTOR_SIZE};
pub use engine::{InvalidationQueue, QiState};
pub use genseq::GenSeq;
pub use hal::{
    CompletionWaitQueue, DeferredRelease, DmaAllocator, DmaRegion, DmaWord, Paddr, QiPlatform,
    QiRegisters,
};
pub use options::QiOptions;
pub use queue::DescriptorRing;
pub use stats::{QiStats, StallWatch};
pub use waiter::WaitMode;

/// An enumeration representing possible errors of the queued-invalidation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QiError {
    /// The queue size is not a power-of-two number of pages within the hardware limit.
    InvalidQueueSize,
    /// The DMA memory of the command queue cannot be allocated.
    RingAllocFailed,
    /// The DMA word that receives completion markers cannot be allocated.
    MarkerAllocFailed,
    /// The operation is not allowed in the current lifecycle state.
    InvalidState,
    /// A single batch needs more descriptors than the queue can ever hold.
    TooManyDescriptors,
}

/// The result type of the queued-invalidation engine.
pub type Result<T> = core::result::Result<T, QiError>;
