// SPDX-License-Identifier: MPL-2.0

//! The interfaces that the engine consumes from the rest of the kernel.
//!
//! The engine does not know how registers are mapped, where DMA memory comes
//! from, or how the host kernel puts a thread to sleep. An embedding driver
//! provides those through the traits below and groups them in a
//! [`QiPlatform`].

use core::time::Duration;

/// A physical address.
pub type Paddr = usize;

/// The registers of an IOMMU that drive queued invalidation.
///
/// All accesses are simple synchronous MMIO reads and writes.
pub trait QiRegisters: Send + Sync {
    /// Reads the byte offset of the next descriptor that the device will fetch.
    fn read_queue_head(&self) -> usize;

    /// Writes the byte offset one past the last valid descriptor.
    ///
    /// The device may start fetching descriptors as soon as this returns.
    fn write_queue_tail(&self, tail: usize);

    /// Programs the physical base address and the size (in pages) of the queue.
    fn set_queue_base(&self, base: Paddr, nr_pages: usize);

    /// Starts the device consuming the queue.
    fn enable_queue(&self);

    /// Stops the device consuming the queue.
    fn disable_queue(&self);

    /// Returns whether a wait descriptor with the interrupt flag has completed
    /// since the last acknowledgement.
    fn is_completion_pending(&self) -> bool;

    /// Clears the pending completion status.
    fn ack_completion(&self);

    /// Masks or unmasks the completion interrupt.
    fn set_completion_interrupt_masked(&self, masked: bool);
}

/// A physically contiguous, device-visible memory region.
pub trait DmaRegion: Send + Sync {
    /// Returns the physical address of the region.
    fn paddr(&self) -> Paddr;

    /// Returns the size of the region in bytes.
    fn size(&self) -> usize;

    /// Writes `bytes` at `offset`.
    ///
    /// The caller guarantees that `offset + bytes.len()` does not exceed the region.
    fn write_bytes(&self, offset: usize, bytes: &[u8]);
}

/// A naturally aligned 32-bit word in device-visible memory.
pub trait DmaWord: Send + Sync {
    /// Returns the physical address of the word.
    fn paddr(&self) -> Paddr;

    /// Loads the word with acquire semantics.
    ///
    /// Once the device has written a value, everything the device did before
    /// the write is visible to the caller.
    fn load(&self) -> u32;

    /// Stores the word with release semantics.
    fn store(&self, val: u32);
}

/// The allocator of device-visible memory.
pub trait DmaAllocator {
    /// The type of the queue memory.
    type Region: DmaRegion;
    /// The type of the completion marker.
    type Word: DmaWord;

    /// Allocates `nr_pages` physically contiguous, naturally aligned and zeroed pages.
    fn alloc_queue(&self, nr_pages: usize) -> Option<Self::Region>;

    /// Allocates one aligned word that receives completion markers.
    fn alloc_marker(&self) -> Option<Self::Word>;
}

/// A condition variable of the host kernel.
///
/// Implementations must check `cond` while holding the lock that
/// [`wake_all`](Self::wake_all) also takes, so that a wakeup issued after the
/// condition became true is never lost.
pub trait CompletionWaitQueue: Send + Sync {
    /// Puts the current thread to sleep until `cond` returns `true`, a wakeup
    /// arrives, or `timeout` elapses. Returns the last value of `cond`.
    fn wait_until(&self, cond: &mut dyn FnMut() -> bool, timeout: Duration) -> bool;

    /// Wakes up all sleeping threads.
    fn wake_all(&self);
}

/// A resource whose release has to wait until the device can no longer reach it.
///
/// A typical implementor is an I/O virtual address range whose mappings have
/// been removed but which may still be cached in the IOTLB.
pub trait DeferredRelease: Send {
    /// Releases the resource.
    ///
    /// This is called from the completion bottom half and must not block.
    fn release(self);
}

/// The collaborators of one [`InvalidationQueue`](crate::InvalidationQueue).
pub trait QiPlatform: 'static {
    /// The register interface.
    type Registers: QiRegisters;
    /// The queue memory.
    type Region: DmaRegion;
    /// The completion marker.
    type Word: DmaWord;
    /// The condition variable used by sleeping waiters.
    type WaitQueue: CompletionWaitQueue;
    /// The resources whose release is deferred.
    type Payload: DeferredRelease;
}
