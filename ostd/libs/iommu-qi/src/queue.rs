// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{fence, Ordering};

use zerocopy::IntoBytes;

use crate::{
    descriptor::{Descriptor, DESCRIPTOR_SIZE},
    hal::{DmaRegion, Paddr, QiRegisters},
    stats::StallWatch,
};

/// The producer side of the invalidation command queue.
///
/// The queue is a power-of-two sized ring of [`Descriptor`]s shared with the
/// device. Software owns `tail`, the device owns `head`; the ring is empty
/// when they are equal, so one slot always stays unused.
///
/// All offsets are in bytes. Wraparound is computed in one place, `wrap`.
#[derive(Debug)]
pub struct DescriptorRing<R: DmaRegion> {
    region: R,
    size: usize,
    tail: usize,
    /// A lower bound of the free bytes, refreshed from the head register.
    free_bytes: usize,
}

impl<R: DmaRegion> DescriptorRing<R> {
    /// Creates an empty ring over `region`.
    ///
    /// # Panics
    ///
    /// Panics if the size of `region` is not a power of two that holds at
    /// least two descriptors.
    pub fn new(region: R) -> Self {
        let size = region.size();
        assert!(
            size.is_power_of_two() && size >= 2 * DESCRIPTOR_SIZE,
            "the queue size must be a power of two of at least two descriptors"
        );
        Self {
            region,
            size,
            tail: 0,
            free_bytes: size - DESCRIPTOR_SIZE,
        }
    }

    /// Returns the size of the ring in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of descriptors that can be outstanding at once.
    pub fn capacity(&self) -> usize {
        self.size / DESCRIPTOR_SIZE - 1
    }

    /// Returns the byte offset of the next free slot.
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Returns the cached lower bound of free bytes.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Returns the physical address of the ring.
    pub fn base_paddr(&self) -> Paddr {
        self.region.paddr()
    }

    /// Forgets every descriptor and moves the tail back to the start.
    ///
    /// Only valid while the device does not consume the ring.
    pub fn reset(&mut self) {
        self.tail = 0;
        self.free_bytes = self.size - DESCRIPTOR_SIZE;
    }

    /// Guarantees room for `nr_descriptors` descriptors.
    ///
    /// If the cached free space is too small, the head register is read
    /// again. If the ring is really full, the tail is published first (so the
    /// descriptors written so far do not stall behind the caller) and the
    /// head is polled until the device makes room. This never sleeps.
    ///
    /// `nr_descriptors` must not exceed [`Self::capacity`].
    pub fn ensure_space(
        &mut self,
        nr_descriptors: usize,
        regs: &impl QiRegisters,
        watch: &mut StallWatch,
    ) {
        debug_assert!(nr_descriptors <= self.capacity());
        let bytes = nr_descriptors * DESCRIPTOR_SIZE;
        while self.free_bytes < bytes {
            self.refresh_free_bytes(regs.read_queue_head());
            if self.free_bytes >= bytes {
                break;
            }

            self.publish(regs);
            watch.spin();
        }
    }

    /// Writes one descriptor at the tail.
    ///
    /// Must follow an [`ensure_space`](Self::ensure_space) that covers it.
    pub fn emit(&mut self, descriptor: &Descriptor) {
        debug_assert!(self.free_bytes >= DESCRIPTOR_SIZE);
        self.region.write_bytes(self.tail, descriptor.as_bytes());
        self.tail = self.wrap(self.tail + DESCRIPTOR_SIZE);
        self.free_bytes -= DESCRIPTOR_SIZE;
    }

    /// Makes every descriptor up to the tail visible to the device.
    pub fn publish(&self, regs: &impl QiRegisters) {
        // The descriptors must reach memory before the device can see the new tail.
        fence(Ordering::Release);
        regs.write_queue_tail(self.tail);
    }

    fn refresh_free_bytes(&mut self, head: usize) {
        let head = self.wrap(head) & !(DESCRIPTOR_SIZE - 1);
        self.free_bytes = self.wrap(head.wrapping_sub(self.tail).wrapping_sub(DESCRIPTOR_SIZE));
    }

    fn wrap(&self, offset: usize) -> usize {
        offset & (self.size - 1)
    }
}
