// SPDX-License-Identifier: MPL-2.0

//! Queued-invalidation registers of Intel VT-d.

mod status;

use core::{fmt, ptr::NonNull};

pub use status::{CompletionStatus, EventControl, GlobalCommand, GlobalStatus};
use volatile::{
    access::{ReadOnly, ReadWrite, WriteOnly},
    VolatilePtr,
};

use crate::{
    hal::{Paddr, QiRegisters},
    options::QiOptions,
    stats::StallWatch,
};

const GLOBAL_COMMAND: usize = 0x18;
const GLOBAL_STATUS: usize = 0x1C;
const QUEUE_HEAD: usize = 0x80;
const QUEUE_TAIL: usize = 0x88;
const QUEUE_ADDR: usize = 0x90;
const COMPLETION_STATUS: usize = 0x9C;
const EVENT_CONTROL: usize = 0xA0;

/// The queue head and tail registers hold byte offsets in bits 18:4.
const QUEUE_OFFSET_MASK: u64 = 0x7_fff0;
/// Queue Size, as the base-2 logarithm of the number of pages.
const QUEUE_SIZE_MASK: u64 = 0b111;

/// The registers of a VT-d remapping unit that drive queued invalidation.
pub struct VtdInvalidationRegisters {
    global_command: VolatilePtr<'static, u32, WriteOnly>,
    global_status: VolatilePtr<'static, u32, ReadOnly>,
    queue_head: VolatilePtr<'static, u64, ReadOnly>,
    queue_tail: VolatilePtr<'static, u64, ReadWrite>,
    queue_addr: VolatilePtr<'static, u64, ReadWrite>,
    completion_status: VolatilePtr<'static, u32, ReadWrite>,
    event_control: VolatilePtr<'static, u32, ReadWrite>,
    /// Serializes the read-modify-write sequences on the global command and
    /// the event control registers.
    update_lock: spin::Mutex<()>,
    stall_warn_spins: Option<u64>,
}

// SAFETY: The registers are MMIO locations that any CPU may access. Updates
// that span several accesses are serialized by `update_lock`.
unsafe impl Send for VtdInvalidationRegisters {}
// SAFETY: See above.
unsafe impl Sync for VtdInvalidationRegisters {}

impl VtdInvalidationRegisters {
    /// Creates an instance from the mapped register page of a remapping unit.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `base` points to the register page of a
    /// VT-d remapping unit, that the mapping lives forever, and that nothing
    /// else drives the queued-invalidation registers.
    pub unsafe fn new(base: NonNull<u8>) -> Self {
        // SAFETY: The caller guarantees that every offset below is a register
        // of the same page.
        unsafe {
            Self {
                global_command: VolatilePtr::new_restricted(
                    WriteOnly,
                    register(base, GLOBAL_COMMAND),
                ),
                global_status: VolatilePtr::new_read_only(register(base, GLOBAL_STATUS)),
                queue_head: VolatilePtr::new_read_only(register(base, QUEUE_HEAD)),
                queue_tail: VolatilePtr::new(register(base, QUEUE_TAIL)),
                queue_addr: VolatilePtr::new(register(base, QUEUE_ADDR)),
                completion_status: VolatilePtr::new(register(base, COMPLETION_STATUS)),
                event_control: VolatilePtr::new(register(base, EVENT_CONTROL)),
                update_lock: spin::Mutex::new(()),
                stall_warn_spins: Some(QiOptions::DEFAULT_STALL_WARN_SPINS),
            }
        }
    }

    /// Sets after how many unsuccessful polls of the enable status a warning
    /// is logged. Should match [`QiOptions::stall_warn_spins`] of the engine.
    pub fn stall_warn_spins(mut self, spins: Option<u64>) -> Self {
        self.stall_warn_spins = spins;
        self
    }

    /// Reads the global status.
    pub fn global_status(&self) -> GlobalStatus {
        GlobalStatus::from_bits_truncate(self.global_status.read())
    }

    /// Reads the invalidation event control.
    pub fn event_control(&self) -> EventControl {
        EventControl::from_bits_truncate(self.event_control.read())
    }

    /// Turns queued invalidation on or off and waits until the hardware agrees.
    fn set_queued_invalidation(&self, enable: bool) {
        let _guard = self.update_lock.lock();
        let mut command = GlobalCommand::persistent_from(self.global_status());
        command.set(GlobalCommand::QIE, enable);
        self.global_command.write(command.bits());

        let what = if enable { "queue enable" } else { "queue disable" };
        let mut watch = StallWatch::new(what, self.stall_warn_spins);
        while self.global_status().contains(GlobalStatus::QIES) != enable {
            watch.spin();
        }
    }
}

/// Returns a pointer to the register at `offset`.
///
/// # Safety
///
/// `base + offset` must stay within the register page.
unsafe fn register<T>(base: NonNull<u8>, offset: usize) -> NonNull<T> {
    // SAFETY: The caller guarantees that the offset is in bounds.
    unsafe { base.add(offset) }.cast()
}

impl QiRegisters for VtdInvalidationRegisters {
    fn read_queue_head(&self) -> usize {
        (self.queue_head.read() & QUEUE_OFFSET_MASK) as usize
    }

    fn write_queue_tail(&self, tail: usize) {
        self.queue_tail.write(tail as u64 & QUEUE_OFFSET_MASK);
    }

    fn set_queue_base(&self, base: Paddr, nr_pages: usize) {
        debug_assert!(nr_pages.is_power_of_two());
        let size = nr_pages.trailing_zeros() as u64 & QUEUE_SIZE_MASK;
        self.queue_addr.write(base as u64 | size);
    }

    fn enable_queue(&self) {
        self.set_queued_invalidation(true);
    }

    fn disable_queue(&self) {
        self.set_queued_invalidation(false);
    }

    fn is_completion_pending(&self) -> bool {
        CompletionStatus::from_bits_truncate(self.completion_status.read())
            .contains(CompletionStatus::IWC)
    }

    fn ack_completion(&self) {
        self.completion_status.write(CompletionStatus::IWC.bits());
    }

    fn set_completion_interrupt_masked(&self, masked: bool) {
        let _guard = self.update_lock.lock();
        let mut control = self.event_control() & EventControl::IM;
        control.set(EventControl::IM, masked);
        self.event_control.write(control.bits());
    }
}

impl fmt::Debug for VtdInvalidationRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VtdInvalidationRegisters")
            .field("global_status", &self.global_status())
            .field("queue_head", &self.read_queue_head())
            .field("queue_tail", &self.queue_tail.read())
            .field("event_control", &self.event_control())
            .finish_non_exhaustive()
    }
}
