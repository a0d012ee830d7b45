// SPDX-License-Identifier: MPL-2.0

//! Invalidation descriptors.
//!
//! Every descriptor is 128 bits wide. The lowest four bits of the low
//! quadword select the descriptor type; the remaining bits depend on it.

mod range;

use core::{fmt::Debug, mem::size_of};

use bit_field::BitField;
use bitflags::bitflags;
use int_to_c_enum::{TryFromInt, TryFromIntError};
pub use range::PageRangeSplitter;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::hal::Paddr;

/// The size of a descriptor in bytes.
pub const DESCRIPTOR_SIZE: usize = size_of::<Descriptor>();

/// The types of invalidation descriptors that the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromInt)]
#[repr(u8)]
pub enum DescriptorType {
    ContextCache = 0x1,
    Iotlb = 0x2,
    DeviceIotlb = 0x3,
    InterruptEntryCache = 0x4,
    InvalidationWait = 0x5,
}

bitflags! {
    /// The flags of an invalidation wait descriptor.
    pub struct WaitFlags: u64 {
        /// Interrupt Flag. Raises a completion interrupt once the descriptor completes.
        const INTERRUPT =       1 << 4;
        /// Status Write. Writes the status data to the status address once the
        /// descriptor completes.
        const STATUS_WRITE =    1 << 5;
        /// Fence Flag. Later descriptors are not fetched until this one completes.
        const FENCE =           1 << 6;
    }
}

/// An invalidation descriptor, as laid out in the command queue.
#[derive(Clone, Copy, PartialEq, Eq, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Descriptor {
    lo: u64,
    hi: u64,
}

impl Descriptor {
    const TYPE_BITS: core::ops::Range<usize> = 0..4;
    const GRANULARITY_BITS: core::ops::Range<usize> = 4..6;
    /// The 5-bit Index Mask of index-selective interrupt entry cache invalidation.
    const INDEX_MASK_BITS: core::ops::Range<usize> = 27..32;
    const DOMAIN_ID_BITS: core::ops::Range<usize> = 16..32;

    /// Creates a descriptor from its raw quadwords.
    pub const fn from_raw(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    /// Returns the low quadword.
    pub const fn lo(&self) -> u64 {
        self.lo
    }

    /// Returns the high quadword.
    pub const fn hi(&self) -> u64 {
        self.hi
    }

    /// Decodes the descriptor type.
    pub fn descriptor_type(&self) -> Result<DescriptorType, TryFromIntError> {
        DescriptorType::try_from(self.lo.get_bits(Self::TYPE_BITS) as u8)
    }

    /// Creates an invalidation wait descriptor.
    ///
    /// When the device reaches the descriptor, every descriptor before it has
    /// completed. With [`WaitFlags::STATUS_WRITE`], the device then writes
    /// `status_data` to the 32-bit word at `status_addr`.
    pub fn invalidation_wait(flags: WaitFlags, status_data: u32, status_addr: Paddr) -> Self {
        let mut lo = DescriptorType::InvalidationWait as u64 | flags.bits();
        let mut hi = 0;
        if flags.contains(WaitFlags::STATUS_WRITE) {
            lo.set_bits(32..64, status_data as u64);
            hi = status_addr as u64 & !0b11;
        }
        Self { lo, hi }
    }

    /// Returns the flags of an invalidation wait descriptor.
    pub fn wait_flags(&self) -> WaitFlags {
        WaitFlags::from_bits_truncate(self.lo)
    }

    /// Returns the status data of an invalidation wait descriptor.
    pub fn wait_status_data(&self) -> u32 {
        self.lo.get_bits(32..64) as u32
    }

    /// Returns the status address of an invalidation wait descriptor.
    pub fn wait_status_addr(&self) -> Paddr {
        (self.hi & !0b11) as Paddr
    }

    /// Invalidates all context-cache entries.
    pub fn context_cache_global() -> Self {
        Self::with_granularity(DescriptorType::ContextCache, 0b01)
    }

    /// Invalidates all IOTLB entries.
    pub fn iotlb_global() -> Self {
        Self::iotlb(0b01).drain()
    }

    /// Invalidates the IOTLB entries of a domain.
    pub fn iotlb_domain(domain_id: u16) -> Self {
        let mut desc = Self::iotlb(0b10).drain();
        desc.lo.set_bits(Self::DOMAIN_ID_BITS, domain_id as u64);
        desc
    }

    /// Invalidates the IOTLB entries of a domain that translate the
    /// `2^address_mask` pages starting at `addr`.
    ///
    /// `addr` must be aligned to the size of the block. With `leaf_only`, the
    /// device may keep cached non-leaf paging entries.
    pub fn iotlb_page(domain_id: u16, addr: u64, address_mask: u8, leaf_only: bool) -> Self {
        debug_assert!(address_mask < 64 - 12);
        debug_assert_eq!(addr & ((1u64 << (address_mask + 12)) - 1), 0);

        let mut desc = Self::iotlb(0b11).drain();
        desc.lo.set_bits(Self::DOMAIN_ID_BITS, domain_id as u64);
        desc.hi = addr & !0xfff;
        desc.hi.set_bits(0..6, address_mask as u64);
        desc.hi.set_bit(6, leaf_only);
        desc
    }

    /// Returns the address mask of a page-selective IOTLB descriptor.
    pub fn iotlb_address_mask(&self) -> u8 {
        self.hi.get_bits(0..6) as u8
    }

    /// Returns the address of a page-selective IOTLB descriptor.
    pub fn iotlb_addr(&self) -> u64 {
        self.hi & !0xfff
    }

    /// Returns the domain ID of a domain- or page-selective descriptor.
    pub fn domain_id(&self) -> u16 {
        self.lo.get_bits(Self::DOMAIN_ID_BITS) as u16
    }

    /// Invalidates all interrupt entry cache entries.
    pub fn iec_global() -> Self {
        Self::from_raw(DescriptorType::InterruptEntryCache as u64, 0)
    }

    /// Invalidates the `2^index_mask` interrupt entry cache entries starting at `index`.
    pub fn iec_index(index: u16, index_mask: u8) -> Self {
        debug_assert!(index_mask < 32);

        let mut lo = DescriptorType::InterruptEntryCache as u64;
        lo.set_bit(4, true);
        lo.set_bits(Self::INDEX_MASK_BITS, index_mask as u64 & 0x1f);
        lo.set_bits(32..48, index as u64);
        Self::from_raw(lo, 0)
    }

    fn iotlb(granularity: u64) -> Self {
        Self::with_granularity(DescriptorType::Iotlb, granularity)
    }

    fn with_granularity(ty: DescriptorType, granularity: u64) -> Self {
        let mut lo = ty as u64;
        lo.set_bits(Self::GRANULARITY_BITS, granularity);
        Self::from_raw(lo, 0)
    }

    /// Sets Drain Reads and Drain Writes, so that in-flight DMA using the old
    /// translations finishes before the descriptor completes.
    fn drain(mut self) -> Self {
        self.lo.set_bit(6, true);
        self.lo.set_bit(7, true);
        self
    }
}

impl Debug for Descriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Descriptor")
            .field("type", &self.descriptor_type().ok())
            .field("lo", &format_args!("{:#018x}", self.lo))
            .field("hi", &format_args!("{:#018x}", self.hi))
            .finish()
    }
}
