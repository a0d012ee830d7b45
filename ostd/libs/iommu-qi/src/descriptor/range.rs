// SPDX-License-Identifier: MPL-2.0

use super::Descriptor;

const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Splits an I/O virtual address range into page-selective IOTLB descriptors.
///
/// Each descriptor covers the largest naturally aligned power-of-two block of
/// pages that starts at the current address, fits in the remaining range and
/// does not exceed the hardware's maximum address mask.
///
/// # Example
///
/// ```
/// use iommu_qi::PageRangeSplitter;
///
/// // 0x1000..0x6000 = [0x1000] + [0x2000, 0x4000) + [0x4000, 0x6000)
/// let masks: Vec<u8> = PageRangeSplitter::new(1, 0x1000, 0x5000, 6)
///     .map(|desc| desc.iotlb_address_mask())
///     .collect();
/// assert_eq!(masks, [0, 1, 1]);
/// ```
#[derive(Debug, Clone)]
pub struct PageRangeSplitter {
    domain_id: u16,
    cursor: u64,
    end: u64,
    max_address_mask: u8,
}

impl PageRangeSplitter {
    /// Creates a splitter for `[base, base + size)` in the domain `domain_id`.
    ///
    /// The range is widened to page boundaries. `max_address_mask` is the
    /// largest address mask the hardware supports.
    pub fn new(domain_id: u16, base: u64, size: u64, max_address_mask: u8) -> Self {
        let end = base.saturating_add(size).saturating_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        Self {
            domain_id,
            cursor: base & !(PAGE_SIZE - 1),
            end,
            max_address_mask: max_address_mask.min(63 - PAGE_SHIFT as u8),
        }
    }

    fn next_address_mask(&self) -> u8 {
        let remaining = self.end - self.cursor;
        let mut mask = self.max_address_mask;
        loop {
            let block = 1u64 << (mask as u32 + PAGE_SHIFT);
            if mask == 0 || (self.cursor & (block - 1) == 0 && remaining >= block) {
                return mask;
            }
            mask -= 1;
        }
    }
}

impl Iterator for PageRangeSplitter {
    type Item = Descriptor;

    fn next(&mut self) -> Option<Descriptor> {
        if self.cursor >= self.end {
            return None;
        }

        let mask = self.next_address_mask();
        let desc = Descriptor::iotlb_page(self.domain_id, self.cursor, mask, false);
        self.cursor = self.cursor.saturating_add(1u64 << (mask as u32 + PAGE_SHIFT));
        Some(desc)
    }
}
