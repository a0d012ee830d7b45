// SPDX-License-Identifier: MPL-2.0

#![no_main]

use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use arbitrary::Arbitrary;
use iommu_qi::{
    DESCRIPTOR_SIZE, Descriptor, DescriptorRing, DmaRegion, Paddr, QiRegisters, StallWatch,
};
use libfuzzer_sys::fuzz_target;

/// Queue memory that remembers every write.
struct Memory(Mutex<Vec<u8>>);

impl DmaRegion for Memory {
    fn paddr(&self) -> Paddr {
        0x10_0000
    }

    fn size(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        self.0.lock().unwrap()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// A device that consumes one published descriptor per head read.
struct Device {
    size: usize,
    head: AtomicUsize,
    published: AtomicUsize,
}

impl Device {
    fn consume(&self, nr: usize) {
        let head = self.head.load(Ordering::Relaxed);
        let published = self.published.load(Ordering::Relaxed);
        let pending = (published + self.size - head) % self.size / DESCRIPTOR_SIZE;
        let head = (head + nr.min(pending) * DESCRIPTOR_SIZE) % self.size;
        self.head.store(head, Ordering::Relaxed);
    }

    fn free_bytes(&self, tail: usize) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        (head + self.size - tail - DESCRIPTOR_SIZE) % self.size
    }
}

impl QiRegisters for Device {
    fn read_queue_head(&self) -> usize {
        self.consume(1);
        self.head.load(Ordering::Relaxed)
    }

    fn write_queue_tail(&self, tail: usize) {
        self.published.store(tail, Ordering::Relaxed);
    }

    fn set_queue_base(&self, _base: Paddr, _nr_pages: usize) {}
    fn enable_queue(&self) {}
    fn disable_queue(&self) {}
    fn is_completion_pending(&self) -> bool {
        false
    }
    fn ack_completion(&self) {}
    fn set_completion_interrupt_masked(&self, _masked: bool) {}
}

#[derive(Arbitrary, Debug)]
enum Op {
    Reserve(u8),
    Publish,
    Consume(u8),
}

#[derive(Arbitrary, Debug)]
struct Input {
    log2_slots: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let nr_slots = 1usize << (input.log2_slots % 8).max(1);
    let size = nr_slots * DESCRIPTOR_SIZE;
    let mut ring = DescriptorRing::new(Memory(Mutex::new(vec![0; size])));
    let device = Device {
        size,
        head: AtomicUsize::new(0),
        published: AtomicUsize::new(0),
    };
    let mut watch = StallWatch::new("fuzz", None);
    let mut id = 0u64;

    for op in input.ops {
        match op {
            Op::Reserve(nr) => {
                let nr = 1 + nr as usize % ring.capacity();
                ring.ensure_space(nr, &device, &mut watch);
                assert!(device.free_bytes(ring.tail()) >= nr * DESCRIPTOR_SIZE);
                for _ in 0..nr {
                    ring.emit(&Descriptor::from_raw(id, !id));
                    id += 1;
                    assert_eq!(ring.tail() % DESCRIPTOR_SIZE, 0);
                    assert!(ring.tail() < ring.size());
                    assert!(ring.free_bytes() <= device.free_bytes(ring.tail()));
                }
            }
            Op::Publish => ring.publish(&device),
            Op::Consume(nr) => device.consume(nr as usize),
        }
        assert!(ring.free_bytes() <= device.free_bytes(ring.tail()));
    }
});
