// SPDX-License-Identifier: MPL-2.0

//! A simulated IOMMU for hosted tests.
//!
//! The device executes published descriptors strictly in order. It can run
//! on its own thread, run synchronously inside every tail write ("eager"),
//! or only move when a test calls [`SimDevice::step`].

use std::{
    boxed::Box,
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        mpsc, Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
    vec::Vec,
};

use zerocopy::FromBytes;

use crate::{
    descriptor::{Descriptor, DescriptorType, WaitFlags, DESCRIPTOR_SIZE},
    engine::InvalidationQueue,
    hal::{
        CompletionWaitQueue, DeferredRelease, DmaAllocator, DmaRegion, DmaWord, Paddr,
        QiPlatform, QiRegisters,
    },
    options::QiOptions,
};

pub(crate) const PAGE_SIZE: usize = 4096;
pub(crate) const RING_PADDR: Paddr = 0x10_0000;
pub(crate) const MARKER_PADDR: Paddr = 0x20_0000;

/// Shared memory standing in for a DMA region.
#[derive(Debug, Clone)]
pub(crate) struct SimRegion {
    paddr: Paddr,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SimRegion {
    pub(crate) fn new(paddr: Paddr, size: usize) -> Self {
        Self {
            paddr,
            bytes: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    pub(crate) fn read_descriptor(&self, offset: usize) -> Descriptor {
        let bytes = self.bytes.lock().unwrap();
        Descriptor::read_from_bytes(&bytes[offset..offset + DESCRIPTOR_SIZE]).unwrap()
    }
}

impl DmaRegion for SimRegion {
    fn paddr(&self) -> Paddr {
        self.paddr
    }

    fn size(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        self.bytes.lock().unwrap()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// A completion marker shared between the engine and the device.
#[derive(Debug, Clone)]
pub(crate) struct SimWord {
    paddr: Paddr,
    word: Arc<AtomicU32>,
}

impl SimWord {
    pub(crate) fn new(paddr: Paddr) -> Self {
        Self {
            paddr,
            word: Arc::new(AtomicU32::new(0)),
        }
    }

    pub(crate) fn device_write(&self, val: u32) {
        self.word.store(val, Ordering::Release);
    }
}

impl DmaWord for SimWord {
    fn paddr(&self) -> Paddr {
        self.paddr
    }

    fn load(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    fn store(&self, val: u32) {
        self.word.store(val, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    ring: Option<SimRegion>,
    marker: Option<SimWord>,
    base: Option<(Paddr, usize)>,
    head: usize,
    tail: usize,
    enabled: bool,
    eager: bool,
    paused: bool,
    stopped: bool,
    /// Invalidation Wait Descriptor Complete.
    pending: bool,
    masked: bool,
    /// Interrupt Pending, for a completion raised while masked.
    deferred_irq: bool,
    executed: Vec<Descriptor>,
    irq: Option<mpsc::Sender<()>>,
}

impl DeviceState {
    fn has_work(&self) -> bool {
        self.enabled && self.head != self.tail
    }

    /// Executes up to `max` published descriptors in order.
    fn execute(&mut self, max: usize) -> usize {
        let mut nr_executed = 0;
        while nr_executed < max && self.has_work() {
            let ring = self.ring.as_ref().expect("the device runs without a queue");
            let descriptor = ring.read_descriptor(self.head);
            self.head = (self.head + DESCRIPTOR_SIZE) % ring.size();

            if let Ok(DescriptorType::InvalidationWait) = descriptor.descriptor_type() {
                self.complete_wait(&descriptor);
            }
            self.executed.push(descriptor);
            nr_executed += 1;
        }
        nr_executed
    }

    fn complete_wait(&mut self, descriptor: &Descriptor) {
        let flags = descriptor.wait_flags();
        if flags.contains(WaitFlags::STATUS_WRITE) {
            let marker = self.marker.as_ref().expect("no completion marker");
            assert_eq!(descriptor.wait_status_addr(), marker.paddr());
            marker.device_write(descriptor.wait_status_data());
        }
        if flags.contains(WaitFlags::INTERRUPT) && !self.pending {
            self.pending = true;
            if self.masked {
                self.deferred_irq = true;
            } else {
                self.raise();
            }
        }
    }

    fn raise(&self) {
        if let Some(irq) = &self.irq {
            let _ = irq.send(());
        }
    }
}

/// A callback that runs once.
pub(crate) type OneShot = Box<dyn FnOnce() + Send>;

/// The simulated IOMMU.
pub(crate) struct SimDevice {
    state: Mutex<DeviceState>,
    kick: Condvar,
    /// Runs at the next read of the completion status, before the read.
    on_pending_read: Mutex<Option<OneShot>>,
}

impl SimDevice {
    pub(crate) fn new(eager: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DeviceState {
                eager,
                masked: true,
                ..DeviceState::default()
            }),
            kick: Condvar::new(),
            on_pending_read: Mutex::new(None),
        })
    }

    /// Runs `hook` when the completion status is read next.
    ///
    /// The hook runs without any device lock held, so it may submit to the
    /// engine and step the device.
    pub(crate) fn before_next_pending_read(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_pending_read.lock().unwrap() = Some(Box::new(hook));
    }

    /// Returns the Invalidation Wait Descriptor Complete status.
    pub(crate) fn is_pending(&self) -> bool {
        self.state.lock().unwrap().pending
    }

    /// Executes up to `max` published descriptors, even while paused.
    pub(crate) fn step(&self, max: usize) -> usize {
        self.state.lock().unwrap().execute(max)
    }

    /// Freezes the head until [`Self::resume`].
    pub(crate) fn pause(&self) {
        self.state.lock().unwrap().paused = true;
    }

    pub(crate) fn resume(&self) {
        self.state.lock().unwrap().paused = false;
        self.kick.notify_all();
    }

    /// Returns the number of published descriptors not executed yet.
    pub(crate) fn outstanding(&self) -> usize {
        let state = self.state.lock().unwrap();
        let size = state.ring.as_ref().map_or(1, DmaRegion::size);
        (state.tail + size - state.head) % size / DESCRIPTOR_SIZE
    }

    pub(crate) fn executed(&self) -> Vec<Descriptor> {
        self.state.lock().unwrap().executed.clone()
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    pub(crate) fn is_masked(&self) -> bool {
        self.state.lock().unwrap().masked
    }

    pub(crate) fn queue_base(&self) -> Option<(Paddr, usize)> {
        self.state.lock().unwrap().base
    }

    /// Runs the device on its own thread until [`Self::stop`].
    pub(crate) fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let device = self.clone();
        thread::spawn(move || {
            let mut state = device.state.lock().unwrap();
            while !state.stopped {
                if !state.paused && state.execute(8) > 0 {
                    drop(state);
                    thread::yield_now();
                    state = device.state.lock().unwrap();
                    continue;
                }
                state = device
                    .kick
                    .wait_timeout(state, Duration::from_millis(1))
                    .unwrap()
                    .0;
            }
        })
    }

    /// Delivers completion interrupts to `handler` on a separate thread.
    pub(crate) fn connect_interrupt(&self, handler: impl Fn() + Send + 'static) -> JoinHandle<()> {
        let (sender, receiver) = mpsc::channel();
        self.state.lock().unwrap().irq = Some(sender);
        thread::spawn(move || {
            for () in receiver {
                handler();
            }
        })
    }

    pub(crate) fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        state.irq = None;
        drop(state);
        self.kick.notify_all();
    }
}

/// The register interface of a [`SimDevice`].
#[derive(Debug)]
pub(crate) struct SimRegisters(Arc<SimDevice>);

impl fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimDevice")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl QiRegisters for SimRegisters {
    fn read_queue_head(&self) -> usize {
        self.0.state.lock().unwrap().head
    }

    fn write_queue_tail(&self, tail: usize) {
        let mut state = self.0.state.lock().unwrap();
        state.tail = tail;
        if state.eager {
            state.execute(usize::MAX);
        }
        drop(state);
        self.0.kick.notify_all();
    }

    fn set_queue_base(&self, base: Paddr, nr_pages: usize) {
        self.0.state.lock().unwrap().base = Some((base, nr_pages));
    }

    fn enable_queue(&self) {
        self.0.state.lock().unwrap().enabled = true;
        self.0.kick.notify_all();
    }

    fn disable_queue(&self) {
        let mut state = self.0.state.lock().unwrap();
        state.enabled = false;
        state.head = 0;
        state.tail = 0;
    }

    fn is_completion_pending(&self) -> bool {
        let hook = self.0.on_pending_read.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        self.0.is_pending()
    }

    fn ack_completion(&self) {
        self.0.state.lock().unwrap().pending = false;
    }

    fn set_completion_interrupt_masked(&self, masked: bool) {
        let mut state = self.0.state.lock().unwrap();
        state.masked = masked;
        if !masked && state.deferred_irq {
            state.deferred_irq = false;
            state.raise();
        }
    }
}

/// A condition variable that counts how often it puts threads to sleep.
#[derive(Debug, Default)]
pub(crate) struct SimWaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
    sleeps: AtomicUsize,
    wakeups: AtomicUsize,
}

impl SimWaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }

    pub(crate) fn wakeups(&self) -> usize {
        self.wakeups.load(Ordering::SeqCst)
    }
}

impl CompletionWaitQueue for SimWaitQueue {
    fn wait_until(&self, cond: &mut dyn FnMut() -> bool, timeout: Duration) -> bool {
        let guard = self.lock.lock().unwrap();
        if cond() {
            return true;
        }
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        let (_guard, _) = self.cond.wait_timeout(guard, timeout).unwrap();
        cond()
    }

    fn wake_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.wakeups.fetch_add(1, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

/// Hands out DMA memory that the device can see.
#[derive(Debug)]
pub(crate) struct SimAllocator {
    device: Arc<SimDevice>,
    pub(crate) ring_bytes: Option<usize>,
    pub(crate) fail_queue: bool,
    pub(crate) fail_marker: bool,
}

impl SimAllocator {
    pub(crate) fn new(device: Arc<SimDevice>) -> Self {
        Self {
            device,
            ring_bytes: None,
            fail_queue: false,
            fail_marker: false,
        }
    }
}

impl DmaAllocator for SimAllocator {
    type Region = SimRegion;
    type Word = SimWord;

    fn alloc_queue(&self, nr_pages: usize) -> Option<SimRegion> {
        if self.fail_queue {
            return None;
        }
        let size = self.ring_bytes.unwrap_or(nr_pages * PAGE_SIZE);
        let region = SimRegion::new(RING_PADDR, size);
        self.device.state.lock().unwrap().ring = Some(region.clone());
        Some(region)
    }

    fn alloc_marker(&self) -> Option<SimWord> {
        if self.fail_marker {
            return None;
        }
        let marker = SimWord::new(MARKER_PADDR);
        self.device.state.lock().unwrap().marker = Some(marker.clone());
        Some(marker)
    }
}

/// A record that logs its id when released.
pub(crate) struct TestPayload {
    id: u32,
    released: Arc<Mutex<Vec<u32>>>,
    on_release: Option<OneShot>,
}

impl TestPayload {
    /// Runs `hook` inside the release.
    pub(crate) fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }
}

impl DeferredRelease for TestPayload {
    fn release(self) {
        if let Some(hook) = self.on_release {
            hook();
        }
        self.released.lock().unwrap().push(self.id);
    }
}

impl fmt::Debug for TestPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestPayload")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct SimPlatform;

impl QiPlatform for SimPlatform {
    type Registers = SimRegisters;
    type Region = SimRegion;
    type Word = SimWord;
    type WaitQueue = SimWaitQueue;
    type Payload = TestPayload;
}

/// How the device of a [`SimHarness`] makes progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceMode {
    /// Only through [`SimDevice::step`]. Completion interrupts are not delivered.
    Manual,
    /// Inside every tail write. Completion interrupts are not delivered.
    Eager,
    /// On a device thread, with a bottom-half thread taking interrupts.
    Threaded,
}

/// An enabled engine wired to a simulated device.
pub(crate) struct SimHarness {
    pub(crate) queue: Arc<InvalidationQueue<SimPlatform>>,
    pub(crate) device: Arc<SimDevice>,
    released: Arc<Mutex<Vec<u32>>>,
    threads: Vec<JoinHandle<()>>,
}

impl SimHarness {
    pub(crate) fn new(mode: DeviceMode) -> Self {
        Self::build(mode, None)
    }

    /// Uses a queue of `nr_slots` descriptors instead of a full page.
    pub(crate) fn with_slots(mode: DeviceMode, nr_slots: usize) -> Self {
        Self::build(mode, Some(nr_slots * DESCRIPTOR_SIZE))
    }

    fn build(mode: DeviceMode, ring_bytes: Option<usize>) -> Self {
        let device = SimDevice::new(mode == DeviceMode::Eager);
        let mut allocator = SimAllocator::new(device.clone());
        allocator.ring_bytes = ring_bytes;

        let queue = InvalidationQueue::new(
            SimRegisters(device.clone()),
            SimWaitQueue::new(),
            &allocator,
            test_options(),
        )
        .unwrap();
        queue.enable().unwrap();
        let queue = Arc::new(queue);

        let mut threads = Vec::new();
        if mode == DeviceMode::Threaded {
            threads.push(device.spawn());
            let weak = Arc::downgrade(&queue);
            threads.push(device.connect_interrupt(move || {
                if let Some(queue) = weak.upgrade() {
                    queue.handle_completion_interrupt();
                }
            }));
        }

        Self {
            queue,
            device,
            released: Arc::new(Mutex::new(Vec::new())),
            threads,
        }
    }

    pub(crate) fn payload(&self, id: u32) -> TestPayload {
        TestPayload {
            id,
            released: self.released.clone(),
            on_release: None,
        }
    }

    pub(crate) fn released(&self) -> Vec<u32> {
        self.released.lock().unwrap().clone()
    }
}

impl Drop for SimHarness {
    fn drop(&mut self) {
        self.device.stop();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

pub(crate) fn test_options() -> QiOptions {
    QiOptions::new(1).recheck_period(Duration::from_millis(20))
}

/// Builds a [`SimRegisters`] for a device, for tests that wire the engine by hand.
pub(crate) fn registers(device: &Arc<SimDevice>) -> SimRegisters {
    SimRegisters(device.clone())
}
