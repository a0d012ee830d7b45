// SPDX-License-Identifier: MPL-2.0

use core::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use log::{debug, info, trace, warn};
use spin::Mutex;

use crate::{
    descriptor::{Descriptor, WaitFlags},
    genseq::{CompletionMark, GenSeq, Sequencer},
    hal::{CompletionWaitQueue, DeferredRelease, DmaAllocator, QiPlatform, QiRegisters},
    ledger::{DrainBatch, ReclaimLedger, ReclaimRecord},
    options::QiOptions,
    queue::DescriptorRing,
    stats::{QiCounters, QiStats, StallWatch},
    waiter::{self, WaitMode, WaiterTicket},
    QiError, Result,
};

/// The lifecycle state of an [`InvalidationQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QiState {
    /// The device does not consume the queue.
    Disabled,
    /// The queue is being handed over to the device.
    Enabling,
    /// The queue accepts submissions.
    Enabled,
    /// The completion bottom half is running. Submissions are still accepted.
    Draining,
    /// The final wait descriptor is outstanding. Submissions are refused.
    Quiescing,
}

/// The queued-invalidation engine of one IOMMU.
///
/// The engine owns the command queue, the completion sequencer, and the
/// reclaim ledger, all behind a single lock. The device consumes the queue
/// on its own and reports progress only through the completion marker, which
/// is read without the lock.
///
/// Submissions never sleep, so they can be made from any context. Waiting
/// for a stamp may sleep if the caller asks for [`WaitMode::Sleep`].
pub struct InvalidationQueue<P: QiPlatform> {
    regs: P::Registers,
    wait_queue: P::WaitQueue,
    inner: Mutex<Inner<P>>,
    /// Serializes drains so that records are released in stamp order.
    drain_lock: Mutex<()>,
    mark: CompletionMark<P::Word>,
    waiters: AtomicU64,
    drainers: AtomicU32,
    counters: QiCounters,
    options: QiOptions,
}

struct Inner<P: QiPlatform> {
    ring: DescriptorRing<P::Region>,
    sequencer: Sequencer,
    ledger: ReclaimLedger<P::Payload>,
    /// Never `Draining`, which is derived from the number of running bottom halves.
    state: QiState,
}

impl<P: QiPlatform> Inner<P> {
    fn check_accepting(&self) -> Result<()> {
        if self.state != QiState::Enabled {
            return Err(QiError::InvalidState);
        }
        Ok(())
    }

    fn check_batch_len(&self, nr_descriptors: usize) -> Result<()> {
        if nr_descriptors > self.ring.capacity() {
            return Err(QiError::TooManyDescriptors);
        }
        Ok(())
    }
}

impl<P: QiPlatform> InvalidationQueue<P> {
    /// Creates a disabled engine.
    ///
    /// The command queue and the completion marker are allocated from
    /// `allocator`. Nothing is written to the registers until
    /// [`enable`](Self::enable).
    pub fn new<A>(
        regs: P::Registers,
        wait_queue: P::WaitQueue,
        allocator: &A,
        options: QiOptions,
    ) -> Result<Self>
    where
        A: DmaAllocator<Region = P::Region, Word = P::Word>,
    {
        options.validate()?;
        let region = allocator
            .alloc_queue(options.queue_pages())
            .ok_or(QiError::RingAllocFailed)?;
        let marker = allocator.alloc_marker().ok_or(QiError::MarkerAllocFailed)?;

        Ok(Self {
            regs,
            wait_queue,
            inner: Mutex::new(Inner {
                ring: DescriptorRing::new(region),
                sequencer: Sequencer::new(),
                ledger: ReclaimLedger::new(),
                state: QiState::Disabled,
            }),
            drain_lock: Mutex::new(()),
            mark: CompletionMark::new(marker),
            waiters: AtomicU64::new(0),
            drainers: AtomicU32::new(0),
            counters: QiCounters::default(),
            options,
        })
    }

    /// Hands the queue over to the device and unmasks the completion interrupt.
    pub fn enable(&self) -> Result<()> {
        let (base, nr_slots) = {
            let mut inner = self.inner.lock();
            if inner.state != QiState::Disabled {
                return Err(QiError::InvalidState);
            }
            inner.state = QiState::Enabling;
            inner.ring.reset();
            (inner.ring.base_paddr(), inner.ring.capacity() + 1)
        };

        self.regs.write_queue_tail(0);
        self.regs.set_queue_base(base, self.options.queue_pages());
        self.regs.enable_queue();
        self.regs.set_completion_interrupt_masked(false);

        self.inner.lock().state = QiState::Enabled;
        info!("IOMMU QI: enabled, queue at {:#x} with {} slots", base, nr_slots);
        Ok(())
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> QiState {
        let state = self.inner.lock().state;
        if state == QiState::Enabled && self.drainers.load(Ordering::Relaxed) > 0 {
            QiState::Draining
        } else {
            state
        }
    }

    /// Submits `commands` followed by a wait descriptor and returns its stamp.
    ///
    /// If `payload` is given, it is released by [`drain`](Self::drain) once
    /// the device has executed the commands. The wait descriptor requests a
    /// completion interrupt, so the release happens without further action.
    ///
    /// This never sleeps. It spins while the queue is full.
    pub fn submit_invalidate(
        &self,
        commands: &[Descriptor],
        payload: Option<P::Payload>,
    ) -> Result<GenSeq> {
        self.submit_batch(commands, payload)
    }

    /// Submits `commands` and attaches every record of `records`.
    ///
    /// Each record takes its own stamp but only the last stamp gets a wait
    /// descriptor; the device confirms the earlier ones with it. Returns the
    /// last stamp.
    ///
    /// `records` is consumed with the engine lock held.
    pub fn submit_batch<I>(&self, commands: &[Descriptor], records: I) -> Result<GenSeq>
    where
        I: IntoIterator<Item = P::Payload>,
    {
        let mut inner = self.inner.lock();
        inner.check_accepting()?;
        inner.check_batch_len(commands.len())?;

        self.emit_commands(&mut inner, commands);

        let mut records = records.into_iter().peekable();
        let stamp = loop {
            let payload = records.next();
            let is_last = records.peek().is_none();
            let stamp = self.next_stamp(&mut inner, is_last.then_some(WaitFlags::INTERRUPT));
            if let Some(payload) = payload {
                inner.ledger.attach(payload, stamp);
                QiCounters::add(&self.counters.records_attached, 1);
            }
            if is_last {
                break stamp;
            }
        };

        // Records are attached before the device can complete their stamps.
        inner.ring.publish(&self.regs);
        trace!("IOMMU QI: submitted {} descriptors up to {:?}", commands.len(), stamp);
        Ok(stamp)
    }

    /// Submits `commands` and blocks until the device has executed them.
    ///
    /// With [`WaitMode::Spin`], the wait descriptor does not request an
    /// interrupt and the caller never sleeps.
    pub fn invalidate_sync(&self, commands: &[Descriptor], mode: WaitMode) -> Result<GenSeq> {
        // The ticket must be visible before the wait descriptor is published.
        let _ticket = WaiterTicket::new(&self.waiters);

        let stamp = {
            let mut inner = self.inner.lock();
            inner.check_accepting()?;
            inner.check_batch_len(commands.len())?;

            self.emit_commands(&mut inner, commands);
            let stamp = self.next_stamp(&mut inner, Some(wait_flags_for(mode)));
            inner.ring.publish(&self.regs);
            stamp
        };

        waiter::wait_for(&self.mark, &self.wait_queue, stamp, mode, &self.options);
        Ok(stamp)
    }

    /// Blocks until the device has executed everything up to `stamp`.
    ///
    /// `stamp` must have been returned by this engine. A sleeping waiter relies
    /// on the interrupt of the wait descriptor that carries `stamp`; without
    /// one it notices the completion after at most the recheck period.
    pub fn wait(&self, stamp: GenSeq, mode: WaitMode) {
        debug_assert!(stamp <= self.last_stamp());
        let _ticket = WaiterTicket::new(&self.waiters);
        waiter::wait_for(&self.mark, &self.wait_queue, stamp, mode, &self.options);
    }

    /// Returns whether the device has executed everything up to `stamp`.
    pub fn is_confirmed(&self, stamp: GenSeq) -> bool {
        self.mark.is_confirmed(stamp)
    }

    /// Returns the last stamp handed out.
    pub fn last_stamp(&self) -> GenSeq {
        self.inner.lock().sequencer.last()
    }

    /// Returns the number of records waiting for their stamps.
    pub fn pending_records(&self) -> usize {
        self.inner.lock().ledger.len()
    }

    /// Releases every record whose stamp is confirmed and returns their number.
    ///
    /// Records are released in stamp order, outside the engine lock. Calling
    /// this again without new confirmations releases nothing.
    pub fn drain(&self) -> usize {
        let _serial = self.drain_lock.lock();
        let mut released = 0;
        loop {
            let mut batch = DrainBatch::new();
            let more = self
                .inner
                .lock()
                .ledger
                .take_confirmed(|stamp| self.mark.is_confirmed(stamp), &mut batch);

            released += batch.len();
            QiCounters::add(&self.counters.records_released, batch.len() as u64);
            batch
                .into_iter()
                .map(ReclaimRecord::into_payload)
                .for_each(DeferredRelease::release);

            if !more {
                return released;
            }
        }
    }

    /// The bottom half of the completion interrupt.
    ///
    /// Releases confirmed records and wakes up sleeping waiters. Returns the
    /// number of released records.
    pub fn handle_completion_interrupt(&self) -> usize {
        self.drainers.fetch_add(1, Ordering::Relaxed);
        QiCounters::add(&self.counters.completion_interrupts, 1);

        let mut released = self.drain();
        // A record may have been attached and confirmed after the first pass
        // but before the pending status is cleared. No new interrupt would
        // arrive for it.
        if self.regs.is_completion_pending() {
            self.regs.ack_completion();
            released += self.drain();
        }

        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.wait_queue.wake_all();
        }

        self.drainers.fetch_sub(1, Ordering::Relaxed);
        released
    }

    /// Quiesces the engine.
    ///
    /// Submits a final wait descriptor, waits for it, masks the completion
    /// interrupt, stops the device, and releases every remaining record.
    /// No stamps are handed out afterwards until the engine is enabled again.
    pub fn disable_and_drain(&self, mode: WaitMode) -> Result<()> {
        let ticket = WaiterTicket::new(&self.waiters);
        let stamp = {
            let mut inner = self.inner.lock();
            inner.check_accepting()?;
            inner.state = QiState::Quiescing;

            let stamp = self.next_stamp(&mut inner, Some(wait_flags_for(mode)));
            inner.ring.publish(&self.regs);
            stamp
        };

        waiter::wait_for(&self.mark, &self.wait_queue, stamp, mode, &self.options);
        drop(ticket);

        self.regs.set_completion_interrupt_masked(true);
        self.regs.disable_queue();
        let released = self.drain();

        let mut inner = self.inner.lock();
        debug_assert!(inner.ledger.is_empty());
        inner.state = QiState::Disabled;
        info!(
            "IOMMU QI: disabled after {:?}, {} records released on the way out",
            stamp, released
        );
        Ok(())
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> QiStats {
        self.counters.snapshot(self.waiters.load(Ordering::Relaxed))
    }

    fn emit_commands(&self, inner: &mut Inner<P>, commands: &[Descriptor]) {
        if commands.is_empty() {
            return;
        }
        let mut watch = self.space_watch();
        inner.ring.ensure_space(commands.len(), &self.regs, &mut watch);
        for command in commands {
            inner.ring.emit(command);
        }
        QiCounters::add(&self.counters.descriptors_emitted, commands.len() as u64);
    }

    /// Allocates a stamp, optionally backed by a wait descriptor with `wait` flags.
    fn next_stamp(&self, inner: &mut Inner<P>, wait: Option<WaitFlags>) -> GenSeq {
        if inner.sequencer.needs_wrap() {
            self.force_wrap(inner);
        }
        let stamp = inner.sequencer.allocate();
        if let Some(flags) = wait {
            self.emit_wait(inner, flags, stamp.sequence());
        }
        stamp
    }

    /// Retires the current generation.
    ///
    /// The sentinel is written by a wait descriptor like any other sequence
    /// number; once it is confirmed, the device holds no wait descriptor of
    /// the old generation and the marker can start over.
    fn force_wrap(&self, inner: &mut Inner<P>) {
        let expiring = inner.sequencer.expiring();
        self.emit_wait(inner, WaitFlags::empty(), expiring.sequence());
        inner.ring.publish(&self.regs);

        let mut watch = StallWatch::new("generation wrap", self.options.warn_after());
        while !self.mark.is_confirmed(expiring) {
            watch.spin();
        }

        let generation = inner.sequencer.advance_generation();
        self.mark.start_generation(generation);
        QiCounters::add(&self.counters.forced_wraps, 1);
        debug!("IOMMU QI: sequence space exhausted, now at generation {}", generation);
    }

    fn emit_wait(&self, inner: &mut Inner<P>, flags: WaitFlags, sequence: u32) {
        let mut watch = self.space_watch();
        inner.ring.ensure_space(1, &self.regs, &mut watch);
        inner.ring.emit(&Descriptor::invalidation_wait(
            flags | WaitFlags::STATUS_WRITE,
            sequence,
            self.mark.marker_paddr(),
        ));
        QiCounters::add(&self.counters.descriptors_emitted, 1);
        QiCounters::add(&self.counters.wait_descriptors, 1);
    }

    fn space_watch(&self) -> StallWatch<'_> {
        StallWatch::new("queue space", self.options.warn_after())
            .counting(&self.counters.queue_full_stalls)
    }

    /// Makes the next stamp `(generation, next_sequence)`.
    ///
    /// Only valid while nothing is outstanding.
    #[cfg(test)]
    pub(crate) fn set_next_sequence(&self, generation: u32, next_sequence: u32) {
        let mut inner = self.inner.lock();
        inner.sequencer = Sequencer::starting_at(generation, next_sequence);
        self.mark.start_generation(generation);
    }

    #[cfg(test)]
    pub(crate) fn wait_queue(&self) -> &P::WaitQueue {
        &self.wait_queue
    }
}

fn wait_flags_for(mode: WaitMode) -> WaitFlags {
    match mode {
        WaitMode::Sleep => WaitFlags::INTERRUPT,
        WaitMode::Spin => WaitFlags::empty(),
    }
}

impl<P: QiPlatform> fmt::Debug for InvalidationQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationQueue")
            .field("mark", &self.mark)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<P: QiPlatform> Drop for InvalidationQueue<P> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state != QiState::Disabled {
            warn!("IOMMU QI: dropped in state {:?}", inner.state);
        }
        if !inner.ledger.is_empty() {
            warn!(
                "IOMMU QI: dropped with {} records never released, oldest at {:?}",
                inner.ledger.len(),
                inner.ledger.oldest()
            );
        }
    }
}
