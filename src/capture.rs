//! Double-buffered audio capture.
//!
//! The sampling front end streams into one of two [`DoubleBuffer`] slots while
//! software owns the other. Ownership of each slot is tracked in a small state
//! table that both sides only touch inside a critical section:
//!
//! ```text
//!   Free --arm/resume--> Filling --buffer full--> Ready --take--> Held --drop--> Free
//! ```
//!
//! The producer (DMA completion interrupt) calls [`DoubleBuffer::on_buffer_full`]
//! and reprograms the transfer with the target it returns. If software still
//! holds the other slot the producer stalls instead of overwriting it, and
//! software restarts it with [`DoubleBuffer::resume`] once the slot is
//! released.
//!
//! [`AudioCapture`] drives one capture pass on top of this, sleeping between
//! interrupts.

use core::{
    cell::{
        Cell,
        RefCell,
        UnsafeCell,
    },
    fmt::Debug,
    ops::Deref,
};

use critical_section::Mutex;

use crate::{
    config::{
        CAPTURE_LEN,
        CaptureConfig,
    },
    fmt::Dbg,
    spectrum::{
        self,
        SpectralPeak,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    /// Being written by the front end.
    Filling,
    /// Complete, with its completion sequence number.
    Ready(u32),
    /// Borrowed by software through a [`HeldSlot`].
    Held,
}

#[derive(Clone, Copy)]
struct Handoff {
    slots: [Slot; 2],
    next_seq: u32,
    stalled: bool,
}

impl Handoff {
    const IDLE: Self = Self {
        slots: [Slot::Free; 2],
        next_seq: 0,
        stalled: false,
    };
}

/// Where the front end should write next.
///
/// Valid until the slot it names is marked full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTarget {
    ptr: *mut i16,
    len: usize,
    slot: usize,
}

// Targets are handed from the main flow to the interrupt or DMA context.
unsafe impl Send for DmaTarget {}

impl DmaTarget {
    pub const fn slot(&self) -> usize {
        self.slot
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn as_mut_ptr(&self) -> *mut i16 {
        self.ptr
    }

    /// The slot's samples as a slice.
    ///
    /// # Safety
    ///
    /// The caller must be the producer, the slot must still be filling, and
    /// the slice must not outlive the following
    /// [`on_buffer_full`](DoubleBuffer::on_buffer_full) call.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [i16] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Two capture slots and the ownership table that guards them.
pub struct DoubleBuffer<const N: usize> {
    slots: [UnsafeCell<[i16; N]>; 2],
    handoff: Mutex<Cell<Handoff>>,
}

// A slot is only written while `Filling` (by the single producer) and only
// read while `Held` (by the single consumer). The table that decides which is
// which is only changed inside a critical section.
unsafe impl<const N: usize> Sync for DoubleBuffer<N> {}

impl<const N: usize> Default for DoubleBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DoubleBuffer<N> {
    pub const fn new() -> Self {
        Self {
            slots: [const { UnsafeCell::new([0; N]) }; 2],
            handoff: Mutex::new(Cell::new(Handoff::IDLE)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Handoff) -> R) -> R {
        critical_section::with(|cs| {
            let cell = self.handoff.borrow(cs);
            let mut handoff = cell.get();
            let result = f(&mut handoff);
            cell.set(handoff);
            result
        })
    }

    fn target(&self, slot: usize) -> DmaTarget {
        DmaTarget {
            ptr: self.slots[slot].get().cast(),
            len: N,
            slot,
        }
    }

    /// Forget completed buffers and hand the first slot to the producer.
    ///
    /// Fails if software still holds a slot from an earlier pass.
    pub fn arm(&self) -> Option<DmaTarget> {
        self.with(|h| {
            if h.slots.contains(&Slot::Held) {
                return None;
            }
            *h = Handoff::IDLE;
            h.slots[0] = Slot::Filling;
            Some(0)
        })
        .map(|slot| self.target(slot))
    }

    /// Producer side: the filling slot is complete.
    ///
    /// Returns the slot to continue into, or `None` when the producer must
    /// stop: either nothing was filling or the other slot is not free yet.
    pub fn on_buffer_full(&self) -> Option<DmaTarget> {
        self.with(|h| {
            let full = h.slots.iter().position(|s| *s == Slot::Filling)?;
            h.slots[full] = Slot::Ready(h.next_seq);
            h.next_seq = h.next_seq.wrapping_add(1);

            let next = 1 - full;
            if h.slots[next] == Slot::Free {
                h.slots[next] = Slot::Filling;
                Some(next)
            } else {
                h.stalled = true;
                None
            }
        })
        .map(|slot| self.target(slot))
    }

    /// True if a completed slot is waiting to be taken.
    pub fn has_ready(&self) -> bool {
        self.with(|h| h.slots.iter().any(|s| matches!(s, Slot::Ready(_))))
    }

    /// Consumer side: take ownership of the oldest completed slot.
    pub fn take_ready(&self) -> Option<HeldSlot<'_, N>> {
        self.with(|h| {
            let (slot, _) = h
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| match s {
                    Slot::Ready(seq) => Some((i, *seq)),
                    _ => None,
                })
                .min_by_key(|&(_, seq)| seq)?;
            h.slots[slot] = Slot::Held;
            Some(slot)
        })
        .map(|slot| HeldSlot { buffer: self, slot })
    }

    /// Restart a stalled producer once a slot has been released.
    pub fn resume(&self) -> Option<DmaTarget> {
        self.with(|h| {
            if !h.stalled {
                return None;
            }
            let free = h.slots.iter().position(|s| *s == Slot::Free)?;
            h.slots[free] = Slot::Filling;
            h.stalled = false;
            Some(free)
        })
        .map(|slot| self.target(slot))
    }

    /// True if the producer stopped for lack of a free slot.
    pub fn is_stalled(&self) -> bool {
        self.with(|h| h.stalled)
    }

    /// Slot the producer currently owns, if any.
    pub fn filling(&self) -> Option<usize> {
        self.with(|h| h.slots.iter().position(|s| *s == Slot::Filling))
    }

    /// Drop every slot the producer owns or has completed.
    ///
    /// Call only once the producer is stopped. Held slots stay held.
    pub fn disarm(&self) {
        self.with(|h| {
            for slot in h.slots.iter_mut() {
                if *slot != Slot::Held {
                    *slot = Slot::Free;
                }
            }
            h.stalled = false;
        });
    }

    fn release(&self, slot: usize) {
        self.with(|h| h.slots[slot] = Slot::Free);
    }
}

/// A completed slot owned by software. Releases the slot on drop.
pub struct HeldSlot<'a, const N: usize> {
    buffer: &'a DoubleBuffer<N>,
    slot: usize,
}

impl<const N: usize> HeldSlot<'_, N> {
    pub const fn slot(&self) -> usize {
        self.slot
    }
}

impl<const N: usize> Deref for HeldSlot<'_, N> {
    type Target = [i16; N];

    fn deref(&self) -> &[i16; N] {
        // Held: the producer has no target into this slot.
        unsafe { &*self.buffer.slots[self.slot].get() }
    }
}

impl<const N: usize> Drop for HeldSlot<'_, N> {
    fn drop(&mut self) {
        self.buffer.release(self.slot);
    }
}

/// The sampling front end and its DMA channel.
pub trait CaptureDma {
    type Error: Debug;

    /// Throw away anything the front end has already buffered.
    fn flush(&mut self) -> Result<(), Self::Error>;

    /// Start streaming into `target`.
    fn start(&mut self, target: DmaTarget) -> Result<(), Self::Error>;

    fn stop(&mut self) -> Result<(), Self::Error>;
}

/// Low-power wait until the next interrupt.
pub trait Sleep {
    /// Run `check` with interrupts masked. If it yields nothing, sleep until
    /// an interrupt arrives and return `None`.
    ///
    /// Unmasking and sleeping must be one step, so an interrupt that lands
    /// right after `check` still wakes the sleep.
    fn check_or_sleep<T>(&mut self, check: impl FnOnce() -> Option<T>) -> Option<T>;
}

// ── Ring-fed producer ───────────────────────────────────────────────────────

/// Bytes per 16-bit little-endian sample in a byte ring.
const SAMPLE_BYTES: usize = 2;
/// Bytes moved out of the ring per pop.
const CHUNK_BYTES: usize = 512;

/// Producer for front ends that stream into a byte ring on their own, such
/// as a circular DMA transfer.
///
/// `ring` pops up to `out.len()` bytes of whatever the ring holds without
/// blocking, returning 0 when it is empty. [`pump`](Self::pump) moves those
/// bytes as 16-bit little-endian samples into the slot being filled and hands
/// each slot over through [`DoubleBuffer::on_buffer_full`] once it is full.
pub struct RingFeeder<'a, R> {
    ring: RefCell<R>,
    buffer: &'a DoubleBuffer<CAPTURE_LEN>,
    /// Slot being filled and the samples already in it.
    fill: Cell<Option<(DmaTarget, usize)>>,
}

impl<'a, R, E> RingFeeder<'a, R>
where
    R: FnMut(&mut [u8]) -> Result<usize, E>,
{
    pub fn new(ring: R, buffer: &'a DoubleBuffer<CAPTURE_LEN>) -> Self {
        Self {
            ring: RefCell::new(ring),
            buffer,
            fill: Cell::new(None),
        }
    }

    fn pop(&self, out: &mut [u8]) -> Result<usize, E> {
        let mut ring = self.ring.borrow_mut();
        (&mut *ring)(out)
    }

    /// Copy everything the ring holds into the slot being filled. Does
    /// nothing while stopped or stalled.
    pub fn pump(&self) -> Result<(), E> {
        let mut bytes = [0u8; CHUNK_BYTES];
        while let Some((target, at)) = self.fill.get() {
            // SAFETY: the slot stays `Filling` until `on_buffer_full`, and
            // this is its only writer.
            let samples = unsafe { target.as_mut_slice() };
            let want = (samples.len() - at).min(CHUNK_BYTES / SAMPLE_BYTES) * SAMPLE_BYTES;
            let got = self.pop(&mut bytes[..want])?;
            if got == 0 {
                return Ok(());
            }

            let pairs = bytes[..got].chunks_exact(SAMPLE_BYTES);
            for (sample, pair) in samples[at..].iter_mut().zip(pairs) {
                *sample = i16::from_le_bytes([pair[0], pair[1]]);
            }
            let at = at + got / SAMPLE_BYTES;
            if at == samples.len() {
                self.fill
                    .set(self.buffer.on_buffer_full().map(|next| (next, 0)));
            } else {
                self.fill.set(Some((target, at)));
            }
        }
        Ok(())
    }
}

impl<R, E> CaptureDma for &RingFeeder<'_, R>
where
    R: FnMut(&mut [u8]) -> Result<usize, E>,
    E: Debug,
{
    type Error = E;

    /// Drop everything the ring has collected so far.
    fn flush(&mut self) -> Result<(), E> {
        self.fill.set(None);
        let mut scratch = [0u8; CHUNK_BYTES];
        let mut dropped = 0;
        loop {
            match self.pop(&mut scratch)? {
                0 => break,
                n => dropped += n,
            }
        }
        debug!("flushed {} stale bytes", dropped);
        Ok(())
    }

    fn start(&mut self, target: DmaTarget) -> Result<(), E> {
        debug!("filling slot {}", target.slot());
        self.fill.set(Some((target, 0)));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), E> {
        self.fill.set(None);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CaptureError<E> {
    Dma(E),
    /// A slot from an earlier pass is still held.
    BufferHeld,
    /// No buffer completed within the configured number of waits.
    Timeout,
}

impl<E> From<E> for CaptureError<E> {
    fn from(e: E) -> Self {
        Self::Dma(e)
    }
}

/// Where a capture pass is.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CaptureState {
    Idle,
    Arm,
    WaitForBuffer,
    DrainAndAnalyze,
    /// Finished, with the peak if the buffer held any signal.
    Done(Option<SpectralPeak>),
}

/// One-shot capture and analysis of a [`CAPTURE_LEN`] sample buffer.
pub struct AudioCapture<'a> {
    buffer: &'a DoubleBuffer<CAPTURE_LEN>,
    config: CaptureConfig,
    state: CaptureState,
    settle_left: u8,
    sleeps: u32,
}

impl<'a> AudioCapture<'a> {
    pub fn new(buffer: &'a DoubleBuffer<CAPTURE_LEN>, config: CaptureConfig) -> Self {
        Self {
            buffer,
            config,
            state: CaptureState::Idle,
            settle_left: 0,
            sleeps: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Low-power waits taken during the last pass.
    pub fn sleeps(&self) -> u32 {
        self.sleeps
    }

    /// Run until the pass is done: arm, wait for a buffer, analyse it.
    ///
    /// Continues a pass already advanced with [`step`](Self::step); a
    /// finished pass starts over.
    pub fn run<D, S>(
        &mut self,
        dma: &mut D,
        sleep: &mut S,
    ) -> Result<Option<SpectralPeak>, CaptureError<D::Error>>
    where
        D: CaptureDma,
        S: Sleep,
    {
        if let CaptureState::Done(_) = self.state {
            self.state = CaptureState::Idle;
        }
        loop {
            if let CaptureState::Done(peak) = self.state {
                return Ok(peak);
            }
            if let Err(e) = self.step(dma, sleep) {
                self.abort(dma);
                return Err(e);
            }
        }
    }

    /// Advance by one state.
    pub fn step<D, S>(&mut self, dma: &mut D, sleep: &mut S) -> Result<(), CaptureError<D::Error>>
    where
        D: CaptureDma,
        S: Sleep,
    {
        let next = match self.state {
            CaptureState::Idle => CaptureState::Arm,
            CaptureState::Arm => {
                dma.flush()?;
                let target = self.buffer.arm().ok_or(CaptureError::BufferHeld)?;
                dma.start(target)?;
                self.settle_left = self.config.settle_buffers;
                self.sleeps = 0;
                CaptureState::WaitForBuffer
            }
            CaptureState::WaitForBuffer => {
                let buffer = self.buffer;
                match sleep.check_or_sleep(|| buffer.has_ready().then_some(())) {
                    Some(()) => CaptureState::DrainAndAnalyze,
                    None => {
                        self.sleeps = self.sleeps.saturating_add(1);
                        if self.config.max_sleeps.is_some_and(|max| self.sleeps >= max) {
                            warn!("no audio buffer after {} waits", self.sleeps);
                            return Err(CaptureError::Timeout);
                        }
                        CaptureState::WaitForBuffer
                    }
                }
            }
            CaptureState::DrainAndAnalyze => self.drain(dma)?,
            CaptureState::Done(_) => return Ok(()),
        };

        if next != self.state {
            debug!("capture {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        Ok(())
    }

    fn drain<D: CaptureDma>(&mut self, dma: &mut D) -> Result<CaptureState, CaptureError<D::Error>> {
        // Only this consumer takes slots, and the wait saw one ready.
        let Some(held) = self.buffer.take_ready() else {
            return Ok(CaptureState::WaitForBuffer);
        };

        if self.settle_left > 0 {
            self.settle_left -= 1;
            debug!("discarding settling buffer from slot {}", held.slot());
            drop(held);
            if let Some(target) = self.buffer.resume() {
                debug!("restarting stalled capture");
                dma.start(target)?;
            }
            return Ok(CaptureState::WaitForBuffer);
        }

        dma.stop()?;
        self.buffer.disarm();
        let peak = spectrum::analyze(&held, self.config.sample_rate_hz);
        drop(held);

        match peak {
            Some(p) => info!("audio peak: bin {} ({} Hz)", p.bin, p.frequency_hz),
            None => info!("audio buffer is silent"),
        }
        Ok(CaptureState::Done(peak))
    }

    fn abort<D: CaptureDma>(&mut self, dma: &mut D) {
        if let Err(e) = dma.stop() {
            warn!("stopping capture failed: {:?}", Dbg(&e));
        }
        self.buffer.disarm();
        self.state = CaptureState::Idle;
    }
}
