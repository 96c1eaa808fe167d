//! Stream DMA engine
//!
//! Every stream owns four hardware buffer pages described by a four-entry
//! buffer descriptor list. The hardware plays the pages cyclically and raises
//! an interrupt after each one; the completion handler refills the pages it
//! has finished with from the stream's software ring, which callers feed with
//! [`Stream::queue_data`] or an optional [`BufferFill`] callback.
//!
//! ## Locking
//!
//! Stream state lives behind a per-stream `spin::Mutex` that the interrupt
//! handler also takes. Caller-side operations mask the stream's interrupt
//! enable bit in INTCTL before locking, and the handler only services
//! streams whose enable bit is set, so the handler never spins on a lock held
//! by the context it interrupted. Masks nest; the bit stays clear until the
//! last caller's mask drops.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use log::debug;
use spin::Mutex;

use crate::{
    config::{MAX_DESCRIPTORS, PAGE_SIZE, STREAM_BUFFER_PAGES},
    dma::DmaRegion,
    error::{UhdaError, UhdaResult},
    format::{PcmFormat, StreamParams},
    kernel_api::{poll_until, KernelApi},
    regs::{self, stream, InterruptControl, RegisterSpace, StreamControl, StreamStatus},
};

/// Bytes the hardware cycles through
const CYCLIC_BUFFER_BYTES: usize = PAGE_SIZE * STREAM_BUFFER_PAGES;

// ============================================================================
// Fill callback
// ============================================================================

/// Source of sample data consulted when a stream's ring runs low
///
/// Called from the completion interrupt, so it must return promptly and
/// must not block.
pub trait BufferFill: Send {
    /// Write up to `buffer.len()` bytes into `buffer`; returns bytes written
    fn fill(&mut self, buffer: &mut [u8]) -> usize;
}

impl<F> BufferFill for F
where
    F: FnMut(&mut [u8]) -> usize + Send,
{
    fn fill(&mut self, buffer: &mut [u8]) -> usize {
        self(buffer)
    }
}

// ============================================================================
// Software ring
// ============================================================================

/// Byte ring between the caller and the hardware pages
pub struct StreamRing {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    /// Bytes queued and not yet handed to hardware
    len: usize,
}

impl StreamRing {
    pub fn with_capacity(capacity: usize) -> UhdaResult<Self> {
        if capacity == 0 {
            return Err(UhdaError::Unsupported);
        }
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)?;
        data.resize(capacity, 0);
        Ok(Self {
            data,
            read_pos: 0,
            write_pos: 0,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes queued
    pub fn remaining(&self) -> usize {
        self.len
    }

    /// Bytes that can still be queued
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Queue as much of `data` as fits; returns bytes queued
    pub fn write(&mut self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.free());
        let cap = self.capacity();

        let first_chunk = (cap - self.write_pos).min(to_write);
        let second_chunk = to_write - first_chunk;
        self.data[self.write_pos..self.write_pos + first_chunk]
            .copy_from_slice(&data[..first_chunk]);
        self.data[..second_chunk].copy_from_slice(&data[first_chunk..to_write]);

        self.write_pos = (self.write_pos + to_write) % cap;
        self.len += to_write;
        to_write
    }

    /// Dequeue up to `output.len()` bytes; returns bytes dequeued
    pub fn read(&mut self, output: &mut [u8]) -> usize {
        let to_read = output.len().min(self.len);
        let cap = self.capacity();

        let first_chunk = (cap - self.read_pos).min(to_read);
        let second_chunk = to_read - first_chunk;
        output[..first_chunk]
            .copy_from_slice(&self.data[self.read_pos..self.read_pos + first_chunk]);
        output[first_chunk..to_read].copy_from_slice(&self.data[..second_chunk]);

        self.read_pos = (self.read_pos + to_read) % cap;
        self.len -= to_read;
        to_read
    }

    /// Let `source` write into the free space; returns bytes queued
    pub fn fill_from(&mut self, source: &mut dyn BufferFill) -> usize {
        let mut total = 0;
        while self.free() > 0 {
            let chunk = (self.capacity() - self.write_pos).min(self.free());
            let start = self.write_pos;
            let written = source.fill(&mut self.data[start..start + chunk]).min(chunk);

            self.write_pos = (self.write_pos + written) % self.capacity();
            self.len += written;
            total += written;
            if written < chunk {
                break;
            }
        }
        total
    }
}

// ============================================================================
// Interrupt masking
// ============================================================================

/// Outstanding masks of one stream descriptor
#[derive(Clone, Copy, Default)]
struct MaskDepth {
    depth: u32,
    /// Enable bit to set again once the last mask drops
    restore: bool,
}

/// Owns the stream enable bits of INTCTL
///
/// Masks nest: a stream's bit is cleared by the first outstanding mask and
/// set again only when the last one drops, so a caller holding the stream
/// lock is never exposed to the handler by another caller's mask.
pub(crate) struct InterruptGate {
    pub(crate) space: RegisterSpace,
    masks: Mutex<[MaskDepth; MAX_DESCRIPTORS]>,
}

impl InterruptGate {
    pub(crate) fn new(space: RegisterSpace) -> Self {
        Self {
            space,
            masks: Mutex::new([MaskDepth::default(); MAX_DESCRIPTORS]),
        }
    }

    /// Enable the global interrupt and the streams in `bits`
    ///
    /// Streams that are masked right now are enabled when their last mask
    /// drops.
    pub(crate) fn enable(&self, bits: u32) {
        let mut masks = self.masks.lock();
        let mut enabled = 0;
        for (descriptor, mask) in masks.iter_mut().enumerate() {
            let bit = 1 << descriptor;
            if mask.depth > 0 {
                mask.restore = bits & bit != 0;
            } else {
                enabled |= bits & bit;
            }
        }
        self.space
            .store(regs::INTCTL, InterruptControl::GIE.with_streams(enabled));
    }

    /// Clear the stream enable `bit` until the returned guard drops
    ///
    /// A zero `bit` (stream not bound yet) masks nothing.
    pub(crate) fn mask(&self, bit: u32) -> InterruptMask<'_> {
        let descriptor = bit.trailing_zeros() as usize;
        if descriptor < MAX_DESCRIPTORS {
            let mut masks = self.masks.lock();
            let mask = &mut masks[descriptor];
            if mask.depth == 0 {
                mask.restore = self.space.load(regs::INTCTL).stream_enables() & bit != 0;
                if mask.restore {
                    self.space
                        .update(regs::INTCTL, |ctl| ctl.without_streams(bit));
                }
            }
            mask.depth += 1;
        }
        InterruptMask {
            gate: self,
            descriptor,
        }
    }

    #[cfg(test)]
    pub(crate) fn depth(&self, bit: u32) -> u32 {
        self.masks.lock()[bit.trailing_zeros() as usize].depth
    }
}

pub(crate) struct InterruptMask<'a> {
    gate: &'a InterruptGate,
    descriptor: usize,
}

impl Drop for InterruptMask<'_> {
    fn drop(&mut self) {
        if self.descriptor >= MAX_DESCRIPTORS {
            return;
        }
        let mut masks = self.gate.masks.lock();
        let mask = &mut masks[self.descriptor];
        mask.depth -= 1;
        if mask.depth == 0 && mask.restore {
            let bit = 1 << self.descriptor;
            self.gate
                .space
                .update(regs::INTCTL, |ctl| ctl.with_streams(bit));
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

/// Hardware location of a stream, known once the controller is out of reset
struct StreamBinding {
    space: RegisterSpace,
    /// This stream's word in the DMA position buffer
    position: NonNull<u32>,
}

impl StreamBinding {
    fn position(&self) -> u32 {
        // SAFETY: the controller keeps the DMA position buffer mapped for as
        // long as any stream is bound to it.
        unsafe { core::ptr::read_volatile(self.position.as_ptr()) }
    }
}

// SAFETY: the position pointer targets controller-owned DMA memory that
// outlives the binding; it is only read, under the stream lock.
unsafe impl Send for StreamBinding {}

/// Descriptor list and the pages it points at
struct StreamBuffers {
    bdl: DmaRegion,
    pages: Vec<DmaRegion>,
}

impl StreamBuffers {
    fn new(kernel: &Arc<dyn KernelApi>) -> UhdaResult<Self> {
        let mut bdl = DmaRegion::new(kernel, PAGE_SIZE)?;
        let mut pages = Vec::new();
        pages.try_reserve_exact(STREAM_BUFFER_PAGES)?;
        for _ in 0..STREAM_BUFFER_PAGES {
            pages.push(DmaRegion::new(kernel, PAGE_SIZE)?);
        }

        // Entry: 64-bit address, 32-bit length, 32-bit flags (bit 0 IOC)
        let list = bdl.as_mut_slice();
        for (entry, page) in list.chunks_exact_mut(16).zip(&pages) {
            entry[0..8].copy_from_slice(&page.phys_addr().to_le_bytes());
            entry[8..12].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
            entry[12..16].copy_from_slice(&1u32.to_le_bytes());
        }
        Ok(Self { bdl, pages })
    }
}

struct StreamState {
    binding: Option<StreamBinding>,
    buffers: Option<StreamBuffers>,
    ring: Option<StreamRing>,
    fill: Option<Box<dyn BufferFill>>,
    /// Total bytes handed to the hardware pages
    current_pos: u64,
    /// Next page to refill once the hardware has moved past it
    next_refill: usize,
}

impl StreamState {
    fn binding(&self) -> UhdaResult<&StreamBinding> {
        self.binding.as_ref().ok_or(UhdaError::Unsupported)
    }

    /// Copy the next page worth of ring data into hardware page `page`
    ///
    /// Asks the fill callback for more data when less than a page is queued
    /// and pads whatever is still missing with silence.
    fn refill_page(&mut self, page: usize) {
        let (Some(buffers), Some(ring)) = (self.buffers.as_mut(), self.ring.as_mut()) else {
            return;
        };
        if ring.remaining() < PAGE_SIZE {
            if let Some(fill) = self.fill.as_mut() {
                ring.fill_from(fill.as_mut());
            }
        }

        let target = buffers.pages[page].as_mut_slice();
        let copied = ring.read(target);
        target[copied..].fill(0);
        self.current_pos += PAGE_SIZE as u64;
    }
}

/// One hardware stream descriptor
pub struct Stream {
    index: u8,
    output: bool,
    kernel: Arc<dyn KernelApi>,
    gate: Arc<InterruptGate>,
    /// Bit of this stream in INTCTL/INTSTS
    irq_bit: AtomicU32,
    state: Mutex<StreamState>,
}

impl Stream {
    pub(crate) fn new(
        kernel: Arc<dyn KernelApi>,
        gate: Arc<InterruptGate>,
        index: u8,
        output: bool,
    ) -> Self {
        Self {
            index,
            output,
            kernel,
            gate,
            irq_bit: AtomicU32::new(0),
            state: Mutex::new(StreamState {
                binding: None,
                buffers: None,
                ring: None,
                fill: None,
                current_pos: 0,
                next_refill: 0,
            }),
        }
    }

    /// Attach the stream to its descriptor registers and position word
    pub(crate) fn bind(&self, space: RegisterSpace, position: NonNull<u32>, descriptor: usize) {
        let mut state = self.state.lock();
        state.binding = Some(StreamBinding { space, position });
        self.irq_bit.store(1 << descriptor, Ordering::Release);
    }

    /// Index within its direction
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    /// Total bytes handed to the hardware since the last start
    pub fn current_pos(&self) -> u64 {
        let _mask = self.gate.mask(self.irq_bit.load(Ordering::Acquire));
        self.state.lock().current_pos
    }

    /// Bytes queued in the ring and not yet handed to the hardware
    pub fn remaining(&self) -> usize {
        let _mask = self.gate.mask(self.irq_bit.load(Ordering::Acquire));
        self.state.lock().ring.as_ref().map_or(0, StreamRing::remaining)
    }

    pub fn is_running(&self) -> bool {
        let _mask = self.gate.mask(self.irq_bit.load(Ordering::Acquire));
        let state = self.state.lock();
        state
            .binding
            .as_ref()
            .is_some_and(|b| b.space.load(stream::CTL0).contains(StreamControl::RUN))
    }

    /// Prepare the stream to play `params` from a ring of `ring_size` bytes
    pub fn setup(
        &self,
        params: &StreamParams,
        ring_size: usize,
        fill: Option<Box<dyn BufferFill>>,
    ) -> UhdaResult<()> {
        if !self.output {
            return Err(UhdaError::Unsupported);
        }
        let _mask = self.gate.mask(self.irq_bit.load(Ordering::Acquire));
        let mut state = self.state.lock();
        let space = state.binding()?.space;

        let mut params = *params;
        let format = PcmFormat::negotiate(&mut params);

        space.update(stream::CTL0, |ctl| ctl.difference(StreamControl::RUN));
        space.update(stream::CTL0, |ctl| ctl | StreamControl::SRST);
        poll_until(&*self.kernel, || {
            space.load(stream::CTL0).contains(StreamControl::SRST)
        })?;
        space.update(stream::CTL0, |ctl| ctl.difference(StreamControl::SRST));
        poll_until(&*self.kernel, || {
            !space.load(stream::CTL0).contains(StreamControl::SRST)
        })?;

        if state.buffers.is_none() {
            state.buffers = Some(StreamBuffers::new(&self.kernel)?);
        }
        state.ring = Some(StreamRing::with_capacity(ring_size)?);
        state.fill = fill;
        state.current_pos = 0;
        state.next_refill = 0;

        let bdl = state
            .buffers
            .as_ref()
            .map_or(0, |buffers| buffers.bdl.phys_addr());
        space.store(stream::BDPL, bdl as u32);
        space.store(stream::BDPU, (bdl >> 32) as u32);
        space.store(stream::CBL, CYCLIC_BUFFER_BYTES as u32);
        space.store(stream::LVI, (STREAM_BUFFER_PAGES - 1) as u16);
        space.store(stream::FMT, format.bits());
        space.store(stream::CTL2, (self.index + 1) << stream::TAG_SHIFT);
        space.update(stream::CTL0, |ctl| ctl | StreamControl::IOCE);

        debug!(
            "uhda: stream {} format {:#06x}, ring {} bytes",
            self.index,
            format.bits(),
            ring_size
        );
        Ok(())
    }

    /// Start or stop the DMA engine
    ///
    /// Starting primes all four pages from the ring; starting a running
    /// stream or stopping a stopped one does nothing.
    pub fn play(&self, play: bool) -> UhdaResult<()> {
        let _mask = self.gate.mask(self.irq_bit.load(Ordering::Acquire));
        let mut state = self.state.lock();
        let space = state.binding()?.space;
        let running = space.load(stream::CTL0).contains(StreamControl::RUN);

        if play && !running {
            if state.buffers.is_none() || state.ring.is_none() {
                return Err(UhdaError::Unsupported);
            }
            state.current_pos = 0;
            for page in 0..STREAM_BUFFER_PAGES {
                state.refill_page(page);
            }
            state.next_refill = 0;
            space.update(stream::CTL0, |ctl| ctl | StreamControl::RUN);
        } else if !play && running {
            space.update(stream::CTL0, |ctl| ctl.difference(StreamControl::RUN));
        }
        Ok(())
    }

    /// Queue sample bytes; returns how many fitted in the ring
    pub fn queue_data(&self, data: &[u8]) -> UhdaResult<usize> {
        if !self.output {
            return Err(UhdaError::Unsupported);
        }
        let _mask = self.gate.mask(self.irq_bit.load(Ordering::Acquire));
        let mut state = self.state.lock();
        let ring = state.ring.as_mut().ok_or(UhdaError::Unsupported)?;
        Ok(ring.write(data))
    }

    /// Stop the stream and release its pages and ring
    pub fn shutdown(&self) {
        let _mask = self.gate.mask(self.irq_bit.load(Ordering::Acquire));
        let mut state = self.state.lock();
        if let Some(binding) = state.binding.as_ref() {
            binding.space.update(stream::CTL0, |ctl| {
                ctl.difference(StreamControl::RUN | StreamControl::IOCE)
            });
        }
        state.buffers = None;
        state.ring = None;
        state.fill = None;
        state.current_pos = 0;
        state.next_refill = 0;
    }

    /// Buffer completion handler, called from the interrupt handler
    pub(crate) fn output_irq(&self) {
        let mut state = self.state.lock();
        let Some(binding) = state.binding.as_ref() else {
            return;
        };
        let space = binding.space;
        let status = space.load(stream::STS);
        space.store(
            stream::STS,
            status & (StreamStatus::BCIS | StreamStatus::FIFOE | StreamStatus::DESE),
        );

        if state.buffers.is_none() {
            return;
        }
        let position = binding.position() as usize % CYCLIC_BUFFER_BYTES;
        let hw_page = position / PAGE_SIZE;
        while state.next_refill != hw_page {
            let page = state.next_refill;
            state.refill_page(page);
            state.next_refill = (page + 1) % STREAM_BUFFER_PAGES;
        }
    }

    #[cfg(test)]
    pub(crate) fn page_contents(&self, page: usize) -> Vec<u8> {
        let state = self.state.lock();
        state
            .buffers
            .as_ref()
            .map(|buffers| buffers.pages[page].as_slice().to_vec())
            .unwrap_or_default()
    }
}
