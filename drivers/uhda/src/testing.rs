//! Host-memory model of an HD-Audio controller for unit tests
//!
//! Registers live in an ordinary heap block, "physical" memory is identity
//! mapped heap pages, and the CORB/RIRB engine runs whenever the driver
//! busy-waits through [`KernelApi::delay`].

extern crate std;

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    sync::Mutex,
};

use crate::{
    codec::{AmpCapabilities, Codec, CodecTopology, PinCapabilities, Widget, WidgetKind},
    config::PAGE_SIZE,
    dma::DmaRegion,
    error::{UhdaError, UhdaResult},
    kernel_api::{InterruptHandler, IrqHandle, IrqHint, KernelApi, PciDevice},
    regs::{
        self, CorbControl, CorbReadPointer, GlobalCapabilities, GlobalControl, RegisterSpace,
        RingSize,
    },
    stream::{InterruptGate, Stream},
    verb::{VerbDescriptor, VerbQueue},
};

/// Responder return value that leaves a verb unanswered
pub(crate) const NO_RESPONSE: u32 = 0xDEAD_BEEF;

/// Vendor/device id reported by every fixture codec
pub(crate) const FIXTURE_VENDOR_ID: u32 = 0x10EC_0269;

const REGISTER_BYTES: usize = 0x800;

type Responder = Box<dyn Fn(VerbDescriptor) -> u32 + Send>;

pub(crate) struct MockState {
    registers: NonNull<u32>,
    config: Mutex<[u8; 256]>,
    allocations: Mutex<BTreeMap<u64, usize>>,
    fail_map: AtomicBool,
    /// Value GCTL.CRST is forced back to on every tick
    stuck_crst: Mutex<Option<bool>>,
    delay_calls: AtomicUsize,
    responder: Mutex<Responder>,
    verbs: Mutex<Vec<VerbDescriptor>>,
    irq: Mutex<Option<(IrqHint, Arc<dyn InterruptHandler>)>>,
    irq_enabled: AtomicBool,
    bar_mapped: AtomicBool,
}

// SAFETY: the register block is only touched with volatile accesses, and the
// model is used from one test thread at a time.
unsafe impl Send for MockState {}
// SAFETY: see the Send impl.
unsafe impl Sync for MockState {}

impl Drop for MockState {
    fn drop(&mut self) {
        let words = REGISTER_BYTES / 4;
        // SAFETY: `registers` came from Box::into_raw of a `words` long slice.
        drop(unsafe {
            Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                self.registers.as_ptr(),
                words,
            ))
        });
        if let Ok(allocations) = self.allocations.lock() {
            for (&phys, &size) in allocations.iter() {
                // SAFETY: every tracked block came from alloc_zeroed with this layout.
                unsafe { dealloc(phys as *mut u8, page_layout(size)) };
            }
        }
    }
}

fn page_layout(size: usize) -> Layout {
    Layout::from_size_align(size.max(1), PAGE_SIZE).unwrap()
}

fn default_responder(verb: VerbDescriptor) -> u32 {
    if verb.payload() == 0xF0000 {
        FIXTURE_VENDOR_ID
    } else {
        0
    }
}

impl MockState {
    fn space(&self) -> RegisterSpace {
        // SAFETY: the register block lives as long as the model.
        unsafe { RegisterSpace::new(self.registers.cast::<u8>()) }
    }

    /// Run the CORB/RIRB engine once
    fn tick(&self) {
        let space = self.space();
        if let Some(crst) = *self.stuck_crst.lock().unwrap() {
            space.update(regs::GCTL, |ctl| {
                if crst {
                    ctl | GlobalControl::CRST
                } else {
                    ctl.difference(GlobalControl::CRST)
                }
            });
        }
        if space.load(regs::RIRBWP) & regs::RIRBWP_RST != 0 {
            space.store(regs::RIRBWP, 0);
        }
        if !space.load(regs::CORBCTL).contains(CorbControl::RUN) {
            return;
        }

        let entries = match space.load(regs::CORBSIZE).size_code() {
            0b10 => 256,
            0b01 => 16,
            _ => 2,
        };
        let corb = ((space.load(regs::CORBUBASE) as u64) << 32 | space.load(regs::CORBLBASE) as u64)
            as *const u32;
        let rirb = ((space.load(regs::RIRBUBASE) as u64) << 32 | space.load(regs::RIRBLBASE) as u64)
            as *mut u32;

        let mut rp = space.load(regs::CORBRP).bits() & 0xFF;
        let wp = space.load(regs::CORBWP) & 0xFF;
        while rp != wp {
            rp = (rp + 1) % entries;
            // SAFETY: the driver programmed the CORB base with an identity
            // mapped page holding `entries` verbs.
            let verb = VerbDescriptor::from_raw(unsafe { corb.add(rp as usize).read_volatile() });
            self.verbs.lock().unwrap().push(verb);

            let response = (self.responder.lock().unwrap())(verb);
            if response != NO_RESPONSE {
                // SAFETY: as above, for the RIRB page with two words per entry.
                unsafe {
                    rirb.add(rp as usize * 2).write_volatile(response);
                    rirb.add(rp as usize * 2 + 1).write_volatile(verb.codec() as u32);
                }
                space.store(regs::RIRBWP, rp);
            }
        }
        space.store(regs::CORBRP, CorbReadPointer::from_bits_retain(rp));
    }
}

impl KernelApi for MockState {
    fn allocate_physical(&self, size: usize) -> UhdaResult<u64> {
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(page_layout(size)) };
        if ptr.is_null() {
            return Err(UhdaError::NoMemory);
        }
        self.allocations.lock().unwrap().insert(ptr as u64, size);
        Ok(ptr as u64)
    }

    fn deallocate_physical(&self, phys: u64, size: usize) {
        let tracked = self.allocations.lock().unwrap().remove(&phys);
        assert_eq!(tracked, Some(size), "freeing unknown block {:#x}", phys);
        // SAFETY: the block was allocated by allocate_physical with this size.
        unsafe { dealloc(phys as *mut u8, page_layout(size)) };
    }

    fn map(&self, phys: u64, _size: usize) -> UhdaResult<NonNull<u8>> {
        if self.fail_map.swap(false, Ordering::SeqCst) {
            return Err(UhdaError::Host(-14));
        }
        NonNull::new(phys as *mut u8).ok_or(UhdaError::Host(-14))
    }

    fn unmap(&self, _virt: NonNull<u8>, _size: usize) {}

    fn delay(&self, _micros: u32) {
        self.delay_calls.fetch_add(1, Ordering::SeqCst);
        self.tick();
    }
}

impl PciDevice for MockState {
    fn read_config(&self, offset: u16, size: u8) -> UhdaResult<u32> {
        let config = self.config.lock().unwrap();
        let mut value = 0u32;
        for i in 0..size as usize {
            value |= (config[offset as usize + i] as u32) << (8 * i);
        }
        Ok(value)
    }

    fn write_config(&self, offset: u16, size: u8, value: u32) -> UhdaResult<()> {
        let mut config = self.config.lock().unwrap();
        for i in 0..size as usize {
            config[offset as usize + i] = (value >> (8 * i)) as u8;
        }
        Ok(())
    }

    fn map_bar(&self, _bar: u8) -> UhdaResult<NonNull<u8>> {
        self.bar_mapped.store(true, Ordering::SeqCst);
        Ok(self.registers.cast::<u8>())
    }

    fn unmap_bar(&self, _bar: u8, _virt: NonNull<u8>) {
        self.bar_mapped.store(false, Ordering::SeqCst);
    }

    fn allocate_irq(
        &self,
        hint: IrqHint,
        handler: Arc<dyn InterruptHandler>,
    ) -> UhdaResult<IrqHandle> {
        *self.irq.lock().unwrap() = Some((hint, handler));
        Ok(IrqHandle(7))
    }

    fn deallocate_irq(&self, irq: IrqHandle) {
        assert_eq!(irq, IrqHandle(7));
        *self.irq.lock().unwrap() = None;
    }

    fn enable_irq(&self, _irq: IrqHandle, enable: bool) {
        self.irq_enabled.store(enable, Ordering::SeqCst);
    }
}

/// Handle on the controller model
pub(crate) struct MockHardware {
    state: Arc<MockState>,
}

impl MockHardware {
    /// Controller with 64-bit DMA, one input and one output stream, all ring
    /// sizes, and a single codec at address 0
    pub(crate) fn new() -> Self {
        let words = vec![0u32; REGISTER_BYTES / 4].into_boxed_slice();
        let registers = NonNull::new(Box::into_raw(words).cast::<u32>()).unwrap();

        let mut config = [0u8; 256];
        config[0..2].copy_from_slice(&0x8086u16.to_le_bytes());
        config[2..4].copy_from_slice(&0x2668u16.to_le_bytes());
        config[0x10..0x14].copy_from_slice(&0xFEB0_0000u32.to_le_bytes());

        let hw = Self {
            state: Arc::new(MockState {
                registers,
                config: Mutex::new(config),
                allocations: Mutex::new(BTreeMap::new()),
                fail_map: AtomicBool::new(false),
                stuck_crst: Mutex::new(None),
                delay_calls: AtomicUsize::new(0),
                responder: Mutex::new(Box::new(default_responder)),
                verbs: Mutex::new(Vec::new()),
                irq: Mutex::new(None),
                irq_enabled: AtomicBool::new(false),
                bar_mapped: AtomicBool::new(false),
            }),
        };

        let space = hw.space();
        hw.set_gcap(0x1101);
        hw.set_ring_capabilities(RingSize::SZCAP_2 | RingSize::SZCAP_16 | RingSize::SZCAP_256);
        space.store(regs::STATESTS, 0b1);
        hw
    }

    pub(crate) fn kernel(&self) -> Arc<dyn KernelApi> {
        self.state.clone()
    }

    pub(crate) fn pci(&self) -> Arc<dyn PciDevice> {
        self.state.clone()
    }

    pub(crate) fn space(&self) -> RegisterSpace {
        self.state.space()
    }

    // ------------------------------------------------------------------------
    // Hardware configuration
    // ------------------------------------------------------------------------

    pub(crate) fn set_gcap(&self, gcap: u16) {
        self.space()
            .store(regs::GCAP, GlobalCapabilities::from_bits_retain(gcap));
    }

    pub(crate) fn set_ring_capabilities(&self, caps: RingSize) {
        self.space().store(regs::CORBSIZE, caps);
        self.space().store(regs::RIRBSIZE, caps);
    }

    pub(crate) fn set_codec_mask(&self, mask: u16) {
        self.space().store(regs::STATESTS, mask);
    }

    pub(crate) fn set_vendor(&self, vendor: u16) {
        self.state.write_config(0, 2, vendor as u32).unwrap();
    }

    /// Flag every BAR as I/O space
    pub(crate) fn set_io_bars_only(&self) {
        for bar in 0..6u16 {
            self.state.write_config(0x10 + bar * 4, 4, 0xE001).unwrap();
        }
    }

    pub(crate) fn set_responder(&self, responder: impl Fn(VerbDescriptor) -> u32 + Send + 'static) {
        *self.state.responder.lock().unwrap() = Box::new(responder);
    }

    /// Pin GCTL.CRST to `crst` whatever the driver writes; `None` releases it
    pub(crate) fn set_stuck_crst(&self, crst: Option<bool>) {
        *self.state.stuck_crst.lock().unwrap() = crst;
    }

    pub(crate) fn fail_next_map(&self) {
        self.state.fail_map.store(true, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Verbs the codec side has consumed, oldest first
    pub(crate) fn verbs(&self) -> Vec<VerbDescriptor> {
        self.state.verbs.lock().unwrap().clone()
    }

    pub(crate) fn clear_verbs(&self) {
        self.state.verbs.lock().unwrap().clear();
    }

    pub(crate) fn delay_calls(&self) -> usize {
        self.state.delay_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.state.allocations.lock().unwrap().len()
    }

    pub(crate) fn pci_command(&self) -> u16 {
        self.state.read_config(4, 2).unwrap() as u16
    }

    pub(crate) fn irq_hint(&self) -> Option<IrqHint> {
        self.state.irq.lock().unwrap().as_ref().map(|(hint, _)| *hint)
    }

    pub(crate) fn irq_allocated(&self) -> bool {
        self.state.irq.lock().unwrap().is_some()
    }

    pub(crate) fn irq_enabled(&self) -> bool {
        self.state.irq_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn bar_mapped(&self) -> bool {
        self.state.bar_mapped.load(Ordering::SeqCst)
    }

    /// Deliver the device interrupt if it is registered and unmasked
    pub(crate) fn fire_irq(&self) -> bool {
        let handler = self
            .state
            .irq
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, handler)| handler.clone());
        match handler {
            Some(handler) if self.irq_enabled() => handler.handle_interrupt(),
            _ => false,
        }
    }

    pub(crate) fn set_interrupt_status(&self, status: u32) {
        self.space().store(
            regs::INTSTS,
            regs::InterruptStatus::from_bits_retain(status),
        );
    }

    /// Write the DMA position word of output stream `index`
    pub(crate) fn set_stream_position(&self, positions: &DmaRegion, index: u8, value: u32) {
        let descriptor = Self::output_descriptor(index);
        // SAFETY: the position page holds two words for each of up to 30
        // descriptors.
        unsafe {
            positions
                .as_ptr()
                .cast::<u32>()
                .add(descriptor * 2)
                .write_volatile(value)
        };
    }

    /// Write a position word into the buffer the driver programmed in DPLBASE
    pub(crate) fn write_position_buffer(&self, descriptor: usize, value: u32) {
        let space = self.space();
        let base = (space.load(regs::DPUBASE) as u64) << 32
            | (space.load(regs::DPLBASE).bits() & !0x7F) as u64;
        assert_ne!(base, 0, "position buffer not programmed");
        // SAFETY: the driver's position page is identity mapped and holds a
        // word pair for every descriptor.
        unsafe { (base as *mut u32).add(descriptor * 2).write_volatile(value) };
    }

    // ------------------------------------------------------------------------
    // Driver objects wired to the model
    // ------------------------------------------------------------------------

    pub(crate) fn verb_queue(&self) -> VerbQueue {
        let mut queue = VerbQueue::new(&self.kernel(), self.space()).unwrap();
        queue.start().unwrap();
        queue
    }

    fn stream(&self, index: u8, output: bool) -> Stream {
        let gate = Arc::new(InterruptGate::new(self.space()));
        Stream::new(self.kernel(), gate, index, output)
    }

    pub(crate) fn output_stream(&self, index: u8) -> Stream {
        self.stream(index, true)
    }

    pub(crate) fn input_stream(&self, index: u8) -> Stream {
        self.stream(index, false)
    }

    /// Descriptor of output stream `index` behind the single input stream
    pub(crate) fn output_descriptor(index: u8) -> usize {
        1 + index as usize
    }

    pub(crate) fn output_stream_space(&self, index: u8) -> RegisterSpace {
        self.space()
            .subspace(regs::stream_descriptor(Self::output_descriptor(index)))
    }

    /// Output stream bound to its descriptor and a fresh position buffer
    pub(crate) fn bound_output_stream(&self, index: u8) -> (Stream, DmaRegion) {
        let positions = DmaRegion::new(&self.kernel(), PAGE_SIZE).unwrap();
        let descriptor = Self::output_descriptor(index);
        // SAFETY: the position page is large enough for any descriptor.
        let position = unsafe { positions.as_ptr().cast::<u32>().add(descriptor * 2) };

        let stream = self.output_stream(index);
        stream.bind(
            self.output_stream_space(index),
            NonNull::new(position).unwrap(),
            descriptor,
        );
        (stream, positions)
    }
}

// ============================================================================
// Fixture topology
// ============================================================================

/// Small speaker + headphone codec
///
/// ```text
/// DAC 0x02 ──┐
///            ├─ mixer 0x0C ──┬── speaker pin 0x14
/// (0x0B) ────┘               └── headphone pin 0x15
/// DAC 0x03 ──────────────────────┘
/// ```
pub(crate) fn populate_fixture(codec: &mut Codec) -> UhdaResult<()> {
    codec.insert_widget(
        Widget::new(0x02, WidgetKind::AudioOutput).with_out_amp(AmpCapabilities(0x5700)),
    );
    codec.insert_widget(
        Widget::new(0x03, WidgetKind::AudioOutput).with_out_amp(AmpCapabilities(0x5700)),
    );
    codec.insert_widget(
        Widget::new(0x0C, WidgetKind::AudioMixer)
            .with_connections(&[0x02, 0x0B])
            .with_out_amp(AmpCapabilities(0x4000)),
    );
    codec.insert_widget(
        Widget::new(
            0x14,
            WidgetKind::PinComplex {
                caps: PinCapabilities::OUTPUT | PinCapabilities::EAPD,
                config_default: 0x1 << 20,
            },
        )
        .with_connections(&[0x0C])
        .with_out_amp(AmpCapabilities(0x5F00)),
    );
    codec.insert_widget(
        Widget::new(
            0x15,
            WidgetKind::PinComplex {
                caps: PinCapabilities::OUTPUT | PinCapabilities::HEADPHONE_DRIVE,
                config_default: 0x2 << 20,
            },
        )
        .with_connections(&[0x0C, 0x03])
        .with_out_amp(AmpCapabilities(0x5F00)),
    );

    codec.add_output_group(&[0x14])?;
    codec.add_output_group(&[0x15])?;
    codec.add_output_path(&[0x14, 0x0C, 0x02])?;
    codec.add_output_path(&[0x15, 0x0C, 0x02])?;
    codec.add_output_path(&[0x15, 0x03])?;
    Ok(())
}

pub(crate) fn fixture_codec() -> Codec {
    let mut codec = Codec::new(0);
    populate_fixture(&mut codec).unwrap();
    codec
}

pub(crate) struct FixtureTopology;

impl CodecTopology for FixtureTopology {
    fn discover(&self, codec: &mut Codec, _verbs: &mut VerbQueue) -> UhdaResult<()> {
        populate_fixture(codec)
    }
}

/// Topology whose discovery fails with `error` once `armed` is set
pub(crate) struct FailingTopology {
    pub(crate) error: UhdaError,
    pub(crate) armed: AtomicBool,
}

impl FailingTopology {
    pub(crate) fn new(error: UhdaError, armed: bool) -> Self {
        Self {
            error,
            armed: AtomicBool::new(armed),
        }
    }
}

impl CodecTopology for FailingTopology {
    fn discover(&self, codec: &mut Codec, _verbs: &mut VerbQueue) -> UhdaResult<()> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(self.error);
        }
        populate_fixture(codec)
    }
}
