//! CORB/RIRB verb transport
//!
//! Codecs are configured by writing verb descriptors into the Command
//! Outbound Ring Buffer (CORB). The controller forwards each verb over the
//! link and stores the codec's answer in the Response Inbound Ring Buffer
//! (RIRB) at the same ring index, which is how a response is correlated with
//! the verb that produced it.

use alloc::sync::Arc;

use log::{info, trace};

use crate::{
    config::{PAGE_SIZE, RESPONSE_INTERRUPT_COUNT},
    dma::DmaRegion,
    error::UhdaResult,
    kernel_api::{poll_until, KernelApi},
    regs::{self, CorbControl, CorbReadPointer, RegisterSpace, RingSize, RirbControl},
};

// ============================================================================
// Descriptors
// ============================================================================

/// One CORB entry
///
/// Bits 31:28 address the codec, 27:20 the node, 19:0 carry the verb.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerbDescriptor(u32);

impl VerbDescriptor {
    fn new(codec: u8, nid: u8, payload: u32) -> Self {
        Self(((codec as u32 & 0xF) << 28) | ((nid as u32) << 20) | (payload & 0xF_FFFF))
    }

    /// Verb with a 12-bit command and 8-bit data
    pub fn short(codec: u8, nid: u8, cmd: u16, data: u8) -> Self {
        Self::new(codec, nid, ((cmd as u32 & 0xFFF) << 8) | data as u32)
    }

    /// Verb with a 4-bit command and 16-bit data
    pub fn long(codec: u8, nid: u8, cmd: u8, data: u16) -> Self {
        Self::new(codec, nid, ((cmd as u32 & 0xF) << 16) | data as u32)
    }

    pub fn codec(self) -> u8 {
        (self.0 >> 28) as u8
    }

    pub fn nid(self) -> u8 {
        (self.0 >> 20) as u8
    }

    pub fn payload(self) -> u32 {
        self.0 & 0xF_FFFF
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// One RIRB entry
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseDescriptor {
    /// Verb specific response payload
    pub response: u32,
    /// Bits 3:0 codec address, bit 4 unsolicited
    pub response_ex: u32,
}

impl ResponseDescriptor {
    pub fn codec(&self) -> u8 {
        (self.response_ex & 0xF) as u8
    }

    pub fn is_unsolicited(&self) -> bool {
        self.response_ex & (1 << 4) != 0
    }
}

// ============================================================================
// Ring size negotiation
// ============================================================================

/// Negotiated geometry of one ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Number of entries
    pub entries: u16,
    /// Value of the size field selecting `entries`
    pub code: u8,
}

/// Pick the largest ring the hardware supports
///
/// Returns the chosen geometry and, when the size field does not already
/// select it, the register value to write back.
pub fn negotiate_ring_size(current: RingSize) -> (RingGeometry, Option<RingSize>) {
    let geometry = if current.contains(RingSize::SZCAP_256) {
        RingGeometry {
            entries: 256,
            code: 0b10,
        }
    } else if current.contains(RingSize::SZCAP_16) {
        RingGeometry {
            entries: 16,
            code: 0b01,
        }
    } else {
        RingGeometry {
            entries: 2,
            code: 0b00,
        }
    };

    let rewrite = (current.size_code() != geometry.code).then(|| current.with_size_code(geometry.code));
    (geometry, rewrite)
}

// ============================================================================
// Verb queue
// ============================================================================

/// Command/response ring pair of one controller
pub struct VerbQueue {
    kernel: Arc<dyn KernelApi>,
    space: RegisterSpace,
    corb: DmaRegion,
    rirb: DmaRegion,
    corb_entries: u16,
    rirb_entries: u16,
}

impl VerbQueue {
    /// Allocate both rings, one page each
    ///
    /// A page holds the largest ring: 256 four-byte verbs or 256 eight-byte
    /// responses rounded up to a page.
    pub fn new(kernel: &Arc<dyn KernelApi>, space: RegisterSpace) -> UhdaResult<Self> {
        let corb = DmaRegion::new(kernel, PAGE_SIZE)?;
        let rirb = DmaRegion::new(kernel, PAGE_SIZE)?;
        Ok(Self {
            kernel: kernel.clone(),
            space,
            corb,
            rirb,
            corb_entries: 2,
            rirb_entries: 2,
        })
    }

    pub fn corb_entries(&self) -> u16 {
        self.corb_entries
    }

    pub fn rirb_entries(&self) -> u16 {
        self.rirb_entries
    }

    /// Stop both ring DMA engines
    pub fn stop(&self) {
        self.space
            .update(regs::CORBCTL, |ctl| ctl.difference(CorbControl::RUN));
        self.space
            .update(regs::RIRBCTL, |ctl| ctl.difference(RirbControl::DMAEN));
    }

    /// Size, place and start both rings
    ///
    /// Expects both engines to be stopped.
    pub fn start(&mut self) -> UhdaResult<()> {
        let space = self.space;

        let (corb, rewrite) = negotiate_ring_size(space.load(regs::CORBSIZE));
        if let Some(value) = rewrite {
            space.store(regs::CORBSIZE, value);
        }
        let (rirb, rewrite) = negotiate_ring_size(space.load(regs::RIRBSIZE));
        if let Some(value) = rewrite {
            space.store(regs::RIRBSIZE, value);
        }
        self.corb_entries = corb.entries;
        self.rirb_entries = rirb.entries;
        info!(
            "uhda: corb {} entries, rirb {} entries",
            corb.entries, rirb.entries
        );

        let corb_phys = self.corb.phys_addr();
        space.store(regs::CORBLBASE, corb_phys as u32);
        space.store(regs::CORBUBASE, (corb_phys >> 32) as u32);
        let rirb_phys = self.rirb.phys_addr();
        space.store(regs::RIRBLBASE, rirb_phys as u32);
        space.store(regs::RIRBUBASE, (rirb_phys >> 32) as u32);

        space.store(regs::CORBWP, 0);
        space.store(regs::CORBRP, CorbReadPointer::RST);
        poll_until(&*self.kernel, || {
            space.load(regs::CORBRP).contains(CorbReadPointer::RST)
        })?;
        space.store(regs::CORBRP, CorbReadPointer::empty());
        poll_until(&*self.kernel, || {
            !space.load(regs::CORBRP).contains(CorbReadPointer::RST)
        })?;
        space.store(regs::RIRBWP, regs::RIRBWP_RST);

        space.store(regs::RINTCNT, RESPONSE_INTERRUPT_COUNT);
        space.update(regs::CORBCTL, |ctl| ctl | CorbControl::RUN);
        space.update(regs::RIRBCTL, |ctl| ctl | RirbControl::DMAEN);
        Ok(())
    }

    /// Queue a verb and return the ring index it occupies
    pub fn submit(&mut self, verb: VerbDescriptor) -> u8 {
        let wp = self.space.load(regs::CORBWP) & regs::RING_POINTER_MASK;
        let index = ((wp + 1) % self.corb_entries) as u8;

        // SAFETY: `index` is below the negotiated entry count, and a page
        // holds 256 four-byte entries.
        unsafe {
            core::ptr::write_volatile(
                self.corb.as_ptr().cast::<u32>().add(index as usize),
                verb.raw(),
            )
        };
        self.space.store(regs::CORBWP, index as u16);
        trace!("uhda: verb {:#010x} at {}", verb.raw(), index);
        index
    }

    /// Queue a verb with a 12-bit command and 8-bit data
    pub fn submit_verb(&mut self, codec: u8, nid: u8, cmd: u16, data: u8) -> u8 {
        self.submit(VerbDescriptor::short(codec, nid, cmd, data))
    }

    /// Queue a verb with a 4-bit command and 16-bit data
    pub fn submit_verb_long(&mut self, codec: u8, nid: u8, cmd: u8, data: u16) -> u8 {
        self.submit(VerbDescriptor::long(codec, nid, cmd, data))
    }

    /// Wait until the verb at `index` has been sent and answered
    pub fn wait_for_verb(&self, index: u8) -> UhdaResult<ResponseDescriptor> {
        let space = self.space;
        let target = index as u16;
        poll_until(&*self.kernel, || {
            space.load(regs::CORBWP) & regs::RING_POINTER_MASK == target
        })?;
        poll_until(&*self.kernel, || {
            space.load(regs::RIRBWP) & regs::RING_POINTER_MASK == target
        })?;

        // SAFETY: the hardware finished writing entry `index`, which lies
        // inside the page-sized RIRB.
        let response = unsafe {
            core::ptr::read_volatile(
                self.rirb
                    .as_ptr()
                    .cast::<ResponseDescriptor>()
                    .add(index as usize),
            )
        };
        Ok(response)
    }

    /// Submit `verb` and wait for its response
    pub fn command(&mut self, verb: VerbDescriptor) -> UhdaResult<ResponseDescriptor> {
        let index = self.submit(verb);
        self.wait_for_verb(index)
    }
}
