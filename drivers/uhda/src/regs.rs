//! Controller register space
//!
//! [`RegisterSpace`] is a typed view over the memory-mapped register BAR.
//! Every register is described by a [`Register`] carrying its offset and the
//! type it is read as, so that flag registers come back as `bitflags` values
//! instead of raw integers.

use core::{marker::PhantomData, ptr::NonNull};

use bitflags::bitflags;

// ============================================================================
// Raw access
// ============================================================================

/// Integer widths the hardware exposes
pub trait RawRegister: Copy {
    /// # Safety
    ///
    /// `ptr` must be valid for a volatile read of `Self` and suitably aligned.
    unsafe fn read(ptr: *const u8) -> Self;

    /// # Safety
    ///
    /// `ptr` must be valid for a volatile write of `Self` and suitably
    /// aligned.
    unsafe fn write(ptr: *mut u8, value: Self);
}

macro_rules! raw_register {
    ($($ty:ty),*) => {
        $(
            impl RawRegister for $ty {
                unsafe fn read(ptr: *const u8) -> Self {
                    // SAFETY: guaranteed by the caller.
                    unsafe { core::ptr::read_volatile(ptr.cast::<$ty>()) }
                }

                unsafe fn write(ptr: *mut u8, value: Self) {
                    // SAFETY: guaranteed by the caller.
                    unsafe { core::ptr::write_volatile(ptr.cast::<$ty>(), value) }
                }
            }
        )*
    };
}

raw_register!(u8, u16, u32);

/// A value that can be loaded from or stored to a register
pub trait RegisterValue: Copy {
    type Raw: RawRegister;

    fn from_raw(raw: Self::Raw) -> Self;
    fn into_raw(self) -> Self::Raw;
}

macro_rules! plain_value {
    ($($ty:ty),*) => {
        $(
            impl RegisterValue for $ty {
                type Raw = $ty;

                fn from_raw(raw: $ty) -> Self {
                    raw
                }

                fn into_raw(self) -> $ty {
                    self
                }
            }
        )*
    };
}

plain_value!(u8, u16, u32);

macro_rules! flags_value {
    ($($ty:ty: $raw:ty),* $(,)?) => {
        $(
            impl RegisterValue for $ty {
                type Raw = $raw;

                fn from_raw(raw: $raw) -> Self {
                    Self::from_bits_retain(raw)
                }

                fn into_raw(self) -> $raw {
                    self.bits()
                }
            }
        )*
    };
}

/// A register at a fixed offset, read and written as `T`
#[derive(Debug)]
pub struct Register<T> {
    offset: usize,
    _value: PhantomData<fn() -> T>,
}

impl<T> Register<T> {
    pub const fn new(offset: usize) -> Self {
        Self {
            offset,
            _value: PhantomData,
        }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl<T> Clone for Register<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Register<T> {}

// ============================================================================
// Register space
// ============================================================================

/// View over a block of memory-mapped registers
///
/// A view never owns the mapping; the controller keeps the BAR mapped for as
/// long as any view derived from it is in use.
#[derive(Debug, Clone, Copy)]
pub struct RegisterSpace {
    base: NonNull<u8>,
}

impl RegisterSpace {
    /// Create a view over the registers mapped at `base`
    ///
    /// # Safety
    ///
    /// `base` must map the controller's register block (or a block laid out
    /// the same way) for as long as the view, or any subspace of it, is used.
    pub const unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    /// View of the register block starting `offset` bytes into this one
    pub fn subspace(&self, offset: usize) -> Self {
        // SAFETY: the register block is mapped as a whole, so any offset used
        // by the driver stays inside the same mapping and cannot wrap to null.
        let base = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) };
        Self { base }
    }

    /// Base address of this view
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn load<T: RegisterValue>(&self, reg: Register<T>) -> T {
        // SAFETY: `new` guarantees the mapping, register offsets are
        // naturally aligned for their width.
        let raw = unsafe { T::Raw::read(self.base.as_ptr().add(reg.offset)) };
        T::from_raw(raw)
    }

    pub fn store<T: RegisterValue>(&self, reg: Register<T>, value: T) {
        // SAFETY: as in `load`.
        unsafe { T::Raw::write(self.base.as_ptr().add(reg.offset), value.into_raw()) }
    }

    /// Read-modify-write of a single register
    pub fn update<T: RegisterValue>(&self, reg: Register<T>, f: impl FnOnce(T) -> T) {
        let value = self.load(reg);
        self.store(reg, f(value));
    }
}

// SAFETY: a view is an address into device memory; accesses are volatile and
// every writer holds the controller lock or the owning stream's lock.
unsafe impl Send for RegisterSpace {}
// SAFETY: see the Send impl.
unsafe impl Sync for RegisterSpace {}

// ============================================================================
// Register fields
// ============================================================================

bitflags! {
    /// GCAP: global capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalCapabilities: u16 {
        /// 64-bit DMA addresses supported
        const ADDR_64 = 1 << 0;
    }
}

impl GlobalCapabilities {
    /// Number of output stream descriptors (OSS)
    pub fn output_streams(self) -> usize {
        ((self.bits() >> 12) & 0xF) as usize
    }

    /// Number of input stream descriptors (ISS)
    pub fn input_streams(self) -> usize {
        ((self.bits() >> 8) & 0xF) as usize
    }

    /// Number of bidirectional stream descriptors (BSS)
    pub fn bidirectional_streams(self) -> usize {
        ((self.bits() >> 3) & 0x1F) as usize
    }
}

bitflags! {
    /// GCTL: global control
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalControl: u32 {
        /// Controller out of reset when set
        const CRST = 1 << 0;
        const FCNTRL = 1 << 1;
        /// Accept unsolicited responses
        const UNSOL = 1 << 8;
    }
}

bitflags! {
    /// INTCTL: interrupt control, bits 29:0 enable individual streams
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptControl: u32 {
        const CIE = 1 << 30;
        const GIE = 1 << 31;
    }
}

bitflags! {
    /// INTSTS: interrupt status, bits 29:0 report individual streams
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        const CIS = 1 << 30;
        const GIS = 1 << 31;
    }
}

/// Stream bits shared by INTCTL and INTSTS
pub const STREAM_INTERRUPT_MASK: u32 = 0x3FFF_FFFF;

impl InterruptControl {
    pub fn stream_enables(self) -> u32 {
        self.bits() & STREAM_INTERRUPT_MASK
    }

    pub fn with_streams(self, mask: u32) -> Self {
        Self::from_bits_retain(self.bits() | (mask & STREAM_INTERRUPT_MASK))
    }

    pub fn without_streams(self, mask: u32) -> Self {
        Self::from_bits_retain(self.bits() & !(mask & STREAM_INTERRUPT_MASK))
    }
}

impl InterruptStatus {
    pub fn streams(self) -> u32 {
        self.bits() & STREAM_INTERRUPT_MASK
    }
}

bitflags! {
    /// CORBCTL
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CorbControl: u8 {
        /// Memory error interrupt enable
        const MEIE = 1 << 0;
        /// CORB DMA engine running
        const RUN = 1 << 1;
    }
}

bitflags! {
    /// CORBRP
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CorbReadPointer: u16 {
        const RST = 1 << 15;
    }
}

bitflags! {
    /// RIRBCTL
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RirbControl: u8 {
        /// Response interrupt enable
        const RINTCTL = 1 << 0;
        /// RIRB DMA engine running
        const DMAEN = 1 << 1;
        /// Overrun interrupt enable
        const OIC = 1 << 2;
    }
}

bitflags! {
    /// CORBSIZE / RIRBSIZE
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RingSize: u8 {
        const SZCAP_2 = 1 << 4;
        const SZCAP_16 = 1 << 5;
        const SZCAP_256 = 1 << 6;
    }
}

impl RingSize {
    /// Currently selected size code (bits 1:0)
    pub fn size_code(self) -> u8 {
        self.bits() & 0b11
    }

    pub fn with_size_code(self, code: u8) -> Self {
        Self::from_bits_retain((self.bits() & !0b11) | (code & 0b11))
    }
}

bitflags! {
    /// DPLBASE: low half of the DMA position buffer address
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaPositionBase: u32 {
        /// DMA position buffer enable
        const DPBE = 1 << 0;
    }
}

impl DmaPositionBase {
    /// Base address field; the buffer must be 128-byte aligned
    pub fn with_address(addr: u32) -> Self {
        Self::from_bits_retain(addr & !0x7F)
    }
}

bitflags! {
    /// SDnCTL bits 15:0
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamControl: u16 {
        /// Stream reset
        const SRST = 1 << 0;
        const RUN = 1 << 1;
        /// Interrupt on completion enable
        const IOCE = 1 << 2;
        /// FIFO error interrupt enable
        const FEIE = 1 << 3;
        /// Descriptor error interrupt enable
        const DEIE = 1 << 4;
    }
}

bitflags! {
    /// SDnSTS, write 1 to clear
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamStatus: u8 {
        /// Buffer completion interrupt status
        const BCIS = 1 << 2;
        const FIFOE = 1 << 3;
        const DESE = 1 << 4;
        const FIFORDY = 1 << 5;
    }
}

flags_value!(
    GlobalCapabilities: u16,
    GlobalControl: u32,
    InterruptControl: u32,
    InterruptStatus: u32,
    CorbControl: u8,
    CorbReadPointer: u16,
    RirbControl: u8,
    RingSize: u8,
    DmaPositionBase: u32,
    StreamControl: u16,
    StreamStatus: u8,
);

// ============================================================================
// Register map
// ============================================================================

pub const GCAP: Register<GlobalCapabilities> = Register::new(0x00);
pub const GCTL: Register<GlobalControl> = Register::new(0x08);
/// Codec presence bitmap, one bit per codec address
pub const STATESTS: Register<u16> = Register::new(0x0E);
pub const INTCTL: Register<InterruptControl> = Register::new(0x20);
pub const INTSTS: Register<InterruptStatus> = Register::new(0x24);

pub const CORBLBASE: Register<u32> = Register::new(0x40);
pub const CORBUBASE: Register<u32> = Register::new(0x44);
/// Bits 7:0 hold the last written CORB entry
pub const CORBWP: Register<u16> = Register::new(0x48);
pub const CORBRP: Register<CorbReadPointer> = Register::new(0x4A);
pub const CORBCTL: Register<CorbControl> = Register::new(0x4C);
pub const CORBSIZE: Register<RingSize> = Register::new(0x4E);

pub const RIRBLBASE: Register<u32> = Register::new(0x50);
pub const RIRBUBASE: Register<u32> = Register::new(0x54);
/// Bits 7:0 hold the last written RIRB entry, bit 15 resets it
pub const RIRBWP: Register<u16> = Register::new(0x58);
pub const RINTCNT: Register<u16> = Register::new(0x5A);
pub const RIRBCTL: Register<RirbControl> = Register::new(0x5C);
pub const RIRBSIZE: Register<RingSize> = Register::new(0x5E);

pub const DPLBASE: Register<DmaPositionBase> = Register::new(0x70);
pub const DPUBASE: Register<u32> = Register::new(0x74);

/// Write pointer field of CORBWP and RIRBWP
pub const RING_POINTER_MASK: u16 = 0xFF;
/// RIRBWP reset bit
pub const RIRBWP_RST: u16 = 1 << 15;

/// Offset of the first stream descriptor; input streams come first, then
/// output streams, then bidirectional ones
pub const STREAM_DESCRIPTOR_BASE: usize = 0x80;
pub const STREAM_DESCRIPTOR_STRIDE: usize = 0x20;

/// Offset of stream descriptor `index` (counted across all directions)
pub const fn stream_descriptor(index: usize) -> usize {
    STREAM_DESCRIPTOR_BASE + index * STREAM_DESCRIPTOR_STRIDE
}

/// Registers of one stream descriptor, relative to its subspace
pub mod stream {
    use super::{Register, StreamControl, StreamStatus};

    pub const CTL0: Register<StreamControl> = Register::new(0x00);
    /// Bits 7:4 carry the stream tag
    pub const CTL2: Register<u8> = Register::new(0x02);
    pub const STS: Register<StreamStatus> = Register::new(0x03);
    /// Link position in buffer
    pub const LPIB: Register<u32> = Register::new(0x04);
    /// Cyclic buffer length
    pub const CBL: Register<u32> = Register::new(0x08);
    /// Last valid index of the buffer descriptor list
    pub const LVI: Register<u16> = Register::new(0x0C);
    pub const FMT: Register<u16> = Register::new(0x12);
    pub const BDPL: Register<u32> = Register::new(0x18);
    pub const BDPU: Register<u32> = Register::new(0x1C);

    pub const TAG_SHIFT: u8 = 4;
}
