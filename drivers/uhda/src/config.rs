//! Compile-time driver configuration

/// Delay between two polls of a hardware status bit, in microseconds
pub const POLL_INTERVAL_US: u32 = 200;

/// Number of polls before a hardware wait gives up (2 seconds in total)
pub const POLL_ITERATIONS: u32 = 5 * 2000;

/// Time the link takes to act on a CRST change before it is polled
pub const RESET_ACK_US: u32 = 100;

/// Settle time after entering controller reset
pub const RESET_SETTLE_US: u32 = 200;

/// Settle time granted to codecs after leaving reset, before they are probed
pub const CODEC_SETTLE_US: u32 = 1000;

/// Size of every physically contiguous buffer the driver allocates
pub const PAGE_SIZE: usize = 4096;

/// Number of hardware buffer pages owned by one stream
pub const STREAM_BUFFER_PAGES: usize = 4;

/// Input and output stream slots are each capped at this count by GCAP
pub const MAX_STREAMS: usize = 16;

/// Stream descriptors addressable through INTCTL/INTSTS
pub const MAX_DESCRIPTORS: usize = 30;

/// Width of the codec presence bitmap in STATESTS
pub const MAX_CODECS: u8 = 15;

/// Number of responses after which the RIRB raises an interrupt
pub const RESPONSE_INTERRUPT_COUNT: u16 = 255;

/// Controllers from this vendor only deliver interrupts over legacy INTx
pub const LEGACY_IRQ_VENDOR_ID: u16 = 0x10DE;
