//! HD-Audio controller driver core
//!
//! Programs an HD-Audio controller through its register block, talks to the
//! codecs on its link through the CORB/RIRB verb rings, routes output paths
//! through codec widget graphs, and feeds stream DMA buffers from interrupt
//! context.
//!
//! The host kernel supplies memory, PCI and interrupt services through
//! [`KernelApi`] and [`PciDevice`], and codec topology through
//! [`CodecTopology`]. Everything else lives here:
//!
//! - [`Controller`]: reset/suspend/resume state machine and interrupt dispatch
//! - [`VerbQueue`]: command submission and response correlation
//! - [`Codec`] and [`Path`]: conflict-free path selection and programming
//! - [`Stream`]: paged DMA ring refilled on buffer completion

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod codec;
pub mod config;
pub mod controller;
pub mod dma;
pub mod error;
pub mod format;
pub mod kernel_api;
pub mod path;
pub mod regs;
pub mod stream;
pub mod verb;

#[cfg(test)]
mod testing;

pub use codec::{Codec, CodecTopology, Output, OutputGroup, OutputInfo, OutputType, Widget};
pub use controller::{Controller, ControllerState, PathId};
pub use error::{UhdaError, UhdaResult};
pub use format::{PcmFormat, SampleFormat, StreamParams};
pub use kernel_api::{InterruptHandler, IrqHandle, IrqHint, KernelApi, PciDevice};
pub use path::{paths_usable_simultaneously, Path};
pub use stream::{BufferFill, Stream};
pub use verb::{ResponseDescriptor, VerbDescriptor, VerbQueue};
