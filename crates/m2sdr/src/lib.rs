//! User-space runtime for the M2SDR platform.
//!
//! This crate is the surface the rest of the stack consumes: open a device
//! by identifier, configure a stream, move samples with blocking `rx`/`tx`
//! calls. Underneath, the same engine contract is satisfied by three
//! transports:
//!
//! - **PCIe** (`pcie:/dev/m2sdr0`): the kernel driver runs the engine; this
//!   crate talks to it over the control channel and maps the DMA rings for
//!   zero-copy access.
//! - **Ethernet** (`eth:192.168.1.50:1234`): register access over
//!   Etherbone, samples as fixed-size datagrams, the engine runs here.
//! - **Simulation** ([`Device::open_sim`]): the software device model from
//!   `m2sdr-dma`, for tests and hardware-less development.
//!
//! ```ignore
//! use m2sdr::{Device, StreamConfig, SampleFormat, Direction};
//!
//! let device = Device::open("pcie:/dev/m2sdr0")?;
//! let mut rx = device.config(&StreamConfig {
//!     direction: Direction::Rx,
//!     format: SampleFormat::ComplexInt16,
//!     channel: 0,
//!     samples_per_buffer: 2048,
//!     ..StreamConfig::default()
//! })?;
//!
//! let mut samples = vec![0u8; 8192 * 16];
//! rx.rx(&mut samples, None, None)?;
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod ident;
pub mod logging;
pub mod relay;
pub mod stream;

#[cfg(unix)]
pub mod chardev;

pub use config::{SampleFormat, StreamConfig, StreamFlags};
pub use device::{Device, SimConfig};
pub use error::{Error, Result};
pub use ident::DeviceId;
pub use stream::{StreamHandle, StreamStats};

pub use m2sdr_proto::{Direction, ErrorCode};
