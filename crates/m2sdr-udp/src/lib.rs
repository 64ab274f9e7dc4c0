//! UDP transport for the M2SDR streaming engine.
//!
//! Two independent services share the Ethernet path:
//!
//! - [`etherbone`]: 32-bit register access over UDP, one request per
//!   datagram, satisfying the same register-port contract as the PCIe MMIO
//!   window.
//! - [`stream`]: sample transport as fixed-size datagrams reassembled into
//!   ring buffers with the same producer/consumer semantics as the DMA
//!   rings. No reordering, deduplication, loss recovery or path-MTU logic:
//!   the contract matches PCIe at the buffer boundary and nothing more.

pub mod bridge;
pub mod etherbone;
pub mod stream;

pub use etherbone::EtherbonePort;
pub use stream::UdpStreamer;

/// Default control/streaming port.
pub const DEFAULT_PORT: u16 = 1234;
