//! Shared-memory sample ring for inter-process handoff.
//!
//! A single-producer/single-consumer ring over a file-backed, memory-mapped
//! region. The streaming side deposits finished sample chunks; another
//! process — a recorder, a demodulator, a GUI — picks them up without
//! copies through the kernel.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  RingHeader (64 bytes)                                   │
//! │  ├─ write_index: u64   (producer position, atomic)       │
//! │  ├─ read_index: u64    (consumer position, atomic)       │
//! │  ├─ error_count: u64   (overflow on RX, underflow on TX) │
//! │  ├─ chunk_size: u32    (samples per chunk per channel)   │
//! │  ├─ num_slots: u32     (>= 16)                           │
//! │  ├─ num_channels: u16                                    │
//! │  ├─ flags: u16         (bit 0 = writer_done)             │
//! │  ├─ sample_size: u32   (bytes per sample)                │
//! │  ├─ buffer_stall_count: u64                              │
//! │  └─ reserved[16]                                         │
//! ├──────────────────────────────────────────────────────────┤
//! │  Slots (num_slots × chunk_bytes)                         │
//! │  chunk_bytes = chunk_size × sample_size × num_channels   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ordering
//!
//! The producer release-stores `write_index` after filling a slot, so every
//! sample byte is visible to a consumer that acquire-loads the index.
//! Symmetrically, the consumer release-stores `read_index` after reading,
//! which keeps the producer from reusing the slot early. `writer_done` is
//! monotonic: once set it is never cleared, and a consumer that drains the
//! ring afterwards terminates cleanly.
//!
//! Byte order is the host's; the file is not meant to cross hosts.

pub mod consumer;
pub mod error;
pub mod layout;
pub mod producer;
mod unix;

pub use consumer::RingConsumer;
pub use error::{ShmError, ShmResult};
pub use layout::{RingConfig, RingHeader, SHM_HEADER_SIZE};
pub use producer::RingProducer;
