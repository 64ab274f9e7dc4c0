//! DMA streaming engine for the M2SDR platform.
//!
//! This crate moves fixed-size sample buffers between a device and host
//! memory through a ring of descriptors per direction. It is the common core
//! behind the PCIe transport (where the same logic runs kernel-side and this
//! crate drives it through the control channel) and the software/UDP
//! transports (where it runs entirely in-process).
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!                    │         RegisterPort         │  32-bit CSR access
//!                    └──────┬────────────────┬──────┘
//!                           │                │
//!        ┌──────────────────┴──────┐  ┌──────┴──────────────┐
//!        │  DescriptorProgrammer   │  │  InterruptDemux     │
//!        │  start/stop, table fill │  │  vector walk → wake │
//!        └──────────┬──────────────┘  └──────┬──────────────┘
//!                   │                        │ advances
//!        ┌──────────┴─────────┐     ┌────────┴──────────┐
//!        │     BufferPool     │◄────│  DirectionState   │ hw/sw counters,
//!        │  N × B DMA buffers │     │  wait queue       │ error accounting
//!        └──────────┬─────────┘     └────────┬──────────┘
//!                   │                        │
//!                   └───────────┬────────────┘
//!                        ┌──────┴──────┐
//!                        │  UserRing   │  next/submit/consume
//!                        └─────────────┘
//! ```
//!
//! The slot at `sw_count mod N` belongs to software, the slot at
//! `hw_count mod N` to hardware; everything else in the ring is in flight.
//! Both counters are 64-bit and monotonic, with the hardware side
//! reconstructed from a wrap-prone 32-bit device register.

pub mod counters;
pub mod descriptor;
pub mod error;
pub mod irq;
pub mod lock;
pub mod mock;
pub mod pool;
pub mod port;
pub mod registry;
pub mod ring;

pub use counters::{DirectionState, Timeout};
pub use descriptor::{DescriptorProgrammer, EngineConfig};
pub use error::{DmaError, DmaResult};
pub use irq::InterruptDemux;
pub use lock::{ChannelLockArbiter, HolderId};
pub use pool::BufferPool;
pub use port::RegisterPort;
pub use ring::{AccessMode, UserRing};

pub use m2sdr_proto::Direction;
