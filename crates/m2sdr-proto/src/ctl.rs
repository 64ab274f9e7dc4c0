//! Kernel/user control-channel ABI.
//!
//! One character device per `(device, channel)` accepts the operations below.
//! The request codes and payload layouts are ABI: the values are fixed and
//! must never be renumbered. Payloads are `#[repr(C)]` and exchanged in the
//! host's native byte order.

use std::mem;

/// ioctl magic byte for the M2SDR driver ('S').
pub const CTL_MAGIC: u32 = b'S' as u32;

// Operation numbers. Fixed for ABI compatibility.
pub const NR_REG: u32 = 0;
pub const NR_DMA: u32 = 1;
pub const NR_DMA_WRITER: u32 = 2;
pub const NR_DMA_READER: u32 = 3;
pub const NR_MMAP_DMA_INFO: u32 = 4;
pub const NR_MMAP_DMA_WRITER_UPDATE: u32 = 5;
pub const NR_MMAP_DMA_READER_UPDATE: u32 = 6;
pub const NR_LOCK: u32 = 7;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> libc::c_ulong {
    ((dir << IOC_DIRSHIFT)
        | (CTL_MAGIC << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as libc::c_ulong
}

/// Register access. `is_write != 0` writes `val` to `addr`, otherwise the
/// driver fills `val` with the register contents.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegAccess {
    pub addr: u32,
    pub val: u32,
    pub is_write: u8,
}

/// Channel-wide DMA control.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaCtl {
    pub loopback_enable: u8,
}

/// Enable plus counter snapshot for one direction. The driver returns the
/// current counters on every call; `enable` transitions start and stop the
/// engine.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaCounters {
    pub enable: u8,
    pub hw_count: i64,
    pub sw_count: i64,
}

/// Geometry of the two mappable DMA regions.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapDmaInfo {
    pub tx_offset: u64,
    pub tx_size: u64,
    pub tx_count: u64,
    pub rx_offset: u64,
    pub rx_size: u64,
    pub rx_count: u64,
}

/// Software-counter publication for the zero-copy path.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapUpdate {
    pub sw_count: i64,
}

/// Channel-lock request/release/status. Request and release fields are
/// consumed by the driver; status fields are filled on return (1 = this
/// handle holds the lock after the call).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct LockCtl {
    pub reader_request: u8,
    pub writer_request: u8,
    pub reader_release: u8,
    pub writer_release: u8,
    pub reader_status: u8,
    pub writer_status: u8,
}

pub const CTL_REG: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, NR_REG, mem::size_of::<RegAccess>());
pub const CTL_DMA: libc::c_ulong = ioc(IOC_WRITE, NR_DMA, mem::size_of::<DmaCtl>());
pub const CTL_DMA_WRITER: libc::c_ulong =
    ioc(IOC_READ | IOC_WRITE, NR_DMA_WRITER, mem::size_of::<DmaCounters>());
pub const CTL_DMA_READER: libc::c_ulong =
    ioc(IOC_READ | IOC_WRITE, NR_DMA_READER, mem::size_of::<DmaCounters>());
pub const CTL_MMAP_DMA_INFO: libc::c_ulong =
    ioc(IOC_READ, NR_MMAP_DMA_INFO, mem::size_of::<MmapDmaInfo>());
pub const CTL_MMAP_DMA_WRITER_UPDATE: libc::c_ulong = ioc(
    IOC_WRITE,
    NR_MMAP_DMA_WRITER_UPDATE,
    mem::size_of::<MmapUpdate>(),
);
pub const CTL_MMAP_DMA_READER_UPDATE: libc::c_ulong = ioc(
    IOC_WRITE,
    NR_MMAP_DMA_READER_UPDATE,
    mem::size_of::<MmapUpdate>(),
);
pub const CTL_LOCK: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, NR_LOCK, mem::size_of::<LockCtl>());

/// DMA `mmap` layout for one channel: the TX region sits at offset 0, the RX
/// region right behind it, each exactly `count * size` bytes. Any other
/// offset/length combination is rejected by the driver; clients validate
/// before calling to fail with a better error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMmapLayout {
    pub buf_size: u64,
    pub buf_count: u64,
}

impl DmaMmapLayout {
    pub fn region_size(&self) -> u64 {
        self.buf_size * self.buf_count
    }

    pub fn tx_offset(&self) -> u64 {
        0
    }

    pub fn rx_offset(&self) -> u64 {
        self.region_size()
    }

    /// Whether `(offset, length)` names exactly one of the two regions.
    pub fn is_valid_mapping(&self, offset: u64, length: u64) -> bool {
        length == self.region_size() && (offset == self.tx_offset() || offset == self.rx_offset())
    }

    pub fn info(&self) -> MmapDmaInfo {
        MmapDmaInfo {
            tx_offset: self.tx_offset(),
            tx_size: self.buf_size,
            tx_count: self.buf_count,
            rx_offset: self.rx_offset(),
            rx_size: self.buf_size,
            rx_count: self.buf_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_are_stable() {
        // The exact values are ABI. If one of these changes, the driver and
        // every deployed client disagree; renumbering is not an option.
        assert_eq!(CTL_REG, ioc(3, 0, 12));
        assert_eq!(CTL_DMA, ioc(1, 1, 1));
        assert_eq!(CTL_DMA_WRITER, ioc(3, 2, 24));
        assert_eq!(CTL_DMA_READER, ioc(3, 3, 24));
        assert_eq!(CTL_MMAP_DMA_INFO, ioc(2, 4, 48));
        assert_eq!(CTL_MMAP_DMA_WRITER_UPDATE, ioc(1, 5, 8));
        assert_eq!(CTL_MMAP_DMA_READER_UPDATE, ioc(1, 6, 8));
        assert_eq!(CTL_LOCK, ioc(3, 7, 6));
    }

    #[test]
    fn payload_sizes() {
        assert_eq!(mem::size_of::<RegAccess>(), 12);
        assert_eq!(mem::size_of::<DmaCtl>(), 1);
        assert_eq!(mem::size_of::<DmaCounters>(), 24);
        assert_eq!(mem::size_of::<MmapDmaInfo>(), 48);
        assert_eq!(mem::size_of::<MmapUpdate>(), 8);
        assert_eq!(mem::size_of::<LockCtl>(), 6);
    }

    #[test]
    fn mmap_layout_accepts_only_the_two_regions() {
        let layout = DmaMmapLayout {
            buf_size: 8192,
            buf_count: 256,
        };
        let size = 8192 * 256;
        assert!(layout.is_valid_mapping(0, size));
        assert!(layout.is_valid_mapping(size, size));
        assert!(!layout.is_valid_mapping(0, size - 8192));
        assert!(!layout.is_valid_mapping(8192, size));
        assert!(!layout.is_valid_mapping(2 * size, size));
    }

    #[test]
    fn mmap_info_matches_layout() {
        let layout = DmaMmapLayout {
            buf_size: 8192,
            buf_count: 64,
        };
        let info = layout.info();
        assert_eq!(info.tx_offset, 0);
        assert_eq!(info.rx_offset, 8192 * 64);
        assert_eq!(info.tx_count, 64);
        assert_eq!(info.rx_size, 8192);
    }
}
