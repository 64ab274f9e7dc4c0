//! PCIe character-device client.
//!
//! One node per `(device, channel)`. Register access, engine control and
//! counter exchange go through the control channel (`m2sdr_proto::ctl`);
//! sample data moves either zero-copy through the mapped DMA rings or
//! through the whole-buffer `read`/`write` fallback.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use tracing::debug;

use m2sdr_dma::{DmaError, DmaResult, RegisterPort};
use m2sdr_proto::csr;
use m2sdr_proto::ctl::{
    self, DmaCounters, DmaCtl, DmaMmapLayout, LockCtl, MmapDmaInfo, MmapUpdate, RegAccess,
};
use m2sdr_proto::Direction;

use crate::error::{Error, Result};

/// An open channel node.
pub struct CharDevice {
    file: File,
    path: PathBuf,
}

impl CharDevice {
    pub fn open(path: &Path) -> Result<Self> {
        // Non-blocking: the fallback read/write paths poll for readiness
        // themselves, and a blocking fd would defeat their timeouts.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        debug!(path = %path.display(), "opened channel node");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl<T>(&self, request: libc::c_ulong, payload: &mut T) -> std::io::Result<()> {
        // SAFETY: request codes and payload layouts are paired in
        // m2sdr_proto::ctl; the kernel reads/writes at most size_of::<T>().
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request, payload as *mut T) };
        if rc < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Enables the channel's internal TX→RX loopback crossbar.
    pub fn set_loopback(&self, enable: bool) -> Result<()> {
        let mut payload = DmaCtl {
            loopback_enable: enable as u8,
        };
        self.ioctl(ctl::CTL_DMA, &mut payload)?;
        Ok(())
    }

    /// Applies `enable` to one direction's engine and returns the driver's
    /// counter snapshot.
    pub fn dma_control(&self, direction: Direction, enable: bool) -> Result<DmaCounters> {
        let mut payload = DmaCounters {
            enable: enable as u8,
            ..DmaCounters::default()
        };
        let request = match direction {
            Direction::Rx => ctl::CTL_DMA_WRITER,
            Direction::Tx => ctl::CTL_DMA_READER,
        };
        self.ioctl(request, &mut payload)?;
        Ok(payload)
    }

    /// Counter snapshot without changing the enable state.
    pub fn dma_counters(&self, direction: Direction, currently_enabled: bool) -> Result<DmaCounters> {
        self.dma_control(direction, currently_enabled)
    }

    pub fn mmap_info(&self) -> Result<MmapDmaInfo> {
        let mut info = MmapDmaInfo::default();
        self.ioctl(ctl::CTL_MMAP_DMA_INFO, &mut info)?;
        Ok(info)
    }

    /// Maps one direction's DMA ring. The offset/length pair is validated
    /// against the layout the driver reported; anything else the kernel
    /// would reject anyway.
    pub fn map_dma_region(&self, direction: Direction) -> Result<MappedRegion> {
        let info = self.mmap_info()?;
        let layout = DmaMmapLayout {
            buf_size: info.tx_size,
            buf_count: info.tx_count,
        };
        let (offset, count, size) = match direction {
            Direction::Tx => (info.tx_offset, info.tx_count, info.tx_size),
            Direction::Rx => (info.rx_offset, info.rx_count, info.rx_size),
        };
        let length = count * size;
        if !layout.is_valid_mapping(offset, length) {
            return Err(Error::InvalidArgument(format!(
                "driver reported unmappable layout: offset {offset}, length {length}"
            )));
        }

        // SAFETY: length and offset were validated against the driver's
        // layout; the mapping is released in MappedRegion::drop.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(MappedRegion {
            ptr: NonNull::new(raw as *mut u8)
                .ok_or_else(|| Error::OutOfMemory("mmap returned null".into()))?,
            len: length as usize,
            buf_count: count as usize,
            buf_size: size as usize,
        })
    }

    /// Publishes the software counter for the zero-copy path.
    pub fn publish_sw_count(&self, direction: Direction, sw_count: i64) -> Result<()> {
        let mut payload = MmapUpdate { sw_count };
        let request = match direction {
            Direction::Rx => ctl::CTL_MMAP_DMA_WRITER_UPDATE,
            Direction::Tx => ctl::CTL_MMAP_DMA_READER_UPDATE,
        };
        self.ioctl(request, &mut payload)?;
        Ok(())
    }

    fn lock_ctl(&self, mut payload: LockCtl) -> Result<LockCtl> {
        self.ioctl(ctl::CTL_LOCK, &mut payload)?;
        Ok(payload)
    }

    /// Requests the direction lock. `Ok(true)` when this handle holds it
    /// after the call.
    pub fn request_lock(&self, direction: Direction) -> Result<bool> {
        let request = match direction {
            Direction::Rx => LockCtl {
                writer_request: 1,
                ..LockCtl::default()
            },
            Direction::Tx => LockCtl {
                reader_request: 1,
                ..LockCtl::default()
            },
        };
        let status = self.lock_ctl(request)?;
        Ok(match direction {
            Direction::Rx => status.writer_status != 0,
            Direction::Tx => status.reader_status != 0,
        })
    }

    pub fn release_lock(&self, direction: Direction) -> Result<()> {
        let release = match direction {
            Direction::Rx => LockCtl {
                writer_release: 1,
                ..LockCtl::default()
            },
            Direction::Tx => LockCtl {
                reader_release: 1,
                ..LockCtl::default()
            },
        };
        self.lock_ctl(release)?;
        Ok(())
    }

    /// Non-destructive lock status.
    pub fn lock_status(&self, direction: Direction) -> Result<bool> {
        let status = self.lock_ctl(LockCtl::default())?;
        Ok(match direction {
            Direction::Rx => status.writer_status != 0,
            Direction::Tx => status.reader_status != 0,
        })
    }

    /// Waits for readiness on the node: readable for RX, writable for TX.
    /// Returns `false` on timeout. `timeout_ms < 0` waits forever.
    pub fn wait_ready(&self, direction: Direction, timeout_ms: i32) -> Result<bool> {
        let events = match direction {
            Direction::Rx => libc::POLLIN,
            Direction::Tx => libc::POLLOUT,
        };
        let mut fds = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events,
            revents: 0,
        };
        // SAFETY: one valid pollfd, standard poll call.
        let rc = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Err(Error::Interrupted);
            }
            return Err(Error::Io(err));
        }
        Ok(rc > 0 && fds.revents & events != 0)
    }

    /// Whole-buffer fallback read. The driver delivers only complete
    /// buffers; a `buf` shorter than one buffer reads 0 bytes.
    pub fn read_chunks(&self, buf: &mut [u8]) -> Result<usize> {
        // SAFETY: buffer pointer/length pair is valid for the call.
        let n = unsafe {
            libc::read(
                self.file.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        Ok(n as usize)
    }

    /// Whole-buffer fallback write, mirror of [`Self::read_chunks`].
    pub fn write_chunks(&self, buf: &[u8]) -> Result<usize> {
        // SAFETY: as read_chunks.
        let n = unsafe {
            libc::write(
                self.file.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        Ok(n as usize)
    }
}

impl RegisterPort for CharDevice {
    fn read_reg(&self, addr: u32) -> DmaResult<u32> {
        if !csr::addr_in_region(addr) {
            return Err(DmaError::InvalidAddress { addr });
        }
        let mut payload = RegAccess {
            addr,
            val: 0,
            is_write: 0,
        };
        self.ioctl(ctl::CTL_REG, &mut payload).map_err(DmaError::Io)?;
        Ok(payload.val)
    }

    fn write_reg(&self, addr: u32, value: u32) -> DmaResult<()> {
        if !csr::addr_in_region(addr) {
            return Err(DmaError::InvalidAddress { addr });
        }
        let mut payload = RegAccess {
            addr,
            val: value,
            is_write: 1,
        };
        self.ioctl(ctl::CTL_REG, &mut payload).map_err(DmaError::Io)?;
        Ok(())
    }
}

/// A mapped DMA ring region. Unmapped on drop.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    buf_count: usize,
    buf_size: usize,
}

// SAFETY: the mapping is plain shared memory; slot ownership is governed by
// the ring counters.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buf_count(&self) -> usize {
        self.buf_count
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: mapping created in map_dma_region, unmapped exactly once.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}
