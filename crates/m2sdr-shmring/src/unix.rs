//! File-backed mapping helpers.
//!
//! The ring lives in a regular file at a caller-supplied path, so unrelated
//! processes can rendezvous on it without a name service. The producer
//! creates and sizes the file; consumers open and map it read-write (they
//! own `read_index`).

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use libc::{c_void, close, ftruncate, mmap, munmap, off_t, open, MAP_FAILED, MAP_SHARED, O_CREAT,
    O_RDWR, PROT_READ, PROT_WRITE, S_IRUSR, S_IWUSR};

use crate::error::{ShmError, ShmResult};
use crate::layout::{RingHeader, SHM_HEADER_SIZE};

fn c_path(path: &Path) -> ShmResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| ShmError::File(format!("bad path: {e}")))
}

/// Creates (or truncates) the ring file and maps it (producer side).
pub(crate) fn create_ring_file(path: &Path, size: usize) -> ShmResult<(*mut u8, libc::c_int)> {
    let c_name = c_path(path)?;

    // SAFETY: plain open/ftruncate/mmap sequence; every failure path closes
    // what it opened before returning.
    unsafe {
        let fd = open(
            c_name.as_ptr(),
            O_CREAT | O_RDWR,
            (S_IRUSR | S_IWUSR) as libc::c_uint,
        );
        if fd == -1 {
            return Err(ShmError::File(format!(
                "open failed for '{}': {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        if ftruncate(fd, size as off_t) == -1 {
            let err = std::io::Error::last_os_error();
            close(fd);
            return Err(ShmError::File(format!("ftruncate failed: {err}")));
        }

        let raw = mmap(
            ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_SHARED,
            fd,
            0,
        );
        if raw == MAP_FAILED {
            let err = std::io::Error::last_os_error();
            close(fd);
            return Err(ShmError::Mmap(format!("mmap failed: {err}")));
        }

        Ok((raw as *mut u8, fd))
    }
}

/// Opens and maps an existing ring file (consumer side). Returns the
/// mapping, its fd and the mapped size.
pub(crate) fn open_ring_file(path: &Path) -> ShmResult<(*mut u8, libc::c_int, usize)> {
    let c_name = c_path(path)?;

    // SAFETY: the header is mapped alone first to learn the total size,
    // then the full region; both mappings are validated before use.
    unsafe {
        let fd = open(c_name.as_ptr(), O_RDWR);
        if fd == -1 {
            return Err(ShmError::File(format!(
                "open failed for '{}': {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        let mut stat: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut stat) == -1 {
            let err = std::io::Error::last_os_error();
            close(fd);
            return Err(ShmError::File(format!("fstat failed: {err}")));
        }
        let file_size = stat.st_size as usize;
        if file_size < SHM_HEADER_SIZE {
            close(fd);
            return Err(ShmError::InvalidHeader(format!(
                "file is only {file_size} bytes"
            )));
        }

        let header_map = mmap(ptr::null_mut(), SHM_HEADER_SIZE, PROT_READ, MAP_SHARED, fd, 0);
        if header_map == MAP_FAILED {
            let err = std::io::Error::last_os_error();
            close(fd);
            return Err(ShmError::Mmap(format!("mmap header failed: {err}")));
        }

        let header = &*(header_map as *const RingHeader);
        let check = header.validate(file_size);
        munmap(header_map, SHM_HEADER_SIZE);
        if let Err(e) = check {
            close(fd);
            return Err(e);
        }

        let raw = mmap(
            ptr::null_mut(),
            file_size,
            PROT_READ | PROT_WRITE,
            MAP_SHARED,
            fd,
            0,
        );
        if raw == MAP_FAILED {
            let err = std::io::Error::last_os_error();
            close(fd);
            return Err(ShmError::Mmap(format!("mmap failed: {err}")));
        }

        Ok((raw as *mut u8, fd, file_size))
    }
}

/// Unmaps and closes a mapping made by the helpers above.
///
/// # Safety
///
/// Must be called exactly once per mapping; the pointer is dead afterwards.
pub(crate) unsafe fn close_ring_file(ptr: *mut u8, size: usize, fd: libc::c_int) {
    if !ptr.is_null() {
        munmap(ptr as *mut c_void, size);
    }
    if fd >= 0 {
        close(fd);
    }
}
