//! POSIX shared memory objects mapped `MAP_SHARED`.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

/// One mapping of a named shared memory object.
///
/// The object can change size underneath us (the server grows or shrinks
/// it on resize), so the mapped length is tracked separately from the file
/// size and only changed through [`ShmMapping::resize`] or
/// [`ShmMapping::remap`].
pub struct ShmMapping {
    ptr: NonNull<u8>,
    len: usize,
    fd: OwnedFd,
}

// SAFETY: the mapping is plain shared memory valid until drop; all
// concurrent access to it goes through atomics or the single-writer rules
// of the page layout.
unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}

impl ShmMapping {
    /// Create a new object of `len` zeroed bytes. Fails with `AlreadyExists`
    /// if the name is taken.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let c_name = c_name(name)?;
        let fd = shm_open(&c_name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;

        let mapped = truncate(&fd, len).and_then(|()| map(&fd, len));
        match mapped {
            Ok(ptr) => Ok(Self { ptr, len, fd }),
            Err(e) => {
                // SAFETY: c_name is a valid NUL-terminated string.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                Err(e)
            }
        }
    }

    /// Open an existing object and map all of it.
    pub fn open(name: &str) -> io::Result<Self> {
        let c_name = c_name(name)?;
        let fd = shm_open(&c_name, libc::O_RDWR)?;

        // SAFETY: fstat only writes into the provided struct.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let len = stat.st_size as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared memory object is empty",
            ));
        }

        let ptr = map(&fd, len)?;
        Ok(Self { ptr, len, fd })
    }

    /// Remove the name. Existing mappings stay valid.
    pub fn unlink(name: &str) -> io::Result<()> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Change the object's size and map it again at the new size.
    ///
    /// Owner side only. Every pointer into the old mapping is invalid
    /// afterwards.
    pub fn resize(&mut self, len: usize) -> io::Result<()> {
        truncate(&self.fd, len)?;
        self.remap(len)
    }

    /// Map the object again at `len` bytes without touching its size.
    ///
    /// Used by the non-owning side after the owner published a new size.
    pub fn remap(&mut self, len: usize) -> io::Result<()> {
        let ptr = map(&self.fd, len)?;
        let old = std::mem::replace(&mut self.ptr, ptr);
        let old_len = std::mem::replace(&mut self.len, len);
        unmap(old, old_len);
        Ok(())
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        unmap(self.ptr, self.len);
    }
}

impl std::fmt::Debug for ShmMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmMapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn shm_open(name: &CString, flags: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: name is a valid NUL-terminated string.
    #[cfg(target_os = "macos")]
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o700 as libc::c_uint) };
    #[cfg(not(target_os = "macos"))]
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o700 as libc::mode_t) };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: shm_open returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn truncate(fd: &OwnedFd, len: usize) -> io::Result<()> {
    let len = libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment size overflow"))?;
    // SAFETY: fd is a valid open descriptor.
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn map(fd: &OwnedFd, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: fresh mapping chosen by the kernel; fd is valid.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

fn unmap(ptr: NonNull<u8>, len: usize) {
    // SAFETY: ptr/len describe a mapping created by `map` and not yet unmapped.
    if unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) } < 0 {
        tracing::error!(
            error = %io::Error::last_os_error(),
            len,
            "munmap failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{test_key, KeyRole};

    #[test]
    fn create_open_and_grow() {
        let name = test_key().name(KeyRole::Memory);
        let mut owner = ShmMapping::create(&name, 4096).unwrap();
        // SAFETY: 4096 bytes are mapped.
        unsafe { *owner.as_ptr().add(100) = 0xAB };

        let mut peer = ShmMapping::open(&name).unwrap();
        assert_eq!(peer.len(), 4096);
        assert_eq!(unsafe { *peer.as_ptr().add(100) }, 0xAB);

        owner.resize(3 * 4096).unwrap();
        unsafe { *owner.as_ptr().add(2 * 4096 + 7) = 0xCD };
        peer.remap(3 * 4096).unwrap();
        assert_eq!(unsafe { *peer.as_ptr().add(2 * 4096 + 7) }, 0xCD);
        assert_eq!(unsafe { *peer.as_ptr().add(100) }, 0xAB);

        ShmMapping::unlink(&name).unwrap();
        ShmMapping::unlink(&name).unwrap();
        assert!(ShmMapping::open(&name).is_err());
    }

    #[test]
    fn exclusive_create_refuses_existing_name() {
        let name = test_key().name(KeyRole::Memory);
        let _first = ShmMapping::create(&name, 4096).unwrap();
        let err = ShmMapping::create(&name, 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        ShmMapping::unlink(&name).unwrap();
    }
}
