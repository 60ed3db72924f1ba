//! Named shared-memory regions carrying one fork request each.
//!
//! Layout: `[ size:u32-le | json payload | optional stdin bytes ]`. Only the
//! region *name* travels over the control pipe; unlink responsibility is
//! explicit. The controller owns a region until the supervisor replies
//! `CHILD:`; from then on the forked child owns it and unlinks the name. An
//! `ERR:` reply leaves ownership (and the unlink) with the controller.

use crate::errors::PrewarmError;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

/// Width of the payload size prefix at the start of every region.
pub const SIZE_PREFIX_BYTES: usize = 4;

pub struct SharedMemory {
    name: String,
    ptr: NonNull<libc::c_void>,
    len: usize,
    pos: usize,
    unlink_on_drop: bool,
}

impl SharedMemory {
    /// Create a fresh region of exactly `size` bytes under a unique name.
    /// The creator owns the name: it is unlinked on drop unless ownership is
    /// handed off with [`set_unlink_on_drop`](Self::set_unlink_on_drop).
    pub fn create(size: usize) -> Result<Self, PrewarmError> {
        let name = format!("/kitty-prewarm-{}", uuid::Uuid::new_v4().simple());
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| PrewarmError::ShmMissing {
            name: name.clone(),
            source: std::io::Error::from(errno),
        })?;
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            let _ = shm_unlink(name.as_str());
            return Err(PrewarmError::ShmMissing { name, source: err });
        }
        let ptr = map(&fd, size).map_err(|source| {
            let _ = shm_unlink(name.as_str());
            PrewarmError::ShmMissing {
                name: name.clone(),
                source,
            }
        })?;
        Ok(Self {
            name,
            ptr,
            len: size,
            pos: 0,
            unlink_on_drop: true,
        })
    }

    /// Map an existing region read-write without taking name ownership.
    pub fn open(name: &str) -> Result<Self, PrewarmError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|errno| {
            PrewarmError::ShmMissing {
                name: name.to_string(),
                source: std::io::Error::from(errno),
            }
        })?;
        let len = region_len(fd.as_raw_fd()).map_err(|source| PrewarmError::ShmMissing {
            name: name.to_string(),
            source,
        })?;
        let ptr = map(&fd, len).map_err(|source| PrewarmError::ShmMissing {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            pos: 0,
            unlink_on_drop: false,
        })
    }

    /// Map an existing region and take ownership: the name is unlinked
    /// immediately, the mapping stays valid until drop.
    pub fn adopt(name: &str) -> Result<Self, PrewarmError> {
        let shm = Self::open(name)?;
        let _ = shm_unlink(name);
        Ok(shm)
    }

    /// Remove a region by name without mapping it.
    pub fn unlink_region(name: &str) -> Result<(), PrewarmError> {
        shm_unlink(name).map_err(|errno| PrewarmError::ShmMissing {
            name: name.to_string(),
            source: std::io::Error::from(errno),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current read/write offset within the region.
    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn set_unlink_on_drop(&mut self, yes: bool) {
        self.unlink_on_drop = yes;
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    /// Append raw bytes at the current offset.
    pub fn write(&mut self, data: &[u8]) -> Result<(), PrewarmError> {
        if self.pos + data.len() > self.len {
            return Err(PrewarmError::ShmTruncated {
                name: self.name.clone(),
                need: self.pos + data.len(),
                have: self.len,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.ptr.as_ptr() as *mut u8).add(self.pos),
                data.len(),
            );
        }
        self.pos += data.len();
        Ok(())
    }

    /// Write the size prefix followed by `data`.
    pub fn write_data_with_size(&mut self, data: &[u8]) -> Result<(), PrewarmError> {
        self.write(&(data.len() as u32).to_le_bytes())?;
        self.write(data)
    }

    /// Read the size-prefixed payload at the current offset.
    pub fn read_data_with_size(&mut self) -> Result<Vec<u8>, PrewarmError> {
        if self.pos + SIZE_PREFIX_BYTES > self.len {
            return Err(PrewarmError::ShmTruncated {
                name: self.name.clone(),
                need: self.pos + SIZE_PREFIX_BYTES,
                have: self.len,
            });
        }
        let mut prefix = [0u8; SIZE_PREFIX_BYTES];
        prefix.copy_from_slice(&self.bytes()[self.pos..self.pos + SIZE_PREFIX_BYTES]);
        let size = u32::from_le_bytes(prefix) as usize;
        let start = self.pos + SIZE_PREFIX_BYTES;
        if start + size > self.len {
            return Err(PrewarmError::ShmTruncated {
                name: self.name.clone(),
                need: start + size,
                have: self.len,
            });
        }
        let data = self.bytes()[start..start + size].to_vec();
        self.pos = start + size;
        Ok(data)
    }

    /// Borrow `size` bytes starting at `start`.
    pub fn slice(&self, start: usize, size: usize) -> Result<&[u8], PrewarmError> {
        if start + size > self.len {
            return Err(PrewarmError::ShmTruncated {
                name: self.name.clone(),
                need: start + size,
                have: self.len,
            });
        }
        Ok(&self.bytes()[start..start + size])
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
        if self.unlink_on_drop {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

fn map<F: std::os::fd::AsFd>(fd: &F, len: usize) -> std::io::Result<NonNull<libc::c_void>> {
    let len = NonZeroUsize::new(len)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty region"))?;
    unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(std::io::Error::from)
}

fn region_len(fd: std::os::fd::RawFd) -> std::io::Result<usize> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, st.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { st.assume_init() }.st_size as usize)
}

/// Read adapter over the stdin slice of an adopted region.
///
/// Installed as a child's input stream; dropping it releases the mapping.
pub struct SharedReader {
    shm: SharedMemory,
    pos: usize,
    end: usize,
}

impl SharedReader {
    pub fn new(shm: SharedMemory, start: usize, size: usize) -> Result<Self, PrewarmError> {
        if start + size > shm.len() {
            return Err(PrewarmError::ShmTruncated {
                name: shm.name().to_string(),
                need: start + size,
                have: shm.len(),
            });
        }
        Ok(Self {
            shm,
            pos: start,
            end: start + size,
        })
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }
}

impl std::io::Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.end - self.pos);
        if n > 0 {
            buf[..n].copy_from_slice(&self.shm.bytes()[self.pos..self.pos + n]);
            self.pos += n;
        }
        Ok(n)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_write_then_reopen_and_read() {
        let payload = br#"{"argv":["echo"]}"#;
        let mut region = SharedMemory::create(SIZE_PREFIX_BYTES + payload.len() + 5).unwrap();
        region.write_data_with_size(payload).unwrap();
        region.write(b"hello").unwrap();

        let mut other = SharedMemory::open(region.name()).unwrap();
        assert_eq!(other.read_data_with_size().unwrap(), payload);
        let at = other.tell();
        assert_eq!(other.slice(at, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_create_unlinks_on_drop() {
        let region = SharedMemory::create(16).unwrap();
        let name = region.name().to_string();
        drop(region);
        assert!(matches!(
            SharedMemory::open(&name),
            Err(PrewarmError::ShmMissing { .. })
        ));
    }

    #[test]
    fn test_ownership_handoff_suppresses_unlink() {
        let mut region = SharedMemory::create(16).unwrap();
        let name = region.name().to_string();
        region.set_unlink_on_drop(false);
        drop(region);

        // Still there: the adopting side unlinks it
        let adopted = SharedMemory::adopt(&name).unwrap();
        assert!(matches!(
            SharedMemory::open(&name),
            Err(PrewarmError::ShmMissing { .. })
        ));
        drop(adopted);
    }

    #[test]
    fn test_truncated_size_prefix_is_rejected() {
        let mut region = SharedMemory::create(SIZE_PREFIX_BYTES + 2).unwrap();
        // Size prefix claims more bytes than the region holds
        region.write(&100u32.to_le_bytes()).unwrap();

        let mut other = SharedMemory::open(region.name()).unwrap();
        assert!(matches!(
            other.read_data_with_size(),
            Err(PrewarmError::ShmTruncated { .. })
        ));
    }

    #[test]
    fn test_write_past_end_is_rejected() {
        let mut region = SharedMemory::create(4).unwrap();
        assert!(region.write(b"12345").is_err());
    }

    #[test]
    fn test_missing_region() {
        assert!(matches!(
            SharedMemory::open("/kitty-prewarm-does-not-exist"),
            Err(PrewarmError::ShmMissing { .. })
        ));
    }

    #[test]
    fn test_shared_reader_yields_exact_bytes() {
        let mut region = SharedMemory::create(SIZE_PREFIX_BYTES + 2 + 11).unwrap();
        region.write_data_with_size(b"{}").unwrap();
        let stdin_at = region.tell();
        region.write(b"hello world").unwrap();
        region.set_unlink_on_drop(false);
        let name = region.name().to_string();
        drop(region);

        let adopted = SharedMemory::adopt(&name).unwrap();
        let mut reader = SharedReader::new(adopted, stdin_at, 11).unwrap();
        assert_eq!(reader.remaining(), 11);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(reader.remaining(), 0);
    }
}
