use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use tracing::debug;

use crate::error::Result;

/// A plugin module mapped read-only into the process.
///
/// The mapping makes the module visible in `/proc/<pid>/maps` for as long
/// as the value lives.
#[derive(Debug)]
pub struct MappedModule {
    path: PathBuf,
    addr: NonNull<libc::c_void>,
    len: usize,
}

impl MappedModule {
    pub fn open(path: &Path) -> Result<Self> {
        let path = path.canonicalize()?;
        let file = File::open(&path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "module is too large"))?;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("module is empty: {}", path.display()),
            )
            .into());
        }

        // SAFETY: a fresh private read-only mapping of an open file; the
        // result is checked before use and the descriptor may close after.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let addr = NonNull::new(addr)
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;

        debug!(module = %path.display(), len, "Mapped module");
        Ok(Self { path, addr, len })
    }

    /// Canonical path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedModule {
    fn drop(&mut self) {
        // SAFETY: addr and len describe a mapping created in `open` that is
        // unmapped exactly once, here.
        unsafe {
            libc::munmap(self.addr.as_ptr(), self.len);
        }
    }
}
