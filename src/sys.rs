//! OS virtual-memory calls.
//!
//! Everything that talks to the kernel's page tables goes through here:
//! reserving address space, committing and decommitting pages inside a
//! reservation, moveable remapping, and file-backed fixed mapping for the
//! pseudo-page engine. Failures carry the operation name and the errno;
//! callers treat them as fatal (see the crate docs on error handling).

use core::fmt;
use core::ptr::{self, NonNull};

use errno::{errno, Errno};

/// An OS mapping call that failed, with its errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysError {
    /// Which call failed (`"mmap"`, `"mremap"`, ...).
    pub op: &'static str,
    pub errno: Errno,
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.op, self.errno)
    }
}

impl std::error::Error for SysError {}

fn last_error(op: &'static str) -> SysError {
    SysError { op, errno: errno() }
}

/// The system page size, in bytes.
pub fn page_size() -> usize {
    sysconf::page::pagesize()
}

/// Reserve `len` bytes of address space without backing memory.
///
/// The region is `PROT_NONE` and `MAP_NORESERVE`: touching it faults, and
/// it costs no swap. Pages inside it are later committed with
/// [`commit`] or mapped over with [`map_shared_fixed`].
pub fn reserve(len: usize) -> Result<NonNull<u8>, SysError> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(last_error("mmap"));
    }
    // mmap never hands out the null page.
    Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
}

/// Commit `len` bytes of read/write anonymous memory at exactly `addr`.
///
/// `addr` must lie inside a region this process owns (a reservation from
/// [`reserve`]); `MAP_FIXED` replaces whatever mapping was there.
pub fn commit(addr: *mut u8, len: usize) -> Result<(), SysError> {
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(last_error("mmap"));
    }
    Ok(())
}

/// Release the backing memory of `len` bytes at `addr`, keeping the
/// address range reserved.
///
/// The range is replaced with a fresh `PROT_NONE`/`MAP_NORESERVE`
/// mapping, so the kernel may reclaim the pages but the addresses stay
/// owned by this process and can be committed again later.
pub fn decommit(addr: *mut u8, len: usize) -> Result<(), SysError> {
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(last_error("mmap"));
    }
    Ok(())
}

/// Unmap `len` bytes at `addr` entirely, returning the address range to
/// the OS.
pub fn unmap(addr: *mut u8, len: usize) -> Result<(), SysError> {
    let ret = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if ret != 0 {
        return Err(last_error("munmap"));
    }
    Ok(())
}

/// Resize the mapping at `addr` from `old_len` to `new_len` bytes,
/// letting the kernel move it. Returns the (possibly new) base address.
pub fn remap_move(addr: *mut u8, old_len: usize, new_len: usize) -> Result<NonNull<u8>, SysError> {
    let ret = unsafe {
        libc::mremap(
            addr as *mut libc::c_void,
            old_len,
            new_len,
            libc::MREMAP_MAYMOVE,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(last_error("mremap"));
    }
    Ok(unsafe { NonNull::new_unchecked(ret as *mut u8) })
}

/// Map `len` bytes of `fd` at file offset `offset` to exactly `addr`,
/// shared and read/write.
///
/// This is how pseudo-pages are bound: the page provider's fd addresses
/// physical page `id` at offset `id * page_size`, and the same offset may
/// be mapped at several virtual addresses at once.
pub fn map_shared_fixed(
    addr: *mut u8,
    len: usize,
    fd: libc::c_int,
    offset: i64,
) -> Result<(), SysError> {
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(last_error("mmap"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_page_size_sane() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn test_reserve_commit_decommit() {
        let ps = page_size();
        let base = reserve(4 * ps).unwrap().as_ptr();

        commit(base, 2 * ps).unwrap();
        unsafe {
            base.write(0xa5);
            base.add(2 * ps - 1).write(0x5a);
            assert_eq!(base.read(), 0xa5);
        }

        // Decommit and commit again: the contents are gone but the
        // addresses still work.
        decommit(base, 2 * ps).unwrap();
        commit(base, ps).unwrap();
        unsafe { assert_eq!(base.read(), 0) };

        unmap(base, 4 * ps).unwrap();
    }

    #[test]
    fn test_remap_preserves_contents() {
        let ps = page_size();
        let mut base = reserve(ps).unwrap().as_ptr();
        commit(base, ps).unwrap();
        unsafe { base.write_bytes(0x77, ps) };

        base = remap_move(base, ps, 4 * ps).unwrap().as_ptr();
        unsafe {
            assert_eq!(base.read(), 0x77);
            assert_eq!(base.add(ps - 1).read(), 0x77);
        }
        unmap(base, 4 * ps).unwrap();
    }
}
