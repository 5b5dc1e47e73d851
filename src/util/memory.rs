//! OS memory operations.
//!
//! The reserved heap range and the triggered-locals page are managed with
//! raw mmap/mprotect calls: reservation quarantines a range with `PROT_NONE`,
//! committing a run of regions replaces it with demand-zero readable/writable
//! pages, and uncommitting re-quarantines it. All failures surface as
//! `std::io::Result` so callers decide what is fatal.

use std::io::{Error, Result};

use crate::util::Address;

/// Memory protection for committed memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmapProtection {
    /// Readable and writable data pages.
    ReadWrite,
    /// No access permitted; reads and writes fault.
    NoAccess,
}

impl MmapProtection {
    fn get_native_flags(self) -> libc::c_int {
        match self {
            Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Self::NoAccess => libc::PROT_NONE,
        }
    }
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Reserve `size` bytes of virtual address space anywhere, without backing
/// memory. The range is quarantined with `PROT_NONE` until committed.
pub fn reserve_address_space(size: usize) -> Result<Address> {
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(ptr))
    }
}

/// Commit a range inside a reserved span: map demand-zero pages over it.
pub fn commit(start: Address, size: usize) -> Result<()> {
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_FIXED;
    let prot = MmapProtection::ReadWrite.get_native_flags();
    wrap_libc_call(
        &|| unsafe { libc::mmap(start.to_mut_ptr(), size, prot, flags, -1, 0) },
        start.to_mut_ptr(),
    )
}

/// Uncommit a previously committed range: re-quarantine it with `PROT_NONE`,
/// returning the backing pages to the OS.
pub fn uncommit(start: Address, size: usize) -> Result<()> {
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_NORESERVE;
    wrap_libc_call(
        &|| unsafe { libc::mmap(start.to_mut_ptr(), size, libc::PROT_NONE, flags, -1, 0) },
        start.to_mut_ptr(),
    )
}

/// Unmap a memory region.
pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Change the protection of a memory region to no access, so that any read
/// or write faults. Used to arm the triggered-locals page.
pub fn protect(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, libc::PROT_NONE) },
        0,
    )
}

/// Change the protection of a memory region to the given protection.
pub fn unprotect(start: Address, size: usize, prot: MmapProtection) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot.get_native_flags()) },
        0,
    )
}

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

/// Set a range of memory to the given value. Similar to memset.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), val, len);
    }
}
