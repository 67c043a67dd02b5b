use std::ffi::c_void;
use std::io;

/// Maps an anonymous private region with the given extra mmap flags.
///
/// The region is mapped readable and writable. `MAP_POPULATE` and huge-page
/// flags are supplied by the caller.
///
/// # Errors
///
/// Returns the mmap errno on failure.
pub fn mmap_anonymous(len: usize, extra_flags: libc::c_int) -> io::Result<*mut u8> {
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(p as *mut u8)
}

/// Revokes write access and makes the region executable.
///
/// # Safety
///
/// `ptr` must be the start of a region previously returned by
/// [`mmap_anonymous`] and `len` must not exceed its length.
pub unsafe fn mprotect_exec(ptr: *mut u8, len: usize) -> io::Result<()> {
    let r = unsafe { libc::mprotect(ptr as *mut c_void, len, libc::PROT_READ | libc::PROT_EXEC) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Unmap memory
///
/// # Safety
/// * `addr` must be a valid pointer to a memory region previously allocated by `mmap`
/// * `len` must be less than or equal the length as the memory region previously allocated by `mmap`
pub unsafe fn munmap(addr: *mut u8, len: usize) {
    let r = unsafe { libc::munmap(addr as *mut c_void, len) };
    assert_eq!(
        r,
        0,
        "munmap({:x}, {}): {}",
        addr as usize,
        len,
        io::Error::last_os_error()
    );
}
