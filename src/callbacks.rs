#[cfg(windows)]
use core::ffi::c_void;
#[cfg(unix)]
use libc::{c_void, mprotect, sysconf};
#[cfg(windows)]
use windows_sys::Win32::Foundation::GetLastError;
#[cfg(windows)]
use windows_sys::Win32::System::Memory::VirtualProtect;

/// The trait which is called before and after code bytes are rewritten.
/// Usually is used to suspend and resume all other threads, so that no thread
/// runs half-written instructions.
pub trait ThreadOperatingCallback: Sync {
    /// Suspends the other threads. Returns an opaque context passed back to
    /// `resume`, or an os error code.
    fn suspend(&self) -> Result<usize, u32>;
    /// Resumes the threads suspended by `suspend`.
    fn resume(&self, ctx: usize);
}

/// The trait which makes code writable before patching and restores the
/// original protection afterwards.
pub trait CodeProtectModifyingCallback: Sync {
    /// Sets `[addr, addr + len)` readable, writable and executable. Returns the
    /// old protection, or an os error code.
    fn set_protect_to_rwe(&self, addr: usize, len: usize) -> Result<u64, u32>;
    /// Restores the protection returned by `set_protect_to_rwe`.
    fn recover_protect(&self, addr: usize, len: usize, old_prot: u64);
}

/// Protection changes through `VirtualProtect` or `mprotect`.
pub struct DefaultCodeProtect;

impl CodeProtectModifyingCallback for DefaultCodeProtect {
    fn set_protect_to_rwe(&self, addr: usize, len: usize) -> Result<u64, u32> {
        modify_mem_protect_to_rwe(addr, len)
    }

    fn recover_protect(&self, addr: usize, len: usize, old_prot: u64) {
        recover_mem_protect(addr, len, old_prot)
    }
}

/// The protect callback used by `HookOptions::default()`.
pub static DEFAULT_CODE_PROTECT: DefaultCodeProtect = DefaultCodeProtect;

/// Callbacks used while writing code bytes.
#[derive(Clone, Copy)]
pub struct HookOptions {
    /// Makes the patched code and the trampolines writable and executable.
    /// `None` means the caller already did.
    pub code_protect_cb: Option<&'static dyn CodeProtectModifyingCallback>,
    /// Suspends other threads around each write.
    pub thread_cb: Option<&'static dyn ThreadOperatingCallback>,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            code_protect_cb: Some(&DEFAULT_CODE_PROTECT),
            thread_cb: None,
        }
    }
}

impl HookOptions {
    /// No protection changes and no thread suspension.
    pub fn unprotected() -> Self {
        Self {
            code_protect_cb: None,
            thread_cb: None,
        }
    }
}

#[cfg(windows)]
fn modify_mem_protect_to_rwe(addr: usize, len: usize) -> Result<u64, u32> {
    let mut old_prot: u32 = 0;
    let old_prot_ptr = std::ptr::addr_of_mut!(old_prot);
    // PAGE_EXECUTE_READWRITE = 0x40
    let ret = unsafe { VirtualProtect(addr as *const c_void, len, 0x40, old_prot_ptr) };
    if ret == 0 {
        Err(unsafe { GetLastError() })
    } else {
        Ok(old_prot as u64)
    }
}

#[cfg(unix)]
fn page_range(addr: usize, len: usize) -> (usize, usize) {
    let page_size = unsafe { sysconf(libc::_SC_PAGESIZE) } as usize;
    let start = addr & !(page_size - 1);
    let end = (addr + len.max(1) + page_size - 1) & !(page_size - 1);
    (start, end - start)
}

#[cfg(unix)]
fn modify_mem_protect_to_rwe(addr: usize, len: usize) -> Result<u64, u32> {
    let (start, size) = page_range(addr, len);
    let ret = unsafe {
        mprotect(
            start as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        Err(err.raw_os_error().unwrap_or(0) as u32)
    } else {
        // it's too complex to get the original memory protection
        Ok(7)
    }
}

#[cfg(windows)]
fn recover_mem_protect(addr: usize, len: usize, old: u64) {
    let mut old_prot: u32 = 0;
    let old_prot_ptr = std::ptr::addr_of_mut!(old_prot);
    unsafe { VirtualProtect(addr as *const c_void, len, old as u32, old_prot_ptr) };
}

#[cfg(unix)]
fn recover_mem_protect(addr: usize, len: usize, old: u64) {
    let (start, size) = page_range(addr, len);
    unsafe { mprotect(start as *mut c_void, size, old as i32) };
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_unix_protect_reports_rwx() {
        let mut buf = vec![0u8; 64];
        let addr = buf.as_mut_ptr() as usize;
        let old = DEFAULT_CODE_PROTECT.set_protect_to_rwe(addr, buf.len()).unwrap();
        assert_eq!(old, 7);
        DEFAULT_CODE_PROTECT.recover_protect(addr, buf.len(), old);
        // recovering must not take write access away from the heap
        buf[0] = 1;
        assert_eq!(std::hint::black_box(&buf)[0], 1);
    }
}
