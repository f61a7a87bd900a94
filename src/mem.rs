//! Access to the hooked process's memory from trap-time code.
//!
//! Addresses are 32-bit, matching the register snapshot. Every access is
//! fallible so that operands pointing at garbage degrade to "absent" instead
//! of faulting the host.

/// Reads and writes process memory at addresses taken from a trap.
pub trait Memory: Send + Sync {
    /// Fills `buf` from `addr`. Returns false if the range isn't accessible.
    fn read(&self, addr: u32, buf: &mut [u8]) -> bool;

    /// Writes `data` to `addr`. Returns false if the range isn't accessible.
    fn write(&self, addr: u32, data: &[u8]) -> bool;

    /// Reads a little-endian dword.
    fn read_u32(&self, addr: u32) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf).then(|| u32::from_le_bytes(buf))
    }

    /// Writes a little-endian dword.
    fn write_u32(&self, addr: u32, value: u32) -> bool {
        self.write(addr, &value.to_le_bytes())
    }

    /// Reads a NUL-terminated string of at most `max` bytes.
    fn read_cstr(&self, addr: u32, max: usize) -> Option<String> {
        let mut bytes = Vec::new();
        for i in 0..max {
            let mut b = [0u8];
            if !self.read(addr.wrapping_add(i as u32), &mut b) {
                return None;
            }
            if b[0] == 0 {
                return Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(b[0]);
        }
        None
    }
}

/// The memory of the current process.
///
/// Ranges are checked before they're touched: `VirtualQuery` on Windows,
/// and the kernel's own copy through `process_vm_readv`/`process_vm_writev`
/// on Linux. Anything not mapped with the needed access reads as absent.
pub struct ProcessMemory;

const NULL_PAGE: u32 = 0x1000;

impl Memory for ProcessMemory {
    fn read(&self, addr: u32, buf: &mut [u8]) -> bool {
        if addr < NULL_PAGE {
            return false;
        }
        os::read(addr as usize, buf)
    }

    fn write(&self, addr: u32, data: &[u8]) -> bool {
        if addr < NULL_PAGE {
            return false;
        }
        os::write(addr as usize, data)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod os {
    use libc::{c_void, iovec};

    pub fn read(addr: usize, buf: &mut [u8]) -> bool {
        let local = iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let remote = iovec {
            iov_base: addr as *mut c_void,
            iov_len: buf.len(),
        };
        let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        n == buf.len() as isize
    }

    pub fn write(addr: usize, data: &[u8]) -> bool {
        let local = iovec {
            iov_base: data.as_ptr() as *mut c_void,
            iov_len: data.len(),
        };
        let remote = iovec {
            iov_base: addr as *mut c_void,
            iov_len: data.len(),
        };
        let n = unsafe { libc::process_vm_writev(libc::getpid(), &local, 1, &remote, 1, 0) };
        n == data.len() as isize
    }
}

#[cfg(windows)]
mod os {
    use core::ffi::c_void;
    use std::mem::{size_of, MaybeUninit};

    use windows_sys::Win32::System::Memory::{
        VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE_READWRITE,
        PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
        PAGE_READWRITE, PAGE_WRITECOPY,
    };

    fn writable(prot: PAGE_PROTECTION_FLAGS) -> bool {
        prot & (PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY)
            != 0
    }

    // Walks the regions covering the range; each must be committed and allow
    // the access.
    fn accessible(addr: usize, len: usize, write: bool) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        let mut cur = addr;
        while cur < end {
            let mut mbi = MaybeUninit::<MEMORY_BASIC_INFORMATION>::zeroed();
            let ret = unsafe {
                VirtualQuery(
                    cur as *const c_void,
                    mbi.as_mut_ptr(),
                    size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if ret == 0 {
                return false;
            }
            let mbi = unsafe { mbi.assume_init() };
            if mbi.State != MEM_COMMIT
                || mbi.Protect & (PAGE_NOACCESS | PAGE_GUARD) != 0
                || (write && !writable(mbi.Protect))
            {
                return false;
            }
            cur = mbi.BaseAddress as usize + mbi.RegionSize;
        }
        true
    }

    pub fn read(addr: usize, buf: &mut [u8]) -> bool {
        if !accessible(addr, buf.len(), false) {
            return false;
        }
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        true
    }

    pub fn write(addr: usize, data: &[u8]) -> bool {
        if !accessible(addr, data.len(), true) {
            return false;
        }
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
        true
    }
}

// No range check available; only the null page is caught.
#[cfg(not(any(windows, target_os = "linux", target_os = "android")))]
mod os {
    pub fn read(addr: usize, buf: &mut [u8]) -> bool {
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        true
    }

    pub fn write(addr: usize, data: &[u8]) -> bool {
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
        true
    }
}
