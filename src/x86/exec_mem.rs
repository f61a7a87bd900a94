//! Executable slots for capture stubs.
//!
//! Slots are carved out of dedicated RWX chunks and never handed back. A
//! thread may still be running a stub or its cave after the site is
//! restored, so the bytes have to stay mapped for the life of the process.

use std::sync::Mutex;

use crate::err::HookError;

#[cfg(windows)]
use core::ffi::c_void;
#[cfg(windows)]
use windows_sys::Win32::Foundation::GetLastError;
#[cfg(windows)]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
};

pub(super) const SLOT_LEN: usize = 256;
const CHUNK_LEN: usize = 0x10000;

struct Arena {
    next: usize,
    end: usize,
}

static ARENA: Mutex<Arena> = Mutex::new(Arena { next: 0, end: 0 });

/// Hands out a zeroed, executable `SLOT_LEN`-byte slot.
pub(super) fn alloc_slot() -> Result<usize, HookError> {
    let mut arena = ARENA.lock().unwrap_or_else(|e| e.into_inner());
    if arena.next + SLOT_LEN > arena.end {
        let chunk = map_chunk(CHUNK_LEN)?;
        log::debug!("mapped stub chunk at {:#x}", chunk);
        arena.next = chunk;
        arena.end = chunk + CHUNK_LEN;
    }
    let slot = arena.next;
    arena.next += SLOT_LEN;
    Ok(slot)
}

#[cfg(unix)]
fn map_chunk(len: usize) -> Result<usize, HookError> {
    let mem = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        return Err(HookError::MemoryProtect(err.raw_os_error().unwrap_or(0) as u32));
    }
    Ok(mem as usize)
}

#[cfg(windows)]
fn map_chunk(len: usize) -> Result<usize, HookError> {
    let mem = unsafe {
        VirtualAlloc(
            std::ptr::null::<c_void>(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if mem.is_null() {
        return Err(HookError::MemoryProtect(unsafe { GetLastError() }));
    }
    Ok(mem as usize)
}
