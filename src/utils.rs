use crate::callbacks::*;
use crate::err::HookError;

pub(crate) struct MemoryProtectGuard {
    cb: Option<&'static dyn CodeProtectModifyingCallback>,
    addr: usize,
    len: usize,
}

impl MemoryProtectGuard {
    pub fn new(cb: Option<&'static dyn CodeProtectModifyingCallback>, addr: usize, len: usize) -> Self {
        Self { cb, addr, len }
    }

    pub fn run<T, F>(self, func: F) -> Result<T, HookError>
    where
        F: FnOnce() -> Result<T, HookError>,
    {
        let old_protect = self
            .cb
            .map(|cb| cb.set_protect_to_rwe(self.addr, self.len))
            .map_or(Ok(None), |v| v.map(Some).map_err(HookError::MemoryProtect))?;
        let ret = func();

        if let (Some(cb), Some(prot)) = (self.cb, old_protect) {
            cb.recover_protect(self.addr, self.len, prot);
        }
        ret
    }
}

pub(crate) struct ThreadSuspendingGuard {
    cb: Option<&'static dyn ThreadOperatingCallback>,
}

impl ThreadSuspendingGuard {
    pub fn new(cb: Option<&'static dyn ThreadOperatingCallback>) -> Self {
        Self { cb }
    }

    pub fn run<T, F>(self, func: F) -> Result<T, HookError>
    where
        F: FnOnce() -> Result<T, HookError>,
    {
        let ctx = self
            .cb
            .map(|cb| cb.suspend())
            .map_or(Ok(None), |v| v.map(Some).map_err(HookError::ThreadSuspending))?;
        let ret = func();

        if let (Some(cb), Some(ctx)) = (self.cb, ctx) {
            cb.resume(ctx);
        }
        ret
    }
}

/// Writes `bytes` to `addr` with the other threads suspended and the page made
/// writable for the duration of the write.
pub(crate) fn write_code(
    addr: usize,
    bytes: &[u8],
    protect_cb: Option<&'static dyn CodeProtectModifyingCallback>,
    thread_cb: Option<&'static dyn ThreadOperatingCallback>,
) -> Result<(), HookError> {
    ThreadSuspendingGuard::new(thread_cb).run(|| {
        MemoryProtectGuard::new(protect_cb, addr, bytes.len()).run(|| {
            let buf = unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, bytes.len()) };
            buf.copy_from_slice(bytes);
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingThreads {
        suspended: AtomicUsize,
        resumed: AtomicUsize,
    }

    impl ThreadOperatingCallback for CountingThreads {
        fn suspend(&self) -> Result<usize, u32> {
            self.suspended.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        }
        fn resume(&self, ctx: usize) {
            assert_eq!(ctx, 7);
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    static THREADS: CountingThreads = CountingThreads {
        suspended: AtomicUsize::new(0),
        resumed: AtomicUsize::new(0),
    };

    #[test]
    fn test_write_code_suspends_threads() {
        let mut buf = [0u8; 4];
        write_code(buf.as_mut_ptr() as usize, &[1, 2, 3, 4], None, Some(&THREADS)).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(THREADS.suspended.load(Ordering::SeqCst), 1);
        assert_eq!(THREADS.resumed.load(Ordering::SeqCst), 1);
    }

    struct FailingProtect;

    impl CodeProtectModifyingCallback for FailingProtect {
        fn set_protect_to_rwe(&self, _: usize, _: usize) -> Result<u64, u32> {
            Err(5)
        }
        fn recover_protect(&self, _: usize, _: usize, _: u64) {
            panic!("nothing to recover");
        }
    }

    static FAILING: FailingProtect = FailingProtect;

    #[test]
    fn test_protect_failure_skips_write() {
        let mut buf = [0u8; 2];
        let ret = write_code(buf.as_mut_ptr() as usize, &[9, 9], Some(&FAILING), None);
        assert!(matches!(ret, Err(HookError::MemoryProtect(5))));
        assert_eq!(buf, [0, 0]);
    }
}
