//! Chains of replacement implementations over one function pointer slot,
//! usually an import table entry.
//!
//! Every link is a handler plus a `next` cell the handler forwards through.
//! The slot points at the last installed handler, whose `next` holds the
//! handler installed before it, down to the original function.

use std::collections::HashMap;
use std::slice;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use goblin::pe::header::Header;
use goblin::pe::options::ParseOptions;
use goblin::pe::PE;
use log::{debug, warn};

use crate::callbacks::HookOptions;
use crate::err::HookError;
use crate::utils::write_code;

struct Link {
    handler: usize,
    next: &'static AtomicUsize,
}

struct Chain {
    slot: usize,
    original: usize,
    // first installed first
    links: Vec<Link>,
}

impl Chain {
    fn head(&self) -> usize {
        self.links.last().map_or(self.original, |l| l.handler)
    }
}

/// The detour chains of a process, by module and symbol.
pub struct DetourChains {
    options: HookOptions,
    chains: Mutex<HashMap<(String, String), Chain>>,
}

fn chain_key(module: &str, symbol: &str) -> (String, String) {
    (module.to_ascii_lowercase(), symbol.to_owned())
}

unsafe fn read_slot(slot: usize) -> usize {
    unsafe { (slot as *const usize).read_volatile() }
}

impl DetourChains {
    /// Create an empty set of chains. `options` is used for every slot write.
    pub fn new(options: HookOptions) -> Self {
        Self {
            options,
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Puts `handler` at the head of the chain of `module!symbol`, which lives
    /// in the pointer slot `slot`. `next` receives the function the handler
    /// should forward to.
    ///
    /// Returns false if `handler` is in the chain already.
    ///
    /// # Safety
    ///
    /// `slot` must be a readable pointer slot, and `handler` a function with
    /// the signature of the symbol.
    pub unsafe fn install(
        &self,
        module: &str,
        symbol: &str,
        slot: usize,
        handler: usize,
        next: &'static AtomicUsize,
    ) -> Result<bool, HookError> {
        let mut chains = self.chains.lock().map_err(|_| HookError::InvalidParameter)?;
        let current = unsafe { read_slot(slot) };
        let key = chain_key(module, symbol);
        let chain = chains.entry(key.clone()).or_insert_with(|| Chain {
            slot,
            original: current,
            links: vec![],
        });
        if chain.slot != slot {
            warn!("{module}!{symbol} is chained at {:#x}, not {slot:#x}", chain.slot);
            return Err(HookError::ChainConflict(symbol.to_owned()));
        }
        if current != chain.head() {
            warn!("{module}!{symbol} was rewritten outside its chain");
            return Err(HookError::ChainConflict(symbol.to_owned()));
        }
        if chain.links.iter().any(|l| l.handler == handler) {
            return Ok(false);
        }

        next.store(current, Ordering::SeqCst);
        if let Err(e) = write_code(
            slot,
            &handler.to_ne_bytes(),
            self.options.code_protect_cb,
            self.options.thread_cb,
        ) {
            if chain.links.is_empty() {
                chains.remove(&key);
            }
            return Err(e);
        }
        chain.links.push(Link { handler, next });
        debug!("{module}!{symbol}: {handler:#x} installed");
        Ok(true)
    }

    /// Takes `handler` out of the chain of `module!symbol`. Its caller in the
    /// chain then forwards to what `handler` forwarded to.
    pub fn remove(&self, module: &str, symbol: &str, handler: usize) -> Result<(), HookError> {
        let mut chains = self.chains.lock().map_err(|_| HookError::InvalidParameter)?;
        let key = chain_key(module, symbol);
        let chain = chains
            .get_mut(&key)
            .ok_or_else(|| HookError::DetourNotInstalled(symbol.to_owned()))?;
        let idx = chain
            .links
            .iter()
            .position(|l| l.handler == handler)
            .ok_or_else(|| HookError::DetourNotInstalled(symbol.to_owned()))?;
        if unsafe { read_slot(chain.slot) } != chain.head() {
            return Err(HookError::ChainConflict(symbol.to_owned()));
        }

        let target = chain.links[idx].next.load(Ordering::SeqCst);
        match chain.links.get(idx + 1) {
            Some(caller) => caller.next.store(target, Ordering::SeqCst),
            None => write_code(
                chain.slot,
                &target.to_ne_bytes(),
                self.options.code_protect_cb,
                self.options.thread_cb,
            )?,
        }
        chain.links.remove(idx);
        if chain.links.is_empty() {
            chains.remove(&key);
        }
        debug!("{module}!{symbol}: {handler:#x} removed");
        Ok(())
    }

    /// The number of handlers chained on `module!symbol`.
    pub fn len(&self, module: &str, symbol: &str) -> usize {
        self.chains
            .lock()
            .ok()
            .and_then(|c| c.get(&chain_key(module, symbol)).map(|c| c.links.len()))
            .unwrap_or(0)
    }

    /// The function the chain of `module!symbol` ends in.
    pub fn original(&self, module: &str, symbol: &str) -> Option<usize> {
        let chains = self.chains.lock().ok()?;
        chains.get(&chain_key(module, symbol)).map(|c| c.original)
    }
}

// the headers of a mapped image fit in its first page
const HEADER_PAGE_LEN: usize = 0x1000;

/// Finds the import table slot of `dll!symbol` in a PE image mapped at
/// `base`. Handles PE32 and PE32+ images; imports by ordinal are skipped.
///
/// # Safety
///
/// `base` must point to a mapped PE image.
pub unsafe fn find_iat_slot(base: usize, dll: &str, symbol: &str) -> Result<usize, HookError> {
    let headers = unsafe { slice::from_raw_parts(base as *const u8, HEADER_PAGE_LEN) };
    let size_of_image = Header::parse(headers)?
        .optional_header
        .ok_or(HookError::InvalidParameter)?
        .windows_fields
        .size_of_image as usize;
    let image = unsafe { slice::from_raw_parts(base as *const u8, size_of_image.max(HEADER_PAGE_LEN)) };

    // a mapped image is laid out by rva already
    let opts = ParseOptions {
        resolve_rva: false,
        ..ParseOptions::default()
    };
    let pe = PE::parse_with_opts(image, &opts)?;
    pe.imports
        .iter()
        .find(|import| import.dll.eq_ignore_ascii_case(dll) && import.name == symbol)
        .map(|import| {
            debug!("{}!{} is imported through rva {:#x}", import.dll, import.name, import.offset);
            base + import.offset
        })
        .ok_or_else(|| HookError::SymbolNotFound(format!("{dll}!{symbol}")))
}

/// Finds the import table slot of `dll!symbol` in the main executable.
#[cfg(windows)]
pub fn main_module_iat_slot(dll: &str, symbol: &str) -> Result<usize, HookError> {
    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;

    let base = unsafe { GetModuleHandleW(std::ptr::null()) } as usize;
    if base == 0 {
        return Err(HookError::InvalidParameter);
    }
    unsafe { find_iat_slot(base, dll, symbol) }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Func = extern "C" fn(u32) -> u32;

    extern "C" fn original(x: u32) -> u32 {
        x
    }

    fn call_next(cell: &AtomicUsize, x: u32) -> u32 {
        let f: Func = unsafe { std::mem::transmute::<usize, Func>(cell.load(Ordering::SeqCst)) };
        f(x)
    }

    struct Slot(*mut usize);

    impl Slot {
        fn new() -> Self {
            Slot(Box::into_raw(Box::new(original as usize)))
        }
        fn addr(&self) -> usize {
            self.0 as usize
        }
        fn call(&self, x: u32) -> u32 {
            let f: Func = unsafe { std::mem::transmute::<usize, Func>(*self.0) };
            f(x)
        }
    }

    impl Drop for Slot {
        fn drop(&mut self) {
            drop(unsafe { Box::from_raw(self.0) });
        }
    }

    static ORDER_PLUS_NEXT: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn order_plus(x: u32) -> u32 {
        call_next(&ORDER_PLUS_NEXT, x) + 1
    }
    static ORDER_TIMES_NEXT: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn order_times(x: u32) -> u32 {
        call_next(&ORDER_TIMES_NEXT, x) * 10
    }

    #[test]
    fn test_last_installed_runs_first() {
        let slot = Slot::new();
        let chains = DetourChains::new(HookOptions::unprotected());
        unsafe {
            assert!(chains.install("KERNEL32.dll", "f", slot.addr(), order_plus as usize, &ORDER_PLUS_NEXT).unwrap());
            assert!(chains.install("kernel32.dll", "f", slot.addr(), order_times as usize, &ORDER_TIMES_NEXT).unwrap());
        }
        assert_eq!(chains.len("kernel32.dll", "f"), 2);
        assert_eq!(slot.call(1), 20);

        // removing the second restores dispatch to the first
        chains.remove("kernel32.dll", "f", order_times as usize).unwrap();
        assert_eq!(slot.call(1), 2);

        chains.remove("kernel32.dll", "f", order_plus as usize).unwrap();
        assert_eq!(slot.call(1), 1);
        assert_eq!(chains.len("kernel32.dll", "f"), 0);
        assert_eq!(chains.original("kernel32.dll", "f"), None);
    }

    static MID_PLUS_NEXT: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn mid_plus(x: u32) -> u32 {
        call_next(&MID_PLUS_NEXT, x) + 1
    }
    static MID_TIMES_NEXT: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn mid_times(x: u32) -> u32 {
        call_next(&MID_TIMES_NEXT, x) * 10
    }

    #[test]
    fn test_remove_inner_link() {
        let slot = Slot::new();
        let chains = DetourChains::new(HookOptions::unprotected());
        unsafe {
            chains.install("m", "f", slot.addr(), mid_plus as usize, &MID_PLUS_NEXT).unwrap();
            chains.install("m", "f", slot.addr(), mid_times as usize, &MID_TIMES_NEXT).unwrap();
            // installing twice is a no-op
            assert!(!chains.install("m", "f", slot.addr(), mid_plus as usize, &MID_PLUS_NEXT).unwrap());
        }
        assert_eq!(slot.call(2), 30);
        chains.remove("m", "f", mid_plus as usize).unwrap();
        assert_eq!(slot.call(2), 20);
        assert_eq!(chains.original("m", "f"), Some(original as usize));
    }

    static ERR_NEXT: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn err_hook(x: u32) -> u32 {
        call_next(&ERR_NEXT, x)
    }

    #[test]
    fn test_chain_errors() {
        let slot = Slot::new();
        let other = Slot::new();
        let chains = DetourChains::new(HookOptions::unprotected());
        assert!(matches!(
            chains.remove("m", "f", err_hook as usize),
            Err(HookError::DetourNotInstalled(_))
        ));
        unsafe {
            chains.install("m", "f", slot.addr(), err_hook as usize, &ERR_NEXT).unwrap();
            // same symbol, different slot
            assert!(matches!(
                chains.install("m", "f", other.addr(), err_hook as usize, &ERR_NEXT),
                Err(HookError::ChainConflict(_))
            ));
        }
        assert!(matches!(
            chains.remove("m", "f", original as usize),
            Err(HookError::DetourNotInstalled(_))
        ));

        // someone else rewrote the slot
        unsafe { *slot.0 = original as usize };
        assert!(matches!(
            chains.remove("m", "f", err_hook as usize),
            Err(HookError::ChainConflict(_))
        ));
    }

    fn put_u16(img: &mut [u8], at: usize, v: u16) {
        img[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(img: &mut [u8], at: usize, v: u32) {
        img[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_thunk(img: &mut [u8], at: usize, v: u64, size: usize) {
        img[at..at + size].copy_from_slice(&v.to_le_bytes()[..size]);
    }

    fn pe_image(pe32_plus: bool) -> Vec<u8> {
        let mut img = vec![0u8; 0x1000];
        let size = if pe32_plus { 8 } else { 4 };
        put_u16(&mut img, 0, 0x5a4d);
        put_u32(&mut img, 0x3c, 0x80);
        put_u32(&mut img, 0x80, 0x4550);
        // COFF header: machine, no sections, optional header size
        put_u16(&mut img, 0x84, if pe32_plus { 0x8664 } else { 0x14c });
        put_u16(&mut img, 0x94, if pe32_plus { 0xf0 } else { 0xe0 });
        let opt = 0x98;
        put_u16(&mut img, opt, if pe32_plus { 0x20b } else { 0x10b });
        put_u32(&mut img, opt + 56, 0x1000);
        put_u32(&mut img, opt + 60, 0x400);
        put_u32(&mut img, opt + if pe32_plus { 108 } else { 92 }, 16);
        let import_dir = opt + if pe32_plus { 120 } else { 104 };
        put_u32(&mut img, import_dir, 0x200);
        put_u32(&mut img, import_dir + 4, 0x3c);

        // user32.dll: by ordinal only
        put_u32(&mut img, 0x200, 0x2c0);
        put_u32(&mut img, 0x200 + 12, 0x310);
        put_u32(&mut img, 0x200 + 16, 0x2e0);
        put_thunk(&mut img, 0x2c0, (1u64 << (size * 8 - 1)) | 5, size);
        // kernel32.dll
        put_u32(&mut img, 0x214, 0x240);
        put_u32(&mut img, 0x214 + 12, 0x300);
        put_u32(&mut img, 0x214 + 16, 0x280);
        for (i, name_rva) in [0x320u64, 0x340].into_iter().enumerate() {
            put_thunk(&mut img, 0x240 + i * size, name_rva, size);
            put_thunk(&mut img, 0x280 + i * size, name_rva, size);
        }
        img[0x300..0x30d].copy_from_slice(b"KERNEL32.dll\0");
        img[0x310..0x31b].copy_from_slice(b"USER32.dll\0");
        img[0x322..0x32e].copy_from_slice(b"CreateFileA\0");
        img[0x342..0x34b].copy_from_slice(b"ReadFile\0");
        img
    }

    #[test]
    fn test_find_iat_slot() {
        for pe32_plus in [false, true] {
            let img = pe_image(pe32_plus);
            let base = img.as_ptr() as usize;
            let size = if pe32_plus { 8 } else { 4 };
            unsafe {
                assert_eq!(find_iat_slot(base, "kernel32.dll", "CreateFileA").unwrap(), base + 0x280);
                assert_eq!(find_iat_slot(base, "KERNEL32.DLL", "ReadFile").unwrap(), base + 0x280 + size);
                assert!(matches!(
                    find_iat_slot(base, "kernel32.dll", "readfile"),
                    Err(HookError::SymbolNotFound(_))
                ));
                assert!(matches!(
                    find_iat_slot(base, "user32.dll", "MessageBoxA"),
                    Err(HookError::SymbolNotFound(_))
                ));
                assert!(matches!(
                    find_iat_slot(base, "kernel32", "ReadFile"),
                    Err(HookError::SymbolNotFound(_))
                ));
            }
        }
    }

    #[test]
    fn test_not_a_pe() {
        let img = vec![0u8; 0x1000];
        assert!(matches!(
            unsafe { find_iat_slot(img.as_ptr() as usize, "kernel32.dll", "ReadFile") },
            Err(HookError::Image(_))
        ));
    }
}
