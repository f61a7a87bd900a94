use std::fmt;
use std::slice;
use std::str::FromStr;

use bitflags::bitflags;
use iced_x86::{Decoder, DecoderOptions, Instruction};

use crate::callbacks::HookOptions;
use crate::err::HookError;
use crate::expr::ExprError;
use crate::utils::write_code;

mod exec_mem;
mod trampoline;
use trampoline::Trampoline;


const MAX_INST_LEN: usize = 15;
const JMP_INST_SIZE: usize = 5;

/// The largest number of bytes a site may overwrite.
pub const MAX_CAVE_LEN: usize = 32;

/// The routine called by the capture stub of a breakpoint site.
///
/// The 1st argument is the captured registers, and the 2nd argument is the
/// user data given when the site was prepared. Return the number of bytes the
/// trapped code's stack pointer moves by.
pub type DispatchRoutine = unsafe extern "C" fn(regs: *mut Registers, user_data: usize) -> i32;

/// The registers captured at a trap, in the order the capture stub pushes them.
///
/// `esp` is the value `pushad` saw, which points at `retaddr`. Writing
/// `retaddr` changes where execution resumes.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    /// The flags register.
    pub flags: u32,
    /// The edi register.
    pub edi: u32,
    /// The esi register.
    pub esi: u32,
    /// The ebp register.
    pub ebp: u32,
    /// The esp register.
    pub esp: u32,
    /// The ebx register.
    pub ebx: u32,
    /// The edx register.
    pub edx: u32,
    /// The ecx register.
    pub ecx: u32,
    /// The eax register.
    pub eax: u32,
    /// The address execution resumes at.
    pub retaddr: u32,
}

const _: () = assert!(std::mem::size_of::<Registers>() == 40);

/// A named slot of [`Registers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// eax
    Eax,
    /// ecx
    Ecx,
    /// edx
    Edx,
    /// ebx
    Ebx,
    /// esp
    Esp,
    /// ebp
    Ebp,
    /// esi
    Esi,
    /// edi
    Edi,
    /// flags, also spelled eflags
    Flags,
    /// the return address
    Retaddr,
}

impl FromStr for Reg {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reg = match s.to_ascii_lowercase().as_str() {
            "eax" => Reg::Eax,
            "ecx" => Reg::Ecx,
            "edx" => Reg::Edx,
            "ebx" => Reg::Ebx,
            "esp" => Reg::Esp,
            "ebp" => Reg::Ebp,
            "esi" => Reg::Esi,
            "edi" => Reg::Edi,
            "flags" | "eflags" => Reg::Flags,
            "retaddr" => Reg::Retaddr,
            _ => return Err(ExprError::UnknownRegister(s.to_owned())),
        };
        Ok(reg)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg::Eax => "eax",
            Reg::Ecx => "ecx",
            Reg::Edx => "edx",
            Reg::Ebx => "ebx",
            Reg::Esp => "esp",
            Reg::Ebp => "ebp",
            Reg::Esi => "esi",
            Reg::Edi => "edi",
            Reg::Flags => "flags",
            Reg::Retaddr => "retaddr",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// The status and control bits of `flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eflags: u32 {
        /// Carry
        const CF = 1 << 0;
        /// Parity
        const PF = 1 << 2;
        /// Auxiliary carry
        const AF = 1 << 4;
        /// Zero
        const ZF = 1 << 6;
        /// Sign
        const SF = 1 << 7;
        /// Trap
        const TF = 1 << 8;
        /// Interrupt enable
        const IF = 1 << 9;
        /// Direction
        const DF = 1 << 10;
        /// Overflow
        const OF = 1 << 11;
    }
}

impl Registers {
    /// Get the value of a register.
    pub fn get(&self, reg: Reg) -> u32 {
        match reg {
            Reg::Eax => self.eax,
            Reg::Ecx => self.ecx,
            Reg::Edx => self.edx,
            Reg::Ebx => self.ebx,
            Reg::Esp => self.esp,
            Reg::Ebp => self.ebp,
            Reg::Esi => self.esi,
            Reg::Edi => self.edi,
            Reg::Flags => self.flags,
            Reg::Retaddr => self.retaddr,
        }
    }

    /// Get a mutable reference to the slot of a register.
    pub fn slot_mut(&mut self, reg: Reg) -> &mut u32 {
        match reg {
            Reg::Eax => &mut self.eax,
            Reg::Ecx => &mut self.ecx,
            Reg::Edx => &mut self.edx,
            Reg::Ebx => &mut self.ebx,
            Reg::Esp => &mut self.esp,
            Reg::Ebp => &mut self.ebp,
            Reg::Esi => &mut self.esi,
            Reg::Edi => &mut self.edi,
            Reg::Flags => &mut self.flags,
            Reg::Retaddr => &mut self.retaddr,
        }
    }

    /// The flags register as bits. Undefined bits are dropped.
    pub fn eflags(&self) -> Eflags {
        Eflags::from_bits_truncate(self.flags)
    }
}

struct OriginalCode {
    buf: [u8; MAX_CAVE_LEN + MAX_INST_LEN],
    len: u8,
}

/// The patch of one breakpoint site: the saved original bytes and the
/// trampoline the site calls into.
///
/// A prepared patch doesn't touch the site until [`CodePatch::commit`]. The
/// site is restored when the patch drops.
pub struct CodePatch {
    addr: usize,
    origin: OriginalCode,
    trampoline: Trampoline,
    options: HookOptions,
    committed: bool,
}

impl CodePatch {
    /// Decodes the instructions at `addr` and builds the trampoline.
    ///
    /// # Arguments
    ///
    /// * `addr` - The site address.
    /// * `cave_len` - The least number of bytes to overwrite. At least 5 are
    ///   always overwritten.
    /// * `dispatch` - The routine the stub calls.
    /// * `user_data` - The 2nd argument of `dispatch`.
    /// * `options` - The protect and thread callbacks.
    ///
    /// # Safety
    ///
    /// `addr` must point to readable code, at an instruction boundary, with
    /// at least `cave_len + 15` readable bytes.
    pub unsafe fn prepare(
        addr: usize,
        cave_len: usize,
        dispatch: DispatchRoutine,
        user_data: usize,
        options: HookOptions,
    ) -> Result<Self, HookError> {
        let min_len = cave_len.max(JMP_INST_SIZE);
        if min_len > MAX_CAVE_LEN {
            return Err(HookError::InvalidParameter);
        }
        let code = unsafe { slice::from_raw_parts(addr as *const u8, min_len + MAX_INST_LEN) };
        let (insts, origin) = generate_moving_code(code, addr as u32, min_len)?;

        let mut trampoline = Trampoline::new()?;
        trampoline.generate(addr as u32, dispatch, &insts, origin.len, user_data)?;
        Ok(Self {
            addr,
            origin,
            trampoline,
            options,
            committed: false,
        })
    }

    /// The site address.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// The number of bytes the patch overwrites.
    pub fn len(&self) -> usize {
        self.origin.len as usize
    }

    /// The bytes the patch overwrites.
    pub fn original_bytes(&self) -> &[u8] {
        &self.origin.buf[..self.len()]
    }

    /// Where the capture stub starts. The stub stays mapped after the patch
    /// drops.
    pub fn stub_addr(&self) -> usize {
        self.trampoline.get_addr()
    }

    /// Where the relocated original instructions start.
    pub fn cave_addr(&self) -> u32 {
        self.trampoline.cave_addr()
    }

    /// Whether the site currently calls into the trampoline.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Writes `call trampoline` to the site, padded with `nop`s.
    ///
    /// # Safety
    ///
    /// No thread may be executing the overwritten bytes, unless a thread
    /// callback suspends them.
    pub unsafe fn commit(&mut self) -> Result<(), HookError> {
        if self.committed {
            return Ok(());
        }
        let mut code = [0x90u8; MAX_CAVE_LEN];
        let call_off = (self.stub_addr() as u32)
            .wrapping_sub((self.addr as u32).wrapping_add(JMP_INST_SIZE as u32));
        code[0] = 0xe8;
        code[1..5].copy_from_slice(&call_off.to_le_bytes());
        write_code(
            self.addr,
            &code[..self.len()],
            self.options.code_protect_cb,
            self.options.thread_cb,
        )?;
        self.committed = true;
        Ok(())
    }

    /// Writes the saved original bytes back.
    pub fn restore(&mut self) -> Result<(), HookError> {
        if !self.committed {
            return Ok(());
        }
        write_code(
            self.addr,
            self.original_bytes(),
            self.options.code_protect_cb,
            self.options.thread_cb,
        )?;
        self.committed = false;
        Ok(())
    }
}

// When the CodePatch drops, it should restore the site automatically.
impl Drop for CodePatch {
    fn drop(&mut self) {
        self.restore().unwrap_or_default();
    }
}

fn generate_moving_code(
    code: &[u8],
    addr: u32,
    min_len: usize,
) -> Result<(Vec<Instruction>, OriginalCode), HookError> {
    let mut decoder = Decoder::with_ip(32, code, u64::from(addr), DecoderOptions::NONE);
    let mut insts = vec![];
    let mut len = 0;
    while len < min_len {
        if !decoder.can_decode() {
            return Err(HookError::Disassemble);
        }
        let inst = decoder.decode();
        if inst.is_invalid() {
            return Err(HookError::Disassemble);
        }
        len += inst.len();
        insts.push(inst);
    }

    let mut origin = OriginalCode {
        buf: [0; MAX_CAVE_LEN + MAX_INST_LEN],
        len: len as u8,
    };
    origin.buf[..len].copy_from_slice(&code[..len]);
    Ok((insts, origin))
}
