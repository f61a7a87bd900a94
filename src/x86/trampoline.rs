use std::io::{Cursor, Seek, Write};
use std::slice;

use iced_x86::{BlockEncoder, BlockEncoderOptions, Instruction, InstructionBlock};

use super::exec_mem::{alloc_slot, SLOT_LEN};
use super::DispatchRoutine;
use crate::err::HookError;

// pushad
// pushfd
// cld
// mov ebp, esp
const CAPTURE_PROLOG: [u8; 5] = [0x60, 0x9c, 0xfc, 0x8b, 0xec];

// Moves the 40-byte register block (flags..retaddr) by eax bytes, then points
// esp at its new position. Source and destination may overlap, so the copy
// runs top-down when moving up and bottom-up when moving down.
const STACK_SHIFT: [u8; 43] = [
    0x85, 0xc0, // test eax, eax
    0x74, 0x27, // jz _restore
    0x8d, 0x3c, 0x04, // lea edi, [esp+eax]
    0x78, 0x12, // js _down
    0xb9, 0x0a, 0x00, 0x00, 0x00, // mov ecx, 10
    // _up:
    0x8b, 0x54, 0x8c, 0xfc, // mov edx, [esp+ecx*4-4]
    0x89, 0x54, 0x8f, 0xfc, // mov [edi+ecx*4-4], edx
    0x49, // dec ecx
    0x75, 0xf5, // jnz _up
    0xeb, 0x0e, // jmp _set_esp
    // _down:
    0x31, 0xc9, // xor ecx, ecx
    0x8b, 0x14, 0x8c, // mov edx, [esp+ecx*4]
    0x89, 0x14, 0x8f, // mov [edi+ecx*4], edx
    0x41, // inc ecx
    0x83, 0xf9, 0x0a, // cmp ecx, 10
    0x72, 0xf4, // jb _down+2
    // _set_esp:
    0x8b, 0xe7, // mov esp, edi
];

// _restore:
// popfd
// popad
// ret
const CAPTURE_EPILOG: [u8; 3] = [0x9d, 0x61, 0xc3];

/// The capture stub and code cave of one breakpoint site.
///
/// The bytes live in a slot that is never unmapped, so dropping a trampoline
/// leaves them in place for threads still running them.
pub(super) struct Trampoline {
    addr: usize,
    len: usize,
    cave_off: usize,
}

impl Trampoline {
    pub fn new() -> Result<Self, HookError> {
        Ok(Self {
            addr: alloc_slot()?,
            len: 0,
            cave_off: 0,
        })
    }

    pub fn get_addr(&self) -> usize {
        self.addr
    }

    pub fn cave_addr(&self) -> u32 {
        (self.addr + self.cave_off) as u32
    }

    fn buffer(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.addr as *mut u8, SLOT_LEN) }
    }

    #[cfg(test)]
    pub fn code(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    pub fn generate(
        &mut self,
        hook_addr: u32,
        dispatch: DispatchRoutine,
        moving_code: &[Instruction],
        ori_len: u8,
        user_data: usize,
    ) -> Result<(), HookError> {
        let trampoline_addr = self.addr as u32;
        // a failed encode leaves the slot zeroed
        let mut code = [0u8; SLOT_LEN];
        let (cave_off, len) = {
            let mut buf = Cursor::new(&mut code[..]);

            buf.write_all(&CAPTURE_PROLOG)?;
            write_dispatch_call(&mut buf, trampoline_addr, dispatch, user_data)?;
            buf.write_all(&STACK_SHIFT)?;
            buf.write_all(&CAPTURE_EPILOG)?;

            let cave_off = buf.stream_position()? as u32;
            buf.write_all(&move_code_to_addr(
                moving_code,
                trampoline_addr.wrapping_add(cave_off),
            )?)?;
            // jmp back
            buf.write_all(&[0xe9])?;
            write_relative_off(
                &mut buf,
                trampoline_addr,
                hook_addr.wrapping_add(u32::from(ori_len)),
            )?;
            (cave_off as usize, buf.stream_position()? as usize)
        };
        self.buffer()[..len].copy_from_slice(&code[..len]);
        self.cave_off = cave_off;
        self.len = len;
        Ok(())
    }
}

fn write_dispatch_call<T: Write + Seek>(
    buf: &mut T,
    trampoline_base_addr: u32,
    dispatch: DispatchRoutine,
    user_data: usize,
) -> Result<(), HookError> {
    // push user_data
    buf.write_all(&[0x68])?;
    buf.write_all(&(user_data as u32).to_le_bytes())?;

    // push ebp (Registers)
    // call XXXX (dispatch addr)
    buf.write_all(&[0x55, 0xe8])?;
    write_relative_off(buf, trampoline_base_addr, dispatch as usize as u32)?;

    // add esp, 0x8
    buf.write_all(&[0x83, 0xc4, 0x08])?;
    Ok(())
}

pub(super) fn write_relative_off<T: Write + Seek>(
    buf: &mut T,
    base_addr: u32,
    dst_addr: u32,
) -> Result<(), HookError> {
    let cur_pos = buf.stream_position()? as u32;
    let call_off = dst_addr.wrapping_sub(base_addr.wrapping_add(cur_pos + 4));
    buf.write_all(&call_off.to_le_bytes())?;
    Ok(())
}

fn move_code_to_addr(ori_insts: &[Instruction], dest_addr: u32) -> Result<Vec<u8>, HookError> {
    let block = InstructionBlock::new(ori_insts, u64::from(dest_addr));
    let encoded = BlockEncoder::encode(32, block, BlockEncoderOptions::NONE)
        .map_err(|_| HookError::MoveCode)?;
    Ok(encoded.code_buffer)
}
