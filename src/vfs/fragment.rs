//! Read handlers.

use log::{debug, trace, warn};

use super::{CipherHooks, FileReplacement, FragmentedRead, PatchStack};
use crate::breakpoint::BreakpointInfo;
use crate::x86::Registers;

/// The largest chunk the game reads at once.
pub const MAX_READ: usize = 0x10000;

/// The default read handler, for games that read a file in chunks into a
/// buffer.
///
/// Parameters:
///
/// * `buffer` - where the game read to.
/// * `size` - how many bytes it read.
/// * `offset` - the file offset of `buffer`, 0 if absent.
/// * `bytes_read` - optional, receives how many bytes were served.
///
/// A full replacement is encrypted once and served by slice. A diff is
/// applied to the decrypted chunk, which is encrypted again in place. Diffed
/// chunks larger than [`MAX_READ`], or at an offset the cipher can't reach,
/// pass through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferedRead;

impl FragmentedRead for BufferedRead {
    fn read(
        &self,
        regs: &mut Registers,
        info: &BreakpointInfo<'_>,
        rep: &FileReplacement,
        hooks: &mut CipherHooks<'_>,
        patches: &dyn PatchStack,
    ) -> bool {
        let name = info
            .get("file_name")
            .and_then(|v| v.as_str())
            .unwrap_or(&rep.name);
        let (Some(buffer), Some(size)) = (
            info.pointer(regs, "buffer"),
            info.immediate(regs, "size").filter(|s| *s > 0),
        ) else {
            debug!("{name}: no read buffer");
            return info.cave_exec();
        };
        let size = size as usize;
        let offset = info.immediate(regs, "offset").unwrap_or(0).max(0) as usize;
        let mem = info.memory();

        let served = if let Some(image) = rep.encrypted_image(hooks) {
            let start = offset.min(image.len());
            let end = offset.saturating_add(size).min(image.len());
            if !mem.write(buffer, &image[start..end]) {
                return info.cave_exec();
            }
            end - start
        } else {
            if size > MAX_READ {
                warn!("{name}: {size:#x} byte read is too large to patch");
                return info.cave_exec();
            }
            if !hooks.seek(offset) {
                warn!("{name}: can't position the cipher at {offset:#x}");
                return info.cave_exec();
            }
            let mut chunk = vec![0u8; size];
            if !mem.read(buffer, &mut chunk) {
                return info.cave_exec();
            }
            hooks.post_read(&mut chunk);
            patches.apply_patch(rep, &mut chunk, offset);
            hooks.post_patch(&mut chunk);
            if !mem.write(buffer, &chunk) {
                return info.cave_exec();
            }
            size
        };
        trace!("{name}: served {served} bytes at {offset:#x}");

        if let Some(out) = info.pointer(regs, "bytes_read") {
            mem.write_u32(out, served as u32);
        }
        info.cave_exec()
    }
}
