/*!
This crate puts JSON-configured breakpoints on 32-bit `x86` code and uses them to
substitute the files a game reads from its encrypted archives.

A breakpoint overwrites the instructions at an address with a call into a
generated stub. The stub saves every register and calls the handlers configured
for the site, then either runs the overwritten instructions from a code cave and
jumps back, or continues wherever a handler redirected it.

# Breakpoint configuration

A site maps handler names to their parameters. Parameters that are strings or
numbers are operands: expressions over the trapped registers.

```json
{
    "0x4a1f30": {
        "cavesize": 6,
        "th135_file_header": { "file_hash": "[esp+8]", "file_key": "esp+0xc", "file": "ecx" },
        "my_logger#2": { "value": "eax * 4 + [ebx]", "cave_exec": false }
    }
}
```

Anything after `#` in a handler name is ignored, so one handler may appear
several times on a site. The code cave only runs if every handler agrees.

# Operands

```rust
use cavehook::expr::Operand;
use cavehook::mem::Memory;
use cavehook::x86::Registers;

struct NoMemory;

impl Memory for NoMemory {
    fn read(&self, _addr: u32, _buf: &mut [u8]) -> bool {
        false
    }

    fn write(&self, _addr: u32, _data: &[u8]) -> bool {
        false
    }
}

let regs = Registers {
    esp: 0x0019_ff00,
    eax: 3,
    ..Default::default()
};
let op = Operand::parse("esp + eax * 0x10").unwrap();
assert_eq!(op.eval(&regs, &NoMemory), Some(0x0019_ff30));

// unreadable memory makes the operand absent
let op = Operand::parse("[esp + 4]").unwrap();
assert_eq!(op.eval(&regs, &NoMemory), None);
```

# Sessions

A [`Session`] ties a [`RunConfig`] to a [`vfs::PatchStack`] providing the
replacement files, and installs the configured sites into the current process.

# Notes

Installing a site writes code while other threads may run it. Pass a
[`callbacks::ThreadOperatingCallback`] in [`HookOptions`] to suspend them.

The trap stubs only execute in a 32-bit process. Everything else, including
dispatching a site's handlers by hand, works on any target.
*/

#![warn(missing_docs)]

mod err;

pub use err::HookError;

/// Callbacks run around code writes
pub mod callbacks;
pub(crate) mod utils;

pub use callbacks::HookOptions;

pub mod mem;

/// The x86 trap stubs
pub mod x86;

pub use x86::Registers;

pub mod expr;

pub mod breakpoint;

pub use breakpoint::{BreakpointInfo, Breakpoints, HandlerRegistry};

pub mod detour;

pub mod crypt;

pub mod vfs;

mod config;

pub use config::RunConfig;

mod session;

pub use session::Session;
