use std::io;
use thiserror::Error;

use crate::expr::ExprError;

/// Hook errors.
#[derive(Error, Debug)]
pub enum HookError {
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParameter,

    /// Error occurs when modifying the memory protect
    #[error("memory protect error, code:{0}")]
    MemoryProtect(u32),

    /// Error occurs when suspending other threads
    #[error("thread suspending error, code:{0}")]
    ThreadSuspending(u32),

    /// Can't disassemble in the specified address
    #[error("disassemble error")]
    Disassemble,

    /// Can't relocate the overwritten instructions into the code cave
    #[error("can't move code")]
    MoveCode,

    /// The breakpoint names a handler that isn't registered
    #[error("unknown breakpoint handler `{0}`")]
    UnknownHandler(String),

    /// An operand string in a breakpoint can't be parsed
    #[error("malformed operand `{key}`: {source}")]
    MalformedOperand {
        /// The parameter name
        key: String,
        /// What went wrong
        source: ExprError,
    },

    /// The breakpoint configuration has a wrong shape
    #[error("invalid breakpoint configuration: {0}")]
    InvalidConfig(String),

    /// No breakpoint is installed at the address
    #[error("no breakpoint installed at {0:#x}")]
    NotInstalled(usize),

    /// The handler isn't part of the symbol's detour chain
    #[error("no detour of `{0}` by this handler")]
    DetourNotInstalled(String),

    /// The symbol's slot was rewritten behind the chain's back, or the chain
    /// is bound to a different slot
    #[error("incompatible detour chain for `{0}`")]
    ChainConflict(String),

    /// The import can't be found in the module
    #[error("import `{0}` not found")]
    SymbolNotFound(String),

    /// Some json error
    #[error("json error")]
    Json(#[from] serde_json::Error),

    /// Some io error
    #[error("io error")]
    Io(#[from] io::Error),

    /// A mapped module isn't a well-formed PE image
    #[error("malformed image: {0}")]
    Image(#[from] goblin::error::Error),
}
