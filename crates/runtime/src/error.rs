//! Marshaling failure model
//!
//! One error covers both directions. Any failure aborts the whole
//! marshal or unmarshal call; nothing is recovered internally. Reader
//! errors carry the byte offset the cursor was at; writer errors name
//! the property of the value graph that refused to serialize.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("unexpected end of source at offset {0}")]
    UnexpectedEnd(usize),

    #[error("expected integer, got byte {byte:#04x} at offset {offset}")]
    ExpectedInteger { byte: u8, offset: usize },

    #[error("expected {expected}, got {got} at offset {offset}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
        offset: usize,
    },

    #[error("invalid reference {0}")]
    InvalidReference(i32),

    #[error("invalid funcenv reference {0}")]
    InvalidFuncEnvReference(i32),

    #[error("invalid funcdef reference {0}")]
    InvalidFuncDefReference(i32),

    #[error("invalid length {0}")]
    InvalidLength(i32),

    #[error("cannot marshal alive fiber")]
    AliveFiber,

    #[error("cannot marshal fiber with native stackframe")]
    NativeFrame,

    #[error("fiber has incorrect stack setup")]
    BadStackSetup,

    #[error("fiber stackframe size mismatch")]
    FrameSizeMismatch,

    #[error("fiber stackframe has invalid pc")]
    InvalidPc,

    #[error("fiber stackframe does not align with previous frame")]
    FrameMisaligned,

    #[error("fiber has too many stackframes")]
    TooManyFrames,

    #[error("funcenv offset does not match fiber frame")]
    EnvOffsetMismatch,

    #[error("funcenv length does not match fiber frame")]
    EnvLengthMismatch,

    #[error("funcdef has invalid bytecode")]
    InvalidBytecode,

    #[error("unknown lead byte {byte:#04x} at offset {offset}")]
    UnknownLeadByte { byte: u8, offset: usize },

    #[error("cannot marshal unregistered abstract type {0}")]
    UnregisteredAbstractType(String),

    #[error("stack overflow")]
    StackOverflow,

    #[error("out of memory")]
    OutOfMemory,
}
