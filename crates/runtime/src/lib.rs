//! Tern Runtime: value marshaling
//!
//! Serializes arbitrary runtime values to a compact binary format and
//! back. Compiled functions round-trip together with their captured
//! environments, and a suspended fiber's call stack rebuilds exactly.
//! The encoding doubles as a stable exchange format.
//!
//! Key design principles:
//! - Shared and cyclic structure survives via back-references
//! - Functions and environments intern through their own tables
//! - A suspended fiber's stack rebuilds byte for byte
//! - Hostile input fails with an error, never with unsoundness
//!
//! # Modules
//!
//! - `wire`: Lead bytes, recursion guard, integer fast path
//! - `error`: The failure model, one enum for both directions
//! - `marshal`: Value graph to bytes
//! - `unmarshal`: Bytes to value graph
//! - `registry`: Named-value registries and environment flattening
//! - `abstracts`: Host-registered abstract type hooks

pub mod abstracts;
pub mod error;
pub mod marshal;
pub mod registry;
pub mod unmarshal;
pub mod wire;

pub use abstracts::{AbstractMarshalFn, AbstractRegistry, AbstractType, AbstractUnmarshalFn};
pub use error::MarshalError;
pub use marshal::{MarshalContext, marshal, marshal_into};
pub use registry::{env_lookup, invert};
pub use unmarshal::{UnmarshalContext, unmarshal, unmarshal_with};
pub use wire::{Lead, RECURSION_GUARD};
