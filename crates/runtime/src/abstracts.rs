//! Host-registered abstract types
//!
//! An abstract type is the open extension point of the value model: a
//! named opaque cell the runtime cannot look inside. A host that wants
//! such cells to survive marshaling registers the type name together
//! with a pair of hooks. The writer emits the name and the instance
//! size, then hands the payload to the marshal hook; the reader looks
//! the name up, allocates the cell, and hands the wire back to the
//! unmarshal hook. Both hooks may read and write whole values, which
//! nest through the ordinary protocol.

use crate::error::MarshalError;
use crate::marshal::MarshalContext;
use crate::unmarshal::UnmarshalContext;
use std::any::Any;
use std::collections::HashMap;
use tern_core::heap::AbstractCell;

pub type AbstractMarshalFn =
    fn(&AbstractCell, &mut MarshalContext<'_, '_>) -> Result<(), MarshalError>;

pub type AbstractUnmarshalFn =
    fn(&mut UnmarshalContext<'_, '_>, i32) -> Result<Box<dyn Any>, MarshalError>;

/// Hooks for one abstract type
#[derive(Clone, Copy)]
pub struct AbstractType {
    pub name: &'static str,
    pub marshal: AbstractMarshalFn,
    pub unmarshal: AbstractUnmarshalFn,
}

/// Name-indexed registry of abstract types
#[derive(Default)]
pub struct AbstractRegistry {
    types: HashMap<&'static str, AbstractType>,
}

impl AbstractRegistry {
    pub fn new() -> AbstractRegistry {
        AbstractRegistry::default()
    }

    pub fn register(&mut self, ty: AbstractType) {
        self.types.insert(ty.name, ty);
    }

    pub fn get(&self, name: &str) -> Option<&AbstractType> {
        self.types.get(name)
    }

    /// Lookup by the raw keyword bytes the wire carries
    pub fn get_by_bytes(&self, name: &[u8]) -> Option<&AbstractType> {
        std::str::from_utf8(name).ok().and_then(|s| self.get(s))
    }
}
