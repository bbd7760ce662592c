//! Function definitions, captured environments, and closures
//!
//! A `FuncDef` is the immutable, shareable compilation product: bytecode,
//! constants, nested definitions, and the indices of the environments a
//! closure over it captures from its enclosing function. A `Function`
//! pairs one definition with the captured environments themselves. A
//! `FuncEnv` is the captured frame: while its owning fiber is suspended it
//! is a view into that fiber's stack; once detached it owns its slots.

use crate::heap::{FiberRef, FuncDefRef, FuncEnvRef};
use crate::ternstr::TernStr;
use crate::value::Value;
use bitflags::bitflags;

bitflags! {
    /// Feature flags on a function definition.
    ///
    /// The presence flags describe which optional fields a definition
    /// carries; unknown bits are preserved for the interpreter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FuncDefFlags: i32 {
        const VARARG = 1 << 0;
        const HASNAME = 1 << 1;
        const HASSOURCE = 1 << 2;
        const HASDEFS = 1 << 3;
        const HASENVS = 1 << 4;
        const HASSOURCEMAP = 1 << 5;
        const _ = !0;
    }
}

/// Source span of one bytecode word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapping {
    pub start: i32,
    pub end: i32,
}

/// Immutable function prototype
#[derive(Debug)]
pub struct FuncDef {
    pub flags: FuncDefFlags,
    pub slotcount: i32,
    pub arity: i32,
    pub constants: Vec<Value>,
    /// 32-bit instruction words
    pub bytecode: Vec<u32>,
    /// Indices into the enclosing function's captured environments
    pub environments: Vec<i32>,
    pub defs: Vec<FuncDefRef>,
    pub name: Option<TernStr>,
    pub source: Option<TernStr>,
    /// One span per bytecode word when present
    pub sourcemap: Option<Vec<SourceMapping>>,
}

impl FuncDef {
    pub fn new(arity: i32, slotcount: i32, bytecode: Vec<u32>) -> FuncDef {
        FuncDef {
            flags: FuncDefFlags::empty(),
            slotcount,
            arity,
            constants: Vec::new(),
            bytecode,
            environments: Vec::new(),
            defs: Vec::new(),
            name: None,
            source: None,
            sourcemap: None,
        }
    }

    /// Flags with the presence bits forced to match the fields.
    ///
    /// Hosts are free to build definitions without maintaining the
    /// presence bits; everything that inspects them goes through here.
    pub fn normalized_flags(&self) -> FuncDefFlags {
        let mut flags = self.flags;
        flags.set(FuncDefFlags::HASNAME, self.name.is_some());
        flags.set(FuncDefFlags::HASSOURCE, self.source.is_some());
        flags.set(FuncDefFlags::HASDEFS, !self.defs.is_empty());
        flags.set(FuncDefFlags::HASENVS, !self.environments.is_empty());
        flags.set(FuncDefFlags::HASSOURCEMAP, self.sourcemap.is_some());
        flags
    }
}

/// Where a captured environment's slots live
#[derive(Debug)]
pub enum EnvStorage {
    /// A view into a suspended fiber's stack; the slot range is the
    /// environment's `(offset, length)`
    OnStack(FiberRef),
    /// Owned slots, detached from any stack
    Detached(Vec<Value>),
}

/// Captured environment.
///
/// `offset != 0` means the slots are on a fiber's stack at
/// `[offset, offset + length)`; a zero offset means the slots are owned.
#[derive(Debug)]
pub struct FuncEnv {
    pub offset: i32,
    pub length: i32,
    pub storage: EnvStorage,
}

impl FuncEnv {
    pub fn detached(values: Vec<Value>) -> FuncEnv {
        FuncEnv {
            offset: 0,
            length: values.len() as i32,
            storage: EnvStorage::Detached(values),
        }
    }

    pub fn on_stack(fiber: FiberRef, offset: i32, length: i32) -> FuncEnv {
        FuncEnv {
            offset,
            length,
            storage: EnvStorage::OnStack(fiber),
        }
    }

    pub fn is_on_stack(&self) -> bool {
        self.offset != 0
    }
}

/// Closure: a definition plus the environments it captured
#[derive(Debug)]
pub struct Function {
    pub def: FuncDefRef,
    pub envs: Vec<FuncEnvRef>,
}

impl Function {
    pub fn new(def: FuncDefRef) -> Function {
        Function {
            def,
            envs: Vec::new(),
        }
    }
}
