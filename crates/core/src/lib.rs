//! Tern Core: the runtime value model
//!
//! This crate provides the heap-resident object model the Tern runtime is
//! built on, independent of the compiler and the interpreter.
//!
//! Key design principles:
//! - Value: What the language talks about (nil, numbers, strings, tables, etc.)
//! - Heap: Typed cells addressed by copyable handles; handles are identity
//! - Fiber: A suspended call stack is plain data and can be walked
//!
//! # Modules
//!
//! - `ternstr`: Immutable shared byte strings
//! - `value`: The Value enum, its identity relation, and deep equality
//! - `heap`: Typed-cell heap, handles, tables, abstract cells
//! - `function`: Function definitions, captured environments, closures
//! - `fiber`: Fibers, stack frames, status flags
//! - `verify`: Structural checks on decoded function definitions

pub mod fiber;
pub mod function;
pub mod heap;
pub mod ternstr;
pub mod value;
pub mod verify;

pub use fiber::{
    FIBER_FLAG_HASCHILD, FIBER_STATUS_MASK, FIBER_STATUS_OFFSET, FRAME_SIZE, Fiber, FiberStatus,
    STACKFRAME_HASENV, StackFrame,
};
pub use function::{EnvStorage, FuncDef, FuncDefFlags, FuncEnv, Function, SourceMapping};
pub use heap::{
    AbstractCell, AbstractRef, ArrayRef, BufferRef, FiberRef, FuncDefRef, FuncEnvRef, FunctionRef,
    Heap, HeapStats, TableData, TableRef,
};
pub use ternstr::TernStr;
pub use value::{Struct, Tuple, Value, deep_equal};
