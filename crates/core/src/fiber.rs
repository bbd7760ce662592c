//! Fibers: suspendable call stacks
//!
//! A fiber owns a contiguous value stack and a chain of activation
//! frames. Frame metadata lives in side records keyed by the frame's
//! stack offset; the offsets and the `prevframe` links use the same
//! accounting as the stack itself, with [`FRAME_SIZE`] slots reserved
//! ahead of every frame's locals for the header.
//!
//! The fiber's status is a small field packed into its flags word.
//! `Alive` means the fiber is the one currently executing, which is the
//! only state a snapshot of the stack is meaningless in.

use crate::heap::{FiberRef, FuncEnvRef, FunctionRef};
use crate::value::Value;
use num_enum::TryFromPrimitive;

/// Slots reserved ahead of each frame's locals for the frame header
pub const FRAME_SIZE: i32 = 4;

/// Status field inside the fiber flags word, bits 16..24
pub const FIBER_STATUS_MASK: i32 = 0xFF_0000;
pub const FIBER_STATUS_OFFSET: u32 = 16;

/// Set on the wire when a child fiber record follows
pub const FIBER_FLAG_HASCHILD: i32 = 1 << 29;

/// Set on the wire when a captured-environment record follows the frame
pub const STACKFRAME_HASENV: i32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FiberStatus {
    Dead = 0,
    Error = 1,
    Debug = 2,
    Pending = 3,
    New = 4,
    Alive = 5,
}

/// One activation record
#[derive(Debug, Clone, Copy)]
pub struct StackFrame {
    /// Stack offset of the frame's slot 0
    pub base: i32,
    pub flags: i32,
    /// Stack offset of the previous frame's slot 0, 0 at the bottom
    pub prevframe: i32,
    /// Word offset into the function's bytecode
    pub pc: i32,
    /// None for a native-code frame
    pub func: Option<FunctionRef>,
    pub env: Option<FuncEnvRef>,
}

#[derive(Debug)]
pub struct Fiber {
    pub flags: i32,
    /// Stack offset of the current frame's slot 0, 0 when no frame
    pub frame: i32,
    pub stackstart: i32,
    pub stacktop: i32,
    pub maxstack: i32,
    pub data: Vec<Value>,
    pub frames: Vec<StackFrame>,
    /// The fiber this one yielded into
    pub child: Option<FiberRef>,
}

impl Fiber {
    pub fn new(maxstack: i32) -> Fiber {
        let mut fiber = Fiber {
            flags: 0,
            frame: 0,
            stackstart: FRAME_SIZE,
            stacktop: FRAME_SIZE,
            maxstack,
            data: Vec::new(),
            frames: Vec::new(),
            child: None,
        };
        fiber.set_status(FiberStatus::New);
        fiber
    }

    pub fn status(&self) -> FiberStatus {
        let raw = ((self.flags & FIBER_STATUS_MASK) >> FIBER_STATUS_OFFSET) as u8;
        FiberStatus::try_from(raw).unwrap_or(FiberStatus::Dead)
    }

    pub fn set_status(&mut self, status: FiberStatus) {
        self.flags = (self.flags & !FIBER_STATUS_MASK)
            | ((status as i32) << FIBER_STATUS_OFFSET);
    }

    /// Frame whose slot 0 sits at `base`
    pub fn frame_at(&self, base: i32) -> Option<&StackFrame> {
        self.frames.iter().find(|f| f.base == base)
    }

    pub fn frame_at_mut(&mut self, base: i32) -> Option<&mut StackFrame> {
        self.frames.iter_mut().find(|f| f.base == base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_flags() {
        let mut fiber = Fiber::new(1024);
        assert_eq!(fiber.status(), FiberStatus::New);
        fiber.set_status(FiberStatus::Pending);
        assert_eq!(fiber.status(), FiberStatus::Pending);
        fiber.set_status(FiberStatus::Dead);
        assert_eq!(fiber.status(), FiberStatus::Dead);
    }

    #[test]
    fn test_status_leaves_other_flags_alone() {
        let mut fiber = Fiber::new(64);
        fiber.flags |= FIBER_FLAG_HASCHILD | 0x3;
        fiber.set_status(FiberStatus::Error);
        assert_eq!(fiber.flags & FIBER_FLAG_HASCHILD, FIBER_FLAG_HASCHILD);
        assert_eq!(fiber.flags & 0x3, 0x3);
        assert_eq!(fiber.status(), FiberStatus::Error);
    }

    #[test]
    fn test_frame_lookup_by_base() {
        let mut fiber = Fiber::new(64);
        fiber.frames.push(StackFrame {
            base: FRAME_SIZE,
            flags: 0,
            prevframe: 0,
            pc: 0,
            func: None,
            env: None,
        });
        assert!(fiber.frame_at(FRAME_SIZE).is_some());
        assert!(fiber.frame_at(2 * FRAME_SIZE).is_none());
    }
}
