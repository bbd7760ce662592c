//! Marshaling: value graph to bytes
//!
//! The writer walks a value graph depth first, left to right, and
//! appends one record per value. Reference-typed values it has already
//! written are replaced by back-references, so shared objects and cycles
//! cost a few bytes each after the first occurrence.
//!
//! Three interning tables drive that: the reference table proper (value
//! identity to id, ids handed out in first-visit order), and two flat
//! vectors for function definitions and captured environments, which
//! have their own reference record kinds.
//!
//! The order an object is committed to the reference table matters and
//! is part of the format. Kinds that can only reach themselves through a
//! mutable container (tuples, structs, functions) commit after their
//! body; everything a cycle can pass through directly (arrays, tables,
//! buffers, fibers, abstracts) commits before, so a recursive occurrence
//! becomes a back-reference instead of infinite regress.

use crate::abstracts::AbstractRegistry;
use crate::error::MarshalError;
use crate::wire::{Lead, check_depth, int_from_double};
use std::collections::HashMap;
use tern_core::fiber::{FIBER_FLAG_HASCHILD, FRAME_SIZE, FiberStatus, STACKFRAME_HASENV};
use tern_core::function::{EnvStorage, FuncDefFlags};
use tern_core::heap::{AbstractRef, FiberRef, FuncDefRef, FuncEnvRef, Heap, TableRef};
use tern_core::value::Value;
use tracing::debug;

pub(crate) struct MarshalState<'a> {
    pub(crate) heap: &'a Heap,
    buf: &'a mut Vec<u8>,
    /// Value identity to back-reference id
    seen: HashMap<Value, i32>,
    nextid: i32,
    /// Reverse registry: value to symbolic name
    rreg: Option<TableRef>,
    types: Option<&'a AbstractRegistry>,
    seen_envs: Vec<FuncEnvRef>,
    seen_defs: Vec<FuncDefRef>,
}

impl<'a> MarshalState<'a> {
    fn pushbyte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn pushbytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Varint: 1 byte for [0, 128), 2 bytes for [-8192, 8191],
    /// otherwise the 5-byte big-endian form behind `Lead::Integer`.
    fn pushint(&mut self, x: i32) {
        if (0..128).contains(&x) {
            self.buf.push(x as u8);
        } else if (-8192..=8191).contains(&x) {
            self.buf.push((((x >> 8) & 0x3F) | 0x80) as u8);
            self.buf.push((x & 0xFF) as u8);
        } else {
            self.buf.push(Lead::Integer as u8);
            self.buf.extend_from_slice(&x.to_be_bytes());
        }
    }

    fn mark_seen(&mut self, x: &Value) {
        self.seen.insert(x.clone(), self.nextid);
        self.nextid += 1;
    }

    pub(crate) fn marshal_one(&mut self, x: &Value, flags: i32) -> Result<(), MarshalError> {
        check_depth(flags)?;

        // Simple primitives, no benefit from memoization
        match x {
            Value::Nil => {
                self.pushbyte(Lead::Nil as u8);
                return Ok(());
            }
            Value::Bool(false) => {
                self.pushbyte(Lead::False as u8);
                return Ok(());
            }
            Value::Bool(true) => {
                self.pushbyte(Lead::True as u8);
                return Ok(());
            }
            Value::Number(n) => {
                if let Some(i) = int_from_double(*n) {
                    self.pushint(i);
                    return Ok(());
                }
            }
            _ => {}
        }

        // Back-reference, then registry name, before any body
        if let Some(&id) = self.seen.get(x) {
            self.pushbyte(Lead::Reference as u8);
            self.pushint(id);
            return Ok(());
        }
        if let Some(rreg) = self.rreg {
            if let Some(Value::Symbol(name)) = self.heap.table(rreg).get(x) {
                let name = name.clone();
                self.mark_seen(x);
                self.pushbyte(Lead::Registry as u8);
                self.pushint(name.len() as i32);
                self.pushbytes(name.as_bytes());
                return Ok(());
            }
        }

        match x {
            Value::Number(n) => {
                self.pushbyte(Lead::Real as u8);
                self.pushbytes(&n.to_le_bytes());
                self.mark_seen(x);
            }
            Value::Str(s) | Value::Symbol(s) | Value::Keyword(s) => {
                let s = s.clone();
                self.mark_seen(x);
                let lead = match x {
                    Value::Str(_) => Lead::Str,
                    Value::Symbol(_) => Lead::Symbol,
                    _ => Lead::Keyword,
                };
                self.pushbyte(lead as u8);
                self.pushint(s.len() as i32);
                self.pushbytes(s.as_bytes());
            }
            Value::Buffer(r) => {
                self.mark_seen(x);
                self.pushbyte(Lead::Buffer as u8);
                let heap = self.heap;
                let bytes = heap.buffer(*r);
                self.pushint(bytes.len() as i32);
                self.pushbytes(bytes);
            }
            Value::Array(r) => {
                self.mark_seen(x);
                self.pushbyte(Lead::Array as u8);
                let heap = self.heap;
                let items = heap.array(*r);
                self.pushint(items.len() as i32);
                for item in items {
                    self.marshal_one(item, flags + 1)?;
                }
            }
            Value::Tuple(t) => {
                self.pushbyte(Lead::Tuple as u8);
                self.pushint(t.len() as i32);
                self.pushint(t.flag());
                for item in t.items() {
                    self.marshal_one(item, flags + 1)?;
                }
                // Committed after the body
                self.mark_seen(x);
            }
            Value::Table(r) => {
                self.mark_seen(x);
                let heap = self.heap;
                let table = heap.table(*r);
                let lead = if table.proto().is_some() {
                    Lead::TableProto
                } else {
                    Lead::Table
                };
                self.pushbyte(lead as u8);
                self.pushint(table.len() as i32);
                if let Some(proto) = table.proto() {
                    self.marshal_one(&Value::Table(proto), flags + 1)?;
                }
                for (k, v) in table.iter() {
                    self.marshal_one(k, flags + 1)?;
                    self.marshal_one(v, flags + 1)?;
                }
            }
            Value::Struct(s) => {
                self.pushbyte(Lead::Struct as u8);
                self.pushint(s.len() as i32);
                for (k, v) in s.pairs() {
                    self.marshal_one(k, flags + 1)?;
                    self.marshal_one(v, flags + 1)?;
                }
                // Committed after the body
                self.mark_seen(x);
            }
            Value::Abstract(r) => {
                self.marshal_one_abstract(x, *r, flags)?;
            }
            Value::Function(r) => {
                self.pushbyte(Lead::Function as u8);
                let heap = self.heap;
                let func = heap.function(*r);
                self.marshal_one_def(func.def, flags)?;
                // Committed after the def, before the environments
                self.mark_seen(x);
                for env in &func.envs {
                    self.marshal_one_env(*env, flags + 1)?;
                }
            }
            Value::Fiber(r) => {
                self.mark_seen(x);
                self.pushbyte(Lead::Fiber as u8);
                self.marshal_one_fiber(*r, flags + 1)?;
            }
            // Handled by the early returns above
            Value::Nil | Value::Bool(_) => {}
        }
        Ok(())
    }

    fn marshal_one_def(&mut self, r: FuncDefRef, flags: i32) -> Result<(), MarshalError> {
        check_depth(flags)?;
        if let Some(idx) = self.seen_defs.iter().position(|d| *d == r) {
            self.pushbyte(Lead::FuncDefRef as u8);
            self.pushint(idx as i32);
            return Ok(());
        }
        self.seen_defs.push(r);
        let heap = self.heap;
        let def = heap.funcdef(r);
        let defflags = def.normalized_flags();
        self.pushint(defflags.bits());
        self.pushint(def.slotcount);
        self.pushint(def.arity);
        self.pushint(def.constants.len() as i32);
        self.pushint(def.bytecode.len() as i32);
        if defflags.contains(FuncDefFlags::HASENVS) {
            self.pushint(def.environments.len() as i32);
        }
        if defflags.contains(FuncDefFlags::HASDEFS) {
            self.pushint(def.defs.len() as i32);
        }
        if let Some(name) = &def.name {
            self.marshal_one(&Value::Str(name.clone()), flags + 1)?;
        }
        if let Some(source) = &def.source {
            self.marshal_one(&Value::Str(source.clone()), flags + 1)?;
        }
        for constant in &def.constants {
            self.marshal_one(constant, flags + 1)?;
        }
        for word in &def.bytecode {
            self.pushbytes(&word.to_le_bytes());
        }
        for &env_index in &def.environments {
            self.pushint(env_index);
        }
        for &sub in &def.defs {
            self.marshal_one_def(sub, flags + 1)?;
        }
        if let Some(map) = &def.sourcemap {
            // Delta-coded: distance from the previous end, then span width
            let mut current = 0;
            for mapping in map {
                self.pushint(mapping.start.wrapping_sub(current));
                self.pushint(mapping.end.wrapping_sub(mapping.start));
                current = mapping.end;
            }
        }
        Ok(())
    }

    fn marshal_one_env(&mut self, r: FuncEnvRef, flags: i32) -> Result<(), MarshalError> {
        check_depth(flags)?;
        if let Some(idx) = self.seen_envs.iter().position(|e| *e == r) {
            self.pushbyte(Lead::FuncEnvRef as u8);
            self.pushint(idx as i32);
            return Ok(());
        }
        self.seen_envs.push(r);
        let heap = self.heap;
        let env = heap.funcenv(r);
        self.pushint(env.offset);
        self.pushint(env.length);
        if env.offset != 0 {
            match &env.storage {
                EnvStorage::OnStack(fiber) => {
                    self.marshal_one(&Value::Fiber(*fiber), flags + 1)?;
                }
                EnvStorage::Detached(_) => return Err(MarshalError::EnvOffsetMismatch),
            }
        } else {
            match &env.storage {
                EnvStorage::Detached(values) => {
                    if values.len() as i32 != env.length {
                        return Err(MarshalError::EnvLengthMismatch);
                    }
                    for value in values {
                        self.marshal_one(value, flags + 1)?;
                    }
                }
                EnvStorage::OnStack(_) => return Err(MarshalError::EnvOffsetMismatch),
            }
        }
        Ok(())
    }

    fn marshal_one_fiber(&mut self, r: FiberRef, flags: i32) -> Result<(), MarshalError> {
        check_depth(flags)?;
        let heap = self.heap;
        let fiber = heap.fiber(r);
        if fiber.status() == FiberStatus::Alive {
            return Err(MarshalError::AliveFiber);
        }
        let mut fflags = fiber.flags;
        if fiber.child.is_some() {
            fflags |= FIBER_FLAG_HASCHILD;
        }
        self.pushint(fflags);
        self.pushint(fiber.frame);
        self.pushint(fiber.stackstart);
        self.pushint(fiber.stacktop);
        self.pushint(fiber.maxstack);

        // Walk frames newest to oldest along the prevframe chain
        let mut i = fiber.frame;
        let mut j = fiber.stackstart - FRAME_SIZE;
        while i > 0 {
            let frame = fiber.frame_at(i).ok_or(MarshalError::BadStackSetup)?;
            let func = frame.func.ok_or(MarshalError::NativeFrame)?;
            let mut frameflags = frame.flags;
            if frame.env.is_some() {
                frameflags |= STACKFRAME_HASENV;
            }
            self.pushint(frameflags);
            self.pushint(frame.prevframe);
            self.pushint(frame.pc);
            self.marshal_one(&Value::Function(func), flags + 1)?;
            if let Some(env) = frame.env {
                self.marshal_one_env(env, flags + 1)?;
            }
            if j > i {
                if j as usize > fiber.data.len() {
                    return Err(MarshalError::BadStackSetup);
                }
                for k in i..j {
                    self.marshal_one(&fiber.data[k as usize], flags + 1)?;
                }
            }
            j = i - FRAME_SIZE;
            i = frame.prevframe;
        }
        if let Some(child) = fiber.child {
            self.marshal_one(&Value::Fiber(child), flags + 1)?;
        }
        Ok(())
    }

    fn marshal_one_abstract(
        &mut self,
        x: &Value,
        r: AbstractRef,
        flags: i32,
    ) -> Result<(), MarshalError> {
        let heap = self.heap;
        let cell = heap.abstract_cell(r);
        let ty = *self
            .types
            .and_then(|types| types.get(&cell.type_name))
            .ok_or_else(|| MarshalError::UnregisteredAbstractType(cell.type_name.clone()))?;
        self.mark_seen(x);
        self.pushbyte(Lead::Abstract as u8);
        self.marshal_one(&Value::keyword(cell.type_name.as_str()), flags + 1)?;
        self.pushint(cell.size);
        (ty.marshal)(cell, &mut MarshalContext { st: self, flags })
    }
}

/// Streaming access handed to abstract-type marshal hooks.
///
/// Nested values written through here go through the full protocol,
/// reference table included.
pub struct MarshalContext<'a, 'b> {
    st: &'a mut MarshalState<'b>,
    flags: i32,
}

impl MarshalContext<'_, '_> {
    pub fn heap(&self) -> &Heap {
        self.st.heap
    }

    pub fn write_byte(&mut self, b: u8) {
        self.st.pushbyte(b);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.st.pushbytes(bytes);
    }

    pub fn write_int(&mut self, x: i32) {
        self.st.pushint(x);
    }

    pub fn write_value(&mut self, x: &Value) -> Result<(), MarshalError> {
        self.st.marshal_one(x, self.flags + 1)
    }
}

/// Marshal one value, appending to `buf`.
///
/// `rreg` is an optional reverse registry table (value to symbol);
/// values found in it are emitted as named registry records instead of
/// bodies. `types` supplies abstract-type hooks; without it any abstract
/// value fails.
pub fn marshal_into(
    heap: &Heap,
    x: &Value,
    rreg: Option<TableRef>,
    types: Option<&AbstractRegistry>,
    buf: &mut Vec<u8>,
) -> Result<(), MarshalError> {
    let start = buf.len();
    let mut st = MarshalState {
        heap,
        buf,
        seen: HashMap::new(),
        nextid: 0,
        rreg,
        types,
        seen_envs: Vec::new(),
        seen_defs: Vec::new(),
    };
    st.marshal_one(x, 0)?;
    let written = st.buf.len() - start;
    debug!(kind = x.type_name(), bytes = written, "marshaled value");
    Ok(())
}

/// Marshal one value into a fresh buffer
pub fn marshal(
    heap: &Heap,
    x: &Value,
    rreg: Option<TableRef>,
) -> Result<Vec<u8>, MarshalError> {
    let mut buf = Vec::new();
    marshal_into(heap, x, rreg, None, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::heap::TableData;

    #[test]
    fn test_nil_true_false() {
        let heap = Heap::new();
        assert_eq!(marshal(&heap, &Value::Nil, None).unwrap(), [201]);
        assert_eq!(marshal(&heap, &Value::Bool(false), None).unwrap(), [202]);
        assert_eq!(marshal(&heap, &Value::Bool(true), None).unwrap(), [203]);
    }

    #[test]
    fn test_integer_forms() {
        let heap = Heap::new();
        let enc = |x: f64| marshal(&heap, &Value::Number(x), None).unwrap();
        assert_eq!(enc(0.0), [0x00]);
        assert_eq!(enc(127.0), [0x7F]);
        assert_eq!(enc(128.0), [0x80, 0x80]);
        assert_eq!(enc(-1.0), [0xBF, 0xFF]);
        assert_eq!(enc(1_000_000.0), [205, 0x00, 0x0F, 0x42, 0x40]);
    }

    #[test]
    fn test_two_byte_boundaries() {
        let heap = Heap::new();
        let enc = |x: f64| marshal(&heap, &Value::Number(x), None).unwrap();
        assert_eq!(enc(8191.0).len(), 2);
        assert_eq!(enc(8192.0).len(), 5);
        assert_eq!(enc(-8192.0).len(), 2);
        assert_eq!(enc(-8193.0).len(), 5);
    }

    #[test]
    fn test_real_is_little_endian() {
        let heap = Heap::new();
        let bytes = marshal(&heap, &Value::Number(0.5), None).unwrap();
        let mut expected = vec![200u8];
        expected.extend_from_slice(&0.5f64.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_string_wire_form() {
        let heap = Heap::new();
        let bytes = marshal(&heap, &Value::string("hi"), None).unwrap();
        assert_eq!(bytes, [206, 2, b'h', b'i']);
    }

    #[test]
    fn test_shared_array_emits_back_reference() {
        let mut heap = Heap::new();
        let inner = heap.alloc_array(vec![]);
        let outer = heap.alloc_array(vec![Value::Array(inner), Value::Array(inner)]);
        let bytes = marshal(&heap, &Value::Array(outer), None).unwrap();
        // outer id 0, inner id 1, second occurrence is a back-reference
        assert_eq!(hex::encode(bytes), "d102d100da01");
    }

    #[test]
    fn test_registry_record() {
        let mut heap = Heap::new();
        let target = heap.alloc_array(vec![]);
        let mut rreg = TableData::new();
        rreg.put(Value::Array(target), Value::symbol("core/hits"));
        let rreg = heap.alloc_table(rreg);
        let bytes = marshal(&heap, &Value::Array(target), Some(rreg)).unwrap();
        assert_eq!(bytes[0], 216);
        assert_eq!(bytes[1] as usize, "core/hits".len());
        assert_eq!(&bytes[2..], b"core/hits");
    }

    #[test]
    fn test_alive_fiber_refuses() {
        let mut heap = Heap::new();
        let mut fiber = tern_core::fiber::Fiber::new(64);
        fiber.set_status(FiberStatus::Alive);
        let fiber = heap.alloc_fiber(fiber);
        let err = marshal(&heap, &Value::Fiber(fiber), None).unwrap_err();
        assert!(matches!(err, MarshalError::AliveFiber));
    }

    #[test]
    fn test_unregistered_abstract_refuses() {
        let mut heap = Heap::new();
        let cell = heap.alloc_abstract("core/rng", 8, Box::new(7u64));
        let err = marshal(&heap, &Value::Abstract(cell), None).unwrap_err();
        assert!(matches!(err, MarshalError::UnregisteredAbstractType(_)));
    }

    #[test]
    fn test_recursion_guard_trips() {
        let mut heap = Heap::new();
        let mut inner = heap.alloc_array(vec![]);
        for _ in 0..2000 {
            inner = heap.alloc_array(vec![Value::Array(inner)]);
        }
        let err = marshal(&heap, &Value::Array(inner), None).unwrap_err();
        assert!(matches!(err, MarshalError::StackOverflow));
    }
}
