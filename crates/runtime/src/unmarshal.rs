//! Unmarshaling: bytes to value graph
//!
//! The reader is the writer's mirror: a cursor over the input, a lookup
//! vector that grows at exactly the points the writer handed out ids,
//! and flat lookup vectors for function definitions and environments.
//! Back-references of all three kinds resolve by index into those.
//!
//! Every count on the wire is validated against the bytes that remain
//! before anything is allocated for it, every embedded value is type
//! checked at its use site, and every decoded definition passes through
//! the structural bytecode verifier. Frame records are re-validated
//! against the definitions they name, so a hostile buffer cannot build a
//! fiber the interpreter would step outside of.
//!
//! All allocation goes through the heap, so a decode that fails half way
//! leaves only heap cells behind for the host collector.

use crate::abstracts::AbstractRegistry;
use crate::error::MarshalError;
use crate::wire::{Lead, check_depth};
use tern_core::fiber::{
    FIBER_FLAG_HASCHILD, FRAME_SIZE, Fiber, STACKFRAME_HASENV, StackFrame,
};
use tern_core::function::{EnvStorage, FuncDef, FuncDefFlags, FuncEnv, Function, SourceMapping};
use tern_core::heap::{FiberRef, FuncDefRef, FuncEnvRef, Heap, TableData, TableRef};
use tern_core::ternstr::TernStr;
use tern_core::value::{Struct, Tuple, Value};
use tern_core::verify::verify;
use tracing::debug;

pub(crate) struct UnmarshalState<'a> {
    pub(crate) heap: &'a mut Heap,
    data: &'a [u8],
    pos: usize,
    /// Values in the order the writer assigned ids
    lookup: Vec<Value>,
    lookup_defs: Vec<FuncDefRef>,
    lookup_envs: Vec<FuncEnvRef>,
    /// Forward registry: symbol to value
    reg: Option<TableRef>,
    types: Option<&'a AbstractRegistry>,
}

impl<'a> UnmarshalState<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn peek(&self) -> Result<u8, MarshalError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(MarshalError::UnexpectedEnd(self.pos))
    }

    fn readbytes(&mut self, n: usize) -> Result<&'a [u8], MarshalError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(MarshalError::UnexpectedEnd(self.pos))?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(MarshalError::UnexpectedEnd(self.pos))?;
        self.pos = end;
        Ok(bytes)
    }

    /// Varint decoder; the 2-byte form sign-extends arithmetically
    fn readint(&mut self) -> Result<i32, MarshalError> {
        let b = self.peek()?;
        if b < 128 {
            self.pos += 1;
            return Ok(b as i32);
        }
        if b < 192 {
            let bytes = self.readbytes(2)?;
            let v = (((bytes[0] & 0x3F) as i32) << 8) | bytes[1] as i32;
            return Ok((v << 18) >> 18);
        }
        if b == Lead::Integer as u8 {
            self.pos += 1;
            let bytes = self.readbytes(4)?;
            return Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }
        Err(MarshalError::ExpectedInteger {
            byte: b,
            offset: self.pos,
        })
    }

    /// Reject a count the remaining input cannot possibly satisfy at
    /// `bytes_per` input bytes per element
    fn checked_count(&self, count: i32, bytes_per: usize) -> Result<usize, MarshalError> {
        if count < 0 {
            return Err(MarshalError::InvalidLength(count));
        }
        let n = count as usize;
        match n.checked_mul(bytes_per) {
            Some(total) if total <= self.remaining() => Ok(n),
            _ => Err(MarshalError::UnexpectedEnd(self.pos)),
        }
    }

    fn read_len_prefixed(&mut self) -> Result<&'a [u8], MarshalError> {
        let len = self.readint()?;
        let len = self.checked_count(len, 1)?;
        self.readbytes(len)
    }

    fn type_mismatch(&self, expected: &'static str, got: &Value) -> MarshalError {
        MarshalError::TypeMismatch {
            expected,
            got: got.type_name(),
            offset: self.pos,
        }
    }

    pub(crate) fn unmarshal_one(&mut self, flags: i32) -> Result<Value, MarshalError> {
        check_depth(flags)?;
        let lead_byte = self.peek()?;

        // Bytes below 200 open a varint integer
        if lead_byte < 200 {
            let x = self.readint()?;
            return Ok(Value::Number(x as f64));
        }
        let Ok(lead) = Lead::try_from(lead_byte) else {
            return Err(MarshalError::UnknownLeadByte {
                byte: lead_byte,
                offset: self.pos,
            });
        };
        match lead {
            Lead::Nil => {
                self.pos += 1;
                Ok(Value::Nil)
            }
            Lead::False => {
                self.pos += 1;
                Ok(Value::Bool(false))
            }
            Lead::True => {
                self.pos += 1;
                Ok(Value::Bool(true))
            }
            Lead::Integer => {
                let x = self.readint()?;
                Ok(Value::Number(x as f64))
            }
            Lead::Real => {
                self.pos += 1;
                let bytes = self.readbytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let out = Value::Number(f64::from_le_bytes(raw));
                self.lookup.push(out.clone());
                Ok(out)
            }
            Lead::Str => {
                self.pos += 1;
                let bytes = self.read_len_prefixed()?;
                let out = Value::Str(TernStr::from_bytes(bytes));
                self.lookup.push(out.clone());
                Ok(out)
            }
            Lead::Symbol => {
                self.pos += 1;
                let bytes = self.read_len_prefixed()?;
                let out = Value::Symbol(TernStr::from_bytes(bytes));
                self.lookup.push(out.clone());
                Ok(out)
            }
            Lead::Keyword => {
                self.pos += 1;
                let bytes = self.read_len_prefixed()?;
                let out = Value::Keyword(TernStr::from_bytes(bytes));
                self.lookup.push(out.clone());
                Ok(out)
            }
            Lead::Buffer => {
                self.pos += 1;
                let bytes = self.read_len_prefixed()?.to_vec();
                let out = Value::Buffer(self.heap.alloc_buffer(bytes));
                self.lookup.push(out.clone());
                Ok(out)
            }
            Lead::Registry => {
                self.pos += 1;
                let name = Value::Symbol(TernStr::from_bytes(self.read_len_prefixed()?));
                let out = match self.reg {
                    Some(reg) => self.heap.table(reg).get(&name).cloned().unwrap_or(Value::Nil),
                    None => Value::Nil,
                };
                self.lookup.push(out.clone());
                Ok(out)
            }
            Lead::Reference => {
                self.pos += 1;
                let id = self.readint()?;
                if id < 0 || id as usize >= self.lookup.len() {
                    return Err(MarshalError::InvalidReference(id));
                }
                Ok(self.lookup[id as usize].clone())
            }
            Lead::Array => {
                self.pos += 1;
                let count = self.readint()?;
                let len = self.checked_count(count, 1)?;
                let array = self.heap.alloc_array(vec![Value::Nil; len]);
                let out = Value::Array(array);
                // In the table before the elements, so cycles resolve
                self.lookup.push(out.clone());
                for i in 0..len {
                    let item = self.unmarshal_one(flags + 1)?;
                    self.heap.array_mut(array)[i] = item;
                }
                Ok(out)
            }
            Lead::Tuple => {
                self.pos += 1;
                let count = self.readint()?;
                let len = self.checked_count(count, 1)?;
                let flag = self.readint()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.unmarshal_one(flags + 1)?);
                }
                let out = Value::Tuple(Tuple::new(items, flag));
                self.lookup.push(out.clone());
                Ok(out)
            }
            Lead::Struct => {
                self.pos += 1;
                let count = self.readint()?;
                let len = self.checked_count(count, 2)?;
                let mut pairs = Vec::with_capacity(len);
                for _ in 0..len {
                    let key = self.unmarshal_one(flags + 1)?;
                    let value = self.unmarshal_one(flags + 1)?;
                    pairs.push((key, value));
                }
                let out = Value::Struct(Struct::new(pairs));
                self.lookup.push(out.clone());
                Ok(out)
            }
            Lead::Table | Lead::TableProto => {
                self.pos += 1;
                let count = self.readint()?;
                let len = self.checked_count(count, 2)?;
                let table = self.heap.alloc_table(TableData::new());
                let out = Value::Table(table);
                self.lookup.push(out.clone());
                if lead == Lead::TableProto {
                    let proto = match self.unmarshal_one(flags + 1)? {
                        Value::Table(proto) => proto,
                        other => return Err(self.type_mismatch("table", &other)),
                    };
                    self.heap.table_mut(table).set_proto(Some(proto));
                }
                for _ in 0..len {
                    let key = self.unmarshal_one(flags + 1)?;
                    let value = self.unmarshal_one(flags + 1)?;
                    self.heap.table_mut(table).put(key, value);
                }
                Ok(out)
            }
            Lead::Fiber => {
                self.pos += 1;
                let fiber = self.unmarshal_one_fiber(flags)?;
                Ok(Value::Fiber(fiber))
            }
            Lead::Function => {
                self.pos += 1;
                let def = self.unmarshal_one_def(flags + 1)?;
                let env_count = self.heap.funcdef(def).environments.len();
                let func = self.heap.alloc_function(Function::new(def));
                let out = Value::Function(func);
                // In the table after the def, before the environments
                self.lookup.push(out.clone());
                for _ in 0..env_count {
                    let env = self.unmarshal_one_env(flags + 1)?;
                    self.heap.function_mut(func).envs.push(env);
                }
                Ok(out)
            }
            Lead::Abstract => {
                self.pos += 1;
                self.unmarshal_one_abstract(flags)
            }
            // Only meaningful inside function records
            Lead::FuncEnvRef | Lead::FuncDefRef => Err(MarshalError::UnknownLeadByte {
                byte: lead_byte,
                offset: self.pos,
            }),
        }
    }

    fn unmarshal_one_def(&mut self, flags: i32) -> Result<FuncDefRef, MarshalError> {
        check_depth(flags)?;
        if self.peek()? == Lead::FuncDefRef as u8 {
            self.pos += 1;
            let index = self.readint()?;
            if index < 0 || index as usize >= self.lookup_defs.len() {
                return Err(MarshalError::InvalidFuncDefReference(index));
            }
            return Ok(self.lookup_defs[index as usize]);
        }

        // In the lookup before the body, so nested defs can refer back
        let def = self.heap.alloc_funcdef(FuncDef::new(0, 0, Vec::new()));
        self.lookup_defs.push(def);

        let defflags = FuncDefFlags::from_bits_retain(self.readint()?);
        let slotcount = self.readint()?;
        let arity = self.readint()?;
        let constants_count = self.readint()?;
        let bytecode_count = self.readint()?;
        let environments_count = if defflags.contains(FuncDefFlags::HASENVS) {
            self.readint()?
        } else {
            0
        };
        let defs_count = if defflags.contains(FuncDefFlags::HASDEFS) {
            self.readint()?
        } else {
            0
        };
        {
            let d = self.heap.funcdef_mut(def);
            d.flags = defflags;
            d.slotcount = slotcount;
            d.arity = arity;
        }

        if defflags.contains(FuncDefFlags::HASNAME) {
            let name = match self.unmarshal_one(flags + 1)? {
                Value::Str(name) => name,
                other => return Err(self.type_mismatch("string", &other)),
            };
            self.heap.funcdef_mut(def).name = Some(name);
        }
        if defflags.contains(FuncDefFlags::HASSOURCE) {
            let source = match self.unmarshal_one(flags + 1)? {
                Value::Str(source) => source,
                other => return Err(self.type_mismatch("string", &other)),
            };
            self.heap.funcdef_mut(def).source = Some(source);
        }

        let constants_count = self.checked_count(constants_count, 1)?;
        for _ in 0..constants_count {
            let constant = self.unmarshal_one(flags + 1)?;
            self.heap.funcdef_mut(def).constants.push(constant);
        }

        let bytecode_count = self.checked_count(bytecode_count, 4)?;
        let mut bytecode = Vec::with_capacity(bytecode_count);
        for _ in 0..bytecode_count {
            let raw = self.readbytes(4)?;
            bytecode.push(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
        }
        self.heap.funcdef_mut(def).bytecode = bytecode;

        let environments_count = self.checked_count(environments_count, 1)?;
        for _ in 0..environments_count {
            let env_index = self.readint()?;
            self.heap.funcdef_mut(def).environments.push(env_index);
        }

        let defs_count = self.checked_count(defs_count, 1)?;
        for _ in 0..defs_count {
            let sub = self.unmarshal_one_def(flags + 1)?;
            self.heap.funcdef_mut(def).defs.push(sub);
        }

        if defflags.contains(FuncDefFlags::HASSOURCEMAP) {
            let mut map = Vec::with_capacity(bytecode_count);
            let mut current: i32 = 0;
            for _ in 0..bytecode_count {
                current = current.wrapping_add(self.readint()?);
                let start = current;
                current = current.wrapping_add(self.readint()?);
                map.push(SourceMapping {
                    start,
                    end: current,
                });
            }
            self.heap.funcdef_mut(def).sourcemap = Some(map);
        }

        if !verify(self.heap.funcdef(def)) {
            return Err(MarshalError::InvalidBytecode);
        }
        Ok(def)
    }

    fn unmarshal_one_env(&mut self, flags: i32) -> Result<FuncEnvRef, MarshalError> {
        check_depth(flags)?;
        if self.peek()? == Lead::FuncEnvRef as u8 {
            self.pos += 1;
            let index = self.readint()?;
            if index < 0 || index as usize >= self.lookup_envs.len() {
                return Err(MarshalError::InvalidFuncEnvReference(index));
            }
            return Ok(self.lookup_envs[index as usize]);
        }

        let env = self.heap.alloc_funcenv(FuncEnv::detached(Vec::new()));
        self.lookup_envs.push(env);
        let offset = self.readint()?;
        let length = self.readint()?;
        if offset != 0 {
            // On-stack variant
            let fiber = match self.unmarshal_one(flags + 1)? {
                Value::Fiber(fiber) => fiber,
                other => return Err(self.type_mismatch("fiber", &other)),
            };
            // The fiber walk may have imprinted the slot range already
            let e = self.heap.funcenv_mut(env);
            if e.offset != 0 && e.offset != offset {
                return Err(MarshalError::EnvOffsetMismatch);
            }
            if e.length != 0 && e.length != length {
                return Err(MarshalError::EnvLengthMismatch);
            }
            e.offset = offset;
            e.length = length;
            e.storage = EnvStorage::OnStack(fiber);
        } else {
            // Off-stack variant
            let count = self.checked_count(length, 1)?;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(self.unmarshal_one(flags + 1)?);
            }
            let e = self.heap.funcenv_mut(env);
            e.offset = 0;
            e.length = length;
            e.storage = EnvStorage::Detached(values);
        }
        Ok(env)
    }

    fn unmarshal_one_fiber(&mut self, flags: i32) -> Result<FiberRef, MarshalError> {
        let fiber = self.heap.alloc_fiber(Fiber::new(0));
        // In the table before anything is read, so stack slots and
        // environments can refer back to the fiber itself
        self.lookup.push(Value::Fiber(fiber));

        let fflags = self.readint()?;
        let frame = self.readint()?;
        let stackstart = self.readint()?;
        let stacktop = self.readint()?;
        let maxstack = self.readint()?;

        if frame
            .checked_add(FRAME_SIZE)
            .is_none_or(|bottom| bottom > stackstart)
            || stackstart > stacktop
            || stacktop > maxstack
        {
            return Err(MarshalError::BadStackSetup);
        }

        let capacity = stacktop
            .checked_add(10)
            .ok_or(MarshalError::BadStackSetup)? as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| MarshalError::OutOfMemory)?;
        data.resize(capacity, Value::Nil);
        {
            let f = self.heap.fiber_mut(fiber);
            f.flags = fflags;
            f.stackstart = stackstart;
            f.stacktop = stacktop;
            f.maxstack = maxstack;
            f.data = data;
        }

        // Rebuild frames newest to oldest, mirroring the writer's walk
        let mut stack = frame;
        let mut limit = stackstart - FRAME_SIZE;
        while stack > 0 {
            let frameflags = self.readint()?;
            let prevframe = self.readint()?;
            let pcdiff = self.readint()?;

            let func = match self.unmarshal_one(flags + 1)? {
                Value::Function(func) => func,
                other => return Err(self.type_mismatch("function", &other)),
            };
            let def = self.heap.function(func).def;

            let mut env = None;
            let mut cleanflags = frameflags;
            if frameflags & STACKFRAME_HASENV != 0 {
                cleanflags &= !STACKFRAME_HASENV;
                let offset = stack;
                let length = limit - stack;
                let env_ref = self.unmarshal_one_env(flags + 1)?;
                let e = self.heap.funcenv_mut(env_ref);
                if e.offset != 0 && e.offset != offset {
                    return Err(MarshalError::EnvOffsetMismatch);
                }
                if e.length != 0 && e.length != length {
                    return Err(MarshalError::EnvLengthMismatch);
                }
                e.offset = offset;
                e.length = length;
                e.storage = EnvStorage::OnStack(fiber);
                env = Some(env_ref);
            }

            let d = self.heap.funcdef(def);
            if d.slotcount != limit - stack {
                return Err(MarshalError::FrameSizeMismatch);
            }
            if pcdiff < 0 || pcdiff >= d.bytecode.len() as i32 {
                return Err(MarshalError::InvalidPc);
            }
            if prevframe
                .checked_add(FRAME_SIZE)
                .is_none_or(|bottom| bottom > stack)
            {
                return Err(MarshalError::FrameMisaligned);
            }

            for k in stack..limit {
                let slot = self.unmarshal_one(flags + 1)?;
                self.heap.fiber_mut(fiber).data[k as usize] = slot;
            }

            self.heap.fiber_mut(fiber).frames.push(StackFrame {
                base: stack,
                flags: cleanflags,
                prevframe,
                pc: pcdiff,
                func: Some(func),
                env,
            });

            limit = stack - FRAME_SIZE;
            stack = prevframe;
        }
        if stack < 0 {
            return Err(MarshalError::TooManyFrames);
        }

        if fflags & FIBER_FLAG_HASCHILD != 0 {
            let child = match self.unmarshal_one(flags + 1)? {
                Value::Fiber(child) => child,
                other => return Err(self.type_mismatch("fiber", &other)),
            };
            let f = self.heap.fiber_mut(fiber);
            f.flags &= !FIBER_FLAG_HASCHILD;
            f.child = Some(child);
        }

        self.heap.fiber_mut(fiber).frame = frame;
        Ok(fiber)
    }

    fn unmarshal_one_abstract(&mut self, flags: i32) -> Result<Value, MarshalError> {
        // Reserve this value's reference slot before the type name
        // claims the next one
        let slot = self.lookup.len();
        self.lookup.push(Value::Nil);

        let name = match self.unmarshal_one(flags + 1)? {
            Value::Keyword(name) => name,
            other => return Err(self.type_mismatch("keyword", &other)),
        };
        let size = self.readint()?;
        let ty = *self
            .types
            .and_then(|types| types.get_by_bytes(name.as_bytes()))
            .ok_or_else(|| MarshalError::UnregisteredAbstractType(name.to_string_lossy()))?;

        // The cell exists, and is referenceable, before its payload
        let cell = self.heap.alloc_abstract(ty.name, size, Box::new(()));
        let out = Value::Abstract(cell);
        self.lookup[slot] = out.clone();

        let data = (ty.unmarshal)(&mut UnmarshalContext { st: self, flags }, size)?;
        self.heap.abstract_cell_mut(cell).data = data;
        Ok(out)
    }
}

/// Streaming access handed to abstract-type unmarshal hooks
pub struct UnmarshalContext<'a, 'b> {
    st: &'a mut UnmarshalState<'b>,
    flags: i32,
}

impl UnmarshalContext<'_, '_> {
    pub fn heap(&self) -> &Heap {
        self.st.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        self.st.heap
    }

    pub fn read_byte(&mut self) -> Result<u8, MarshalError> {
        let b = self.st.peek()?;
        self.st.pos += 1;
        Ok(b)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, MarshalError> {
        Ok(self.st.readbytes(len)?.to_vec())
    }

    pub fn read_int(&mut self) -> Result<i32, MarshalError> {
        self.st.readint()
    }

    pub fn read_value(&mut self) -> Result<Value, MarshalError> {
        self.st.unmarshal_one(self.flags + 1)
    }
}

/// Decode one value starting at offset 0 of `bytes`.
///
/// Returns the value and the cursor past its last byte, so several
/// values can be decoded from one buffer in sequence. `reg` is an
/// optional forward registry (symbol to value) for resolving named
/// records; without one they decode to nil.
pub fn unmarshal(
    heap: &mut Heap,
    bytes: &[u8],
    reg: Option<TableRef>,
) -> Result<(Value, usize), MarshalError> {
    unmarshal_with(heap, bytes, reg, None)
}

/// [`unmarshal`] with abstract-type hooks supplied
pub fn unmarshal_with(
    heap: &mut Heap,
    bytes: &[u8],
    reg: Option<TableRef>,
    types: Option<&AbstractRegistry>,
) -> Result<(Value, usize), MarshalError> {
    let mut st = UnmarshalState {
        heap,
        data: bytes,
        pos: 0,
        lookup: Vec::new(),
        lookup_defs: Vec::new(),
        lookup_envs: Vec::new(),
        reg,
        types,
    };
    let out = st.unmarshal_one(0)?;
    let next = st.pos;
    debug!(kind = out.type_name(), bytes = next, "unmarshaled value");
    Ok((out, next))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_seeds() {
        let mut heap = Heap::new();
        assert_eq!(unmarshal(&mut heap, &[201], None).unwrap().0, Value::Nil);
        assert_eq!(
            unmarshal(&mut heap, &[202], None).unwrap().0,
            Value::Bool(false)
        );
        assert_eq!(
            unmarshal(&mut heap, &[203], None).unwrap().0,
            Value::Bool(true)
        );
    }

    #[test]
    fn test_integer_seeds() {
        let mut heap = Heap::new();
        let dec = |heap: &mut Heap, bytes: &[u8]| unmarshal(heap, bytes, None).unwrap().0;
        assert_eq!(dec(&mut heap, &[0x00]), Value::Number(0.0));
        assert_eq!(dec(&mut heap, &[0x7F]), Value::Number(127.0));
        assert_eq!(dec(&mut heap, &[0x80, 0x80]), Value::Number(128.0));
        assert_eq!(dec(&mut heap, &[0xBF, 0xFF]), Value::Number(-1.0));
        assert_eq!(
            dec(&mut heap, &[205, 0x00, 0x0F, 0x42, 0x40]),
            Value::Number(1_000_000.0)
        );
    }

    #[test]
    fn test_string_seed() {
        let mut heap = Heap::new();
        let (v, next) = unmarshal(&mut heap, &[206, 2, b'h', b'i'], None).unwrap();
        assert_eq!(v, Value::string("hi"));
        assert_eq!(next, 4);
    }

    #[test]
    fn test_empty_input() {
        let mut heap = Heap::new();
        let err = unmarshal(&mut heap, &[], None).unwrap_err();
        assert!(matches!(err, MarshalError::UnexpectedEnd(0)));
    }

    #[test]
    fn test_truncated_varint() {
        let mut heap = Heap::new();
        let err = unmarshal(&mut heap, &[0x80], None).unwrap_err();
        assert!(matches!(err, MarshalError::UnexpectedEnd(_)));
    }

    #[test]
    fn test_expected_integer() {
        let mut heap = Heap::new();
        let err = unmarshal(&mut heap, &[0xC0], None).unwrap_err();
        assert!(matches!(err, MarshalError::ExpectedInteger { byte: 0xC0, .. }));
    }

    #[test]
    fn test_unknown_lead_byte() {
        let mut heap = Heap::new();
        let err = unmarshal(&mut heap, &[0xFF], None).unwrap_err();
        assert!(matches!(err, MarshalError::UnknownLeadByte { byte: 0xFF, .. }));
    }

    #[test]
    fn test_funcdef_ref_invalid_at_top_level() {
        let mut heap = Heap::new();
        let err = unmarshal(&mut heap, &[220, 0], None).unwrap_err();
        assert!(matches!(err, MarshalError::UnknownLeadByte { byte: 220, .. }));
    }

    #[test]
    fn test_invalid_reference() {
        let mut heap = Heap::new();
        let err = unmarshal(&mut heap, &[218, 0], None).unwrap_err();
        assert!(matches!(err, MarshalError::InvalidReference(0)));
    }

    #[test]
    fn test_negative_count_rejected() {
        let mut heap = Heap::new();
        // Array with count -1 (2-byte varint 0xBF 0xFF)
        let err = unmarshal(&mut heap, &[209, 0xBF, 0xFF], None).unwrap_err();
        assert!(matches!(err, MarshalError::InvalidLength(-1)));
    }

    #[test]
    fn test_hostile_count_rejected_before_allocation() {
        let mut heap = Heap::new();
        // Array claiming 2^31 - 1 elements with no bytes behind it
        let err = unmarshal(&mut heap, &[209, 205, 0x7F, 0xFF, 0xFF, 0xFF], None).unwrap_err();
        assert!(matches!(err, MarshalError::UnexpectedEnd(_)));
    }

    #[test]
    fn test_truncated_string_body() {
        let mut heap = Heap::new();
        let err = unmarshal(&mut heap, &[206, 5, b'h', b'i'], None).unwrap_err();
        assert!(matches!(err, MarshalError::UnexpectedEnd(_)));
    }

    #[test]
    fn test_invalid_funcdef_reference() {
        let mut heap = Heap::new();
        // Function whose def is a reference into an empty lookup
        let err = unmarshal(&mut heap, &[215, 220, 0], None).unwrap_err();
        assert!(matches!(err, MarshalError::InvalidFuncDefReference(0)));
    }

    #[test]
    fn test_invalid_funcenv_reference() {
        let mut heap = Heap::new();
        // Minimal def with one environment, then an env reference into
        // an empty lookup: flags HASENVS, zero slots and arity, no
        // constants, one bytecode word, one env index
        let bytes = [
            215, 16, 0, 0, 0, 1, 1, 0x84, 0, 0, 0, 0, 219, 0,
        ];
        let err = unmarshal(&mut heap, &bytes, None).unwrap_err();
        assert!(matches!(err, MarshalError::InvalidFuncEnvReference(0)));
    }

    #[test]
    fn test_table_prototype_must_be_table() {
        let mut heap = Heap::new();
        let err = unmarshal(&mut heap, &[212, 0, 201], None).unwrap_err();
        assert!(matches!(
            err,
            MarshalError::TypeMismatch {
                expected: "table",
                got: "nil",
                ..
            }
        ));
    }

    #[test]
    fn test_registry_without_table_decodes_nil() {
        let mut heap = Heap::new();
        let (v, _) = unmarshal(&mut heap, &[216, 1, b'x'], None).unwrap();
        assert_eq!(v, Value::Nil);
    }
}
