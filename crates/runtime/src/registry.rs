//! Named-value registry helpers
//!
//! The registry lets a host pre-share well-known values instead of
//! serializing them: the writer consults a reverse registry (value to
//! symbol) and emits the name; the reader resolves the name through a
//! forward registry (symbol to value). Both registries are ordinary
//! runtime tables.
//!
//! Hosts usually build the forward registry from a language environment
//! table, whose entries are per-symbol tables or structs carrying
//! `:value` and `:ref` slots. [`env_lookup`] flattens such an
//! environment, prototype chain included, into a plain symbol-to-value
//! table; [`invert`] swaps it into the reverse direction for marshaling.

use tern_core::heap::{Heap, TableData, TableRef};
use tern_core::value::Value;

/// Flatten an environment table into symbol -> value-or-ref.
///
/// Walks the table and its prototype chain; only symbol keys are kept.
/// Each entry contributes its `:value` slot, or its `:ref` slot when the
/// value slot is empty, or nil for entries that are neither tables nor
/// structs. Entries found later in the prototype chain overwrite earlier
/// ones.
pub fn env_lookup(heap: &mut Heap, env: TableRef) -> TableRef {
    let mut result = TableData::new();
    let mut current = Some(env);
    while let Some(table) = current {
        let pairs: Vec<(Value, Value)> = heap
            .table(table)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, entry) in pairs {
            if matches!(key, Value::Symbol(_)) {
                result.put(key, entry_getval(heap, &entry));
            }
        }
        current = heap.table(table).proto();
    }
    heap.alloc_table(result)
}

/// Look inside one environment entry
fn entry_getval(heap: &Heap, entry: &Value) -> Value {
    let value_key = Value::keyword("value");
    let ref_key = Value::keyword("ref");
    match entry {
        Value::Table(t) => {
            let table = heap.table(*t);
            match table.get(&value_key) {
                Some(v) => v.clone(),
                None => table.get(&ref_key).cloned().unwrap_or(Value::Nil),
            }
        }
        Value::Struct(s) => match s.get(&value_key) {
            Some(v) if !v.is_nil() => v.clone(),
            _ => s.get(&ref_key).cloned().unwrap_or(Value::Nil),
        },
        _ => Value::Nil,
    }
}

/// Swap keys and values, producing the reverse of a forward registry.
///
/// Nil values drop out, and duplicate values keep whichever key the
/// iteration sees last.
pub fn invert(heap: &mut Heap, table: TableRef) -> TableRef {
    let pairs: Vec<(Value, Value)> = heap
        .table(table)
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut result = TableData::new();
    for (key, value) in pairs {
        result.put(value, key);
    }
    heap.alloc_table(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::value::Struct;

    fn entry_table(heap: &mut Heap, slot: &str, value: Value) -> Value {
        let mut entry = TableData::new();
        entry.put(Value::keyword(slot), value);
        Value::Table(heap.alloc_table(entry))
    }

    #[test]
    fn test_env_lookup_prefers_value_slot() {
        let mut heap = Heap::new();
        let entry = entry_table(&mut heap, "value", Value::Number(42.0));
        let mut env = TableData::new();
        env.put(Value::symbol("answer"), entry);
        let env = heap.alloc_table(env);

        let flat = env_lookup(&mut heap, env);
        assert_eq!(
            heap.table(flat).get(&Value::symbol("answer")),
            Some(&Value::Number(42.0))
        );
    }

    #[test]
    fn test_env_lookup_falls_back_to_ref_slot() {
        let mut heap = Heap::new();
        let buffer = heap.alloc_buffer(vec![1, 2, 3]);
        let entry = entry_table(&mut heap, "ref", Value::Buffer(buffer));
        let mut env = TableData::new();
        env.put(Value::symbol("state"), entry);
        let env = heap.alloc_table(env);

        let flat = env_lookup(&mut heap, env);
        assert_eq!(
            heap.table(flat).get(&Value::symbol("state")),
            Some(&Value::Buffer(buffer))
        );
    }

    #[test]
    fn test_env_lookup_accepts_struct_entries() {
        let mut heap = Heap::new();
        let entry = Value::Struct(Struct::new(vec![(
            Value::keyword("value"),
            Value::string("bound"),
        )]));
        let mut env = TableData::new();
        env.put(Value::symbol("word"), entry);
        env.put(Value::symbol("junk"), Value::Number(3.0));
        env.put(Value::string("not-a-symbol"), Value::Number(4.0));
        let env = heap.alloc_table(env);

        let flat = env_lookup(&mut heap, env);
        let flat = heap.table(flat);
        assert_eq!(flat.get(&Value::symbol("word")), Some(&Value::string("bound")));
        // Non-entry values flatten to nil, which a table does not bind
        assert_eq!(flat.get(&Value::symbol("junk")), None);
        assert_eq!(flat.len(), 1);
    }

    #[test]
    fn test_env_lookup_walks_prototypes() {
        let mut heap = Heap::new();
        let parent_entry = entry_table(&mut heap, "value", Value::Number(1.0));
        let mut parent = TableData::new();
        parent.put(Value::symbol("inherited"), parent_entry);
        let parent = heap.alloc_table(parent);

        let child_entry = entry_table(&mut heap, "value", Value::Number(2.0));
        let mut child = TableData::new();
        child.put(Value::symbol("own"), child_entry);
        let child = heap.alloc_table(child);
        heap.table_mut(child).set_proto(Some(parent));

        let flat = env_lookup(&mut heap, child);
        let flat = heap.table(flat);
        assert_eq!(flat.get(&Value::symbol("own")), Some(&Value::Number(2.0)));
        assert_eq!(
            flat.get(&Value::symbol("inherited")),
            Some(&Value::Number(1.0))
        );
    }

    #[test]
    fn test_invert_swaps_pairs() {
        let mut heap = Heap::new();
        let buffer = heap.alloc_buffer(vec![9]);
        let mut forward = TableData::new();
        forward.put(Value::symbol("buf"), Value::Buffer(buffer));
        let forward = heap.alloc_table(forward);

        let reverse = invert(&mut heap, forward);
        assert_eq!(
            heap.table(reverse).get(&Value::Buffer(buffer)),
            Some(&Value::symbol("buf"))
        );
    }
}
