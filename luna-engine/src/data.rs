//! Conversion between engine values and the storage object format.
//!
//! Scalars map one-to-one. A table becomes an array exactly when its keys
//! are the contiguous sequence `1..=n`; any other table becomes a map with
//! its keys coerced to canonical text. Functions, threads and foreign
//! userdata do not serialise. Cycles and over-deep nesting are refused
//! before the encoder ever sees them.

use crate::engine::Engine;
use crate::types::*;

impl<'h> Engine<'h> {
    pub fn value_to_storage(&self, value: Value) -> Result<lbor::Value, StorageError> {
        let mut visited = Vec::new();
        self.value_to_storage_inner(value, 0, &mut visited)
    }

    fn value_to_storage_inner(
        &self,
        value: Value,
        depth: usize,
        visited: &mut Vec<TableRef>,
    ) -> Result<lbor::Value, StorageError> {
        if depth > self.options.storage_serialize_depth {
            return Err(StorageError::DepthLimitExceeded(
                self.options.storage_serialize_depth,
            ));
        }
        match value {
            Value::Nil => Ok(lbor::Value::Null),
            Value::Bool(b) => Ok(lbor::Value::Bool(b)),
            Value::Integer(i) => Ok(lbor::Value::Integer(i)),
            Value::Number(n) => Ok(lbor::Value::Decimal(n)),
            Value::String(r) => {
                let object = self.heap.string(r);
                match object.as_str() {
                    Some(text) => Ok(lbor::Value::String(text.to_owned())),
                    None => Ok(lbor::Value::Bytes(object.as_bytes().to_vec())),
                }
            }
            Value::Table(r) => {
                if visited.contains(&r) {
                    return Err(StorageError::CyclicValue);
                }
                visited.push(r);
                let result = self.table_to_storage(r, depth, visited);
                visited.pop();
                result
            }
            Value::Function(_) => Err(StorageError::UnencodableValue {
                type_name: "function",
            }),
            Value::Thread(_) => Err(StorageError::UnencodableValue {
                type_name: "thread",
            }),
            Value::Userdata(_) | Value::LightUserdata(_) => Err(StorageError::UnencodableValue {
                type_name: "userdata",
            }),
        }
    }

    fn table_to_storage(
        &self,
        table: TableRef,
        depth: usize,
        visited: &mut Vec<TableRef>,
    ) -> Result<lbor::Value, StorageError> {
        let object = self.heap.table(table);
        if object.is_sequence() {
            let mut elements = Vec::with_capacity(object.array_part().len());
            for value in object.array_part() {
                elements.push(self.value_to_storage_inner(*value, depth + 1, visited)?);
            }
            return Ok(lbor::Value::Array(elements));
        }
        let mut entries = Vec::new();
        // key texts must stay unique after coercion: `t[1]` and `t["1"]`
        // would otherwise collide into one canonical map key, which the
        // encoder refuses at commit time
        let mut seen: IndexSet<String> = index_set_new();
        for (index, value) in object.array_part().iter().enumerate() {
            if value.is_nil() {
                continue;
            }
            let text = (index as i64 + 1).to_string();
            seen.insert(text.clone());
            entries.push((
                text,
                self.value_to_storage_inner(*value, depth + 1, visited)?,
            ));
        }
        for (key, value) in object.hash_part() {
            let text = self.storage_key_text(key);
            if !seen.insert(text.clone()) {
                return Err(StorageError::DuplicateMapKey(text));
            }
            entries.push((text, self.value_to_storage_inner(*value, depth + 1, visited)?));
        }
        Ok(lbor::Value::map(entries))
    }

    /// Canonical textual form of a map key.
    fn storage_key_text(&self, key: &TableKey) -> String {
        match key {
            TableKey::String(r) => self.heap.string_lossy(*r),
            other => self.display_value(other.to_value()),
        }
    }

    pub fn storage_to_value(&mut self, value: &lbor::Value) -> Result<Value, StorageError> {
        match value {
            lbor::Value::Null => Ok(Value::Nil),
            lbor::Value::Bool(b) => Ok(Value::Bool(*b)),
            lbor::Value::Integer(i) => Ok(Value::Integer(*i)),
            lbor::Value::BigInteger(i) => match i64::try_from(*i) {
                Ok(i) => Ok(Value::Integer(i)),
                Err(_) => Err(StorageError::IntegerOutOfRange(*i)),
            },
            lbor::Value::Decimal(d) => Ok(Value::Number(*d)),
            lbor::Value::String(s) => Ok(self.new_string_value(s)),
            lbor::Value::Bytes(bytes) => Ok(self.new_bytes_value(bytes)),
            lbor::Value::Array(elements) => {
                let table = self.heap.new_table_with_capacity(elements.len(), 0);
                for (index, element) in elements.iter().enumerate() {
                    let converted = self.storage_to_value(element)?;
                    self.heap
                        .table_mut(table)
                        .raw_set_unchecked(TableKey::Integer(index as i64 + 1), converted);
                }
                Ok(Value::Table(table))
            }
            lbor::Value::Map(map_entries) => {
                let table = self.heap.new_table_with_capacity(0, map_entries.len());
                for (key, entry) in map_entries {
                    let converted = self.storage_to_value(entry)?;
                    let key = TableKey::String(self.heap.new_string(key));
                    self.heap.table_mut(table).raw_set_unchecked(key, converted);
                }
                Ok(Value::Table(table))
            }
        }
    }
}
