//! Metatable resolution: operator overloads, `__index`/`__newindex`
//! chains and `__call`.

use crate::engine::Engine;
use crate::types::*;

/// Longest `__index`/`__newindex` chain walked before assuming a loop.
pub const MAX_META_CHAIN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metamethod {
    Index,
    NewIndex,
    Call,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Len,
    Concat,
    Eq,
    Lt,
    Le,
}

impl Metamethod {
    pub fn name(&self) -> &'static str {
        match self {
            Metamethod::Index => "__index",
            Metamethod::NewIndex => "__newindex",
            Metamethod::Call => "__call",
            Metamethod::Add => "__add",
            Metamethod::Sub => "__sub",
            Metamethod::Mul => "__mul",
            Metamethod::Mod => "__mod",
            Metamethod::Pow => "__pow",
            Metamethod::Div => "__div",
            Metamethod::IDiv => "__idiv",
            Metamethod::BAnd => "__band",
            Metamethod::BOr => "__bor",
            Metamethod::BXor => "__bxor",
            Metamethod::Shl => "__shl",
            Metamethod::Shr => "__shr",
            Metamethod::Unm => "__unm",
            Metamethod::BNot => "__bnot",
            Metamethod::Len => "__len",
            Metamethod::Concat => "__concat",
            Metamethod::Eq => "__eq",
            Metamethod::Lt => "__lt",
            Metamethod::Le => "__le",
        }
    }
}

impl<'h> Engine<'h> {
    /// The metatable governing a value: per-object for tables and full
    /// userdata, per-type for everything else.
    pub fn metatable_of(&self, value: Value) -> Option<TableRef> {
        match value {
            Value::Table(r) => self.heap.table(r).metatable(),
            Value::Userdata(r) => self.heap.userdata(r).metatable,
            other => self.type_metatable(other.type_tag()),
        }
    }

    /// Resolves a metamethod; `None` when the value has no metatable or
    /// the metatable lacks the field.
    pub fn metamethod(&mut self, value: Value, event: Metamethod) -> Option<Value> {
        let metatable = self.metatable_of(value)?;
        let name = self.heap.new_string(event.name());
        let handler = self
            .heap
            .table(metatable)
            .raw_get(&TableKey::String(name));
        if handler.is_nil() {
            None
        } else {
            Some(handler)
        }
    }

    /// `t[k]` with the full `__index` chain.
    pub fn table_get(&mut self, table: Value, key: Value) -> Result<Value, EngineError> {
        let mut current = table;
        for _ in 0..MAX_META_CHAIN {
            if let Value::Table(r) = current {
                let raw = match TableKey::from_value(key) {
                    Ok(k) => self.heap.table(r).raw_get(&k),
                    Err(_) => Value::Nil,
                };
                if !raw.is_nil() {
                    return Ok(raw);
                }
                match self.metamethod(current, Metamethod::Index) {
                    None => return Ok(Value::Nil),
                    Some(handler) if matches!(handler, Value::Function(_)) => {
                        let results = self.call_value(handler, vec![current, key])?;
                        return Ok(results.first().copied().unwrap_or(Value::Nil));
                    }
                    Some(next) => current = next,
                }
            } else {
                match self.metamethod(current, Metamethod::Index) {
                    None => {
                        return Err(RuntimeErrorKind::IndexNonTable {
                            type_name: current.type_name(),
                        }
                        .into())
                    }
                    Some(handler) if matches!(handler, Value::Function(_)) => {
                        let results = self.call_value(handler, vec![current, key])?;
                        return Ok(results.first().copied().unwrap_or(Value::Nil));
                    }
                    Some(next) => current = next,
                }
            }
        }
        Err(RuntimeErrorKind::MetamethodChainTooLong { event: "__index" }.into())
    }

    /// `t[k] = v` with the full `__newindex` chain. `__newindex` fires
    /// only when the raw slot is absent; a populated slot on a read-only
    /// table raises regardless of any metatable.
    pub fn table_set(&mut self, table: Value, key: Value, value: Value) -> Result<(), EngineError> {
        let mut current = table;
        for _ in 0..MAX_META_CHAIN {
            if let Value::Table(r) = current {
                let k = TableKey::from_value(key).map_err(EngineError::from)?;
                let raw = self.heap.table(r).raw_get(&k);
                if !raw.is_nil() {
                    self.heap
                        .table_mut(r)
                        .raw_set(k, value)
                        .map_err(EngineError::Policy)?;
                    return Ok(());
                }
                match self.metamethod(current, Metamethod::NewIndex) {
                    None => {
                        self.heap
                            .table_mut(r)
                            .raw_set(k, value)
                            .map_err(EngineError::Policy)?;
                        return Ok(());
                    }
                    Some(handler) if matches!(handler, Value::Function(_)) => {
                        self.call_value(handler, vec![current, key, value])?;
                        return Ok(());
                    }
                    Some(next) => current = next,
                }
            } else {
                match self.metamethod(current, Metamethod::NewIndex) {
                    None => {
                        return Err(RuntimeErrorKind::IndexNonTable {
                            type_name: current.type_name(),
                        }
                        .into())
                    }
                    Some(handler) if matches!(handler, Value::Function(_)) => {
                        self.call_value(handler, vec![current, key, value])?;
                        return Ok(());
                    }
                    Some(next) => current = next,
                }
            }
        }
        Err(RuntimeErrorKind::MetamethodChainTooLong { event: "__newindex" }.into())
    }
}
