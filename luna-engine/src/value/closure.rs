use crate::engine::Engine;
use crate::errors::EngineError;
use crate::value::value::{TableRef, UpvalueRef, Value};
use crate::vm::prototype::Prototype;
use std::sync::Arc;

/// A callable heap object: a bytecode closure or a native closure.
#[derive(Debug)]
pub struct FunctionObject {
    pub kind: FunctionKind,
}

#[derive(Debug)]
pub enum FunctionKind {
    Lua(LuaClosure),
    Native(NativeClosure),
}

impl FunctionObject {
    pub fn lua(proto: Arc<Prototype>, upvalues: Vec<UpvalueRef>) -> Self {
        Self {
            kind: FunctionKind::Lua(LuaClosure { proto, upvalues }),
        }
    }

    pub fn native(name: &'static str, func: NativeFn, captures: Vec<Value>) -> Self {
        Self {
            kind: FunctionKind::Native(NativeClosure {
                name,
                func,
                captures,
            }),
        }
    }

    pub fn as_lua(&self) -> Option<&LuaClosure> {
        match &self.kind {
            FunctionKind::Lua(c) => Some(c),
            FunctionKind::Native(_) => None,
        }
    }
}

/// A bytecode closure: shared immutable prototype plus shared upvalue cells.
#[derive(Debug, Clone)]
pub struct LuaClosure {
    pub proto: Arc<Prototype>,
    pub upvalues: Vec<UpvalueRef>,
}

/// A native closure. `captures` plays the role upvalues play for bytecode
/// closures; the call-proxy trampoline keeps the wrapped function and its
/// identity strings here.
pub struct NativeClosure {
    pub name: &'static str,
    pub func: NativeFn,
    pub captures: Vec<Value>,
}

impl std::fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NativeClosure")
            .field("name", &self.name)
            .field("captures", &self.captures)
            .finish()
    }
}

pub type NativeFn = fn(&mut Engine<'_>, NativeCall) -> Result<NativeReturn, EngineError>;

/// Everything a native sees about its invocation.
pub struct NativeCall {
    pub args: Vec<Value>,
    pub captures: Vec<Value>,
}

impl NativeCall {
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).copied().unwrap_or(Value::Nil)
    }
}

pub enum NativeReturn {
    Values(Vec<Value>),
    /// Only `coroutine.yield` produces this; the interpreter refuses to
    /// carry it across any other native frame.
    Yield(Vec<Value>),
}

/// A shared upvalue cell. Open cells point at a live stack slot of the
/// execution state identified by `exec_id`; closed cells own their value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upvalue {
    Open { exec_id: u64, index: usize },
    Closed(Value),
}

/// Full userdata: an opaque host object with an optional metatable.
#[derive(Debug)]
pub struct UserdataObject {
    pub type_name: &'static str,
    pub handle: u64,
    pub metatable: Option<TableRef>,
}
