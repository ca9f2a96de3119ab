use crate::value::{FunctionRef, UpvalueRef, Value};
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Frame executes bytecode (as opposed to a native).
        const LUA = 0b0001;
        /// Frame was reused by a tail call.
        const TAILCALL = 0b0010;
        /// Bottom frame of a `run` entry; returning from it leaves the
        /// interpreter loop.
        const ENTRY = 0b0100;
    }
}

/// One activation record of a bytecode function.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub func: FunctionRef,
    /// Stack index of the function value itself.
    pub func_index: usize,
    /// Stack index of register 0.
    pub base: usize,
    pub pc: usize,
    /// Results the caller wants; -1 means "all".
    pub expected_results: i32,
    pub flags: FrameFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Suspended,
    Running,
    /// Alive but currently resuming another coroutine.
    Normal,
    Dead,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
        }
    }
}

/// A stackful execution context: the value stack, the frame chain and the
/// open-upvalue list of one thread of execution. The main invocation owns
/// one; every coroutine owns another.
#[derive(Debug)]
pub struct ExecState {
    /// Stable identity; open upvalue cells name their home state by it.
    pub id: u64,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Open cells indexed by stack slot, kept sorted by slot.
    pub open_upvalues: Vec<(usize, UpvalueRef)>,
    /// Where resumed values land after a yield: the yielding call's result
    /// slot and its expected-result count.
    pub resume_target: Option<(usize, i32)>,
}

impl ExecState {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            resume_target: None,
        }
    }

    pub fn top(&self) -> usize {
        self.stack.len()
    }

    /// Grows the stack with nils up to `size` slots.
    pub fn ensure_size(&mut self, size: usize) {
        if self.stack.len() < size {
            self.stack.resize(size, Value::Nil);
        }
    }

    pub fn get(&self, index: usize) -> Value {
        self.stack.get(index).copied().unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, index: usize, value: Value) {
        self.ensure_size(index + 1);
        self.stack[index] = value;
    }

    pub fn truncate(&mut self, top: usize) {
        self.stack.truncate(top);
    }
}

/// A coroutine object. Suspended coroutines own their execution state;
/// while running, the engine holds the state and `exec` is `None`.
#[derive(Debug)]
pub struct ThreadObject {
    pub status: ThreadStatus,
    pub exec: Option<ExecState>,
    /// Stable id of this coroutine's execution state; used to tell the
    /// running coroutine apart from merely-resuming ones.
    pub exec_id: u64,
    /// Entry function, used on first resume.
    pub body: Option<FunctionRef>,
}

impl ThreadObject {
    pub fn new(body: FunctionRef, exec: ExecState) -> Self {
        Self {
            status: ThreadStatus::Suspended,
            exec_id: exec.id,
            exec: Some(exec),
            body: Some(body),
        }
    }
}
