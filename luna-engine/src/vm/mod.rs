pub mod arith;
pub mod baselib;
pub mod dump;
pub mod frame;
pub mod interpreter;
pub mod loader;
pub mod metamethods;
pub mod opcode;
pub mod prototype;
pub mod verify;

pub use frame::{CallFrame, ExecState, FrameFlags, ThreadObject, ThreadStatus};
pub use interpreter::{HookEvent, RunOutcome};
pub use opcode::{Instruction, OpCode};
pub use prototype::{Constant, LocalVariable, Prototype, UpvalueDescriptor};
