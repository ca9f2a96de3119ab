pub mod closure;
pub mod heap;
pub mod string;
pub mod table;
pub mod value;

pub use closure::{
    FunctionKind, FunctionObject, LuaClosure, NativeCall, NativeClosure, NativeFn, NativeReturn,
    Upvalue, UserdataObject,
};
pub use heap::{GcRoots, Heap};
pub use string::StringObject;
pub use table::TableObject;
pub use value::{FunctionRef, StringRef, TableKey, TableRef, ThreadRef, UpvalueRef, UserdataRef, Value};
