pub mod actor;
pub mod proxy;

pub use actor::{CallType, ContractStackEntry};
