pub mod executor;
pub mod receipt;

pub use executor::TransactionExecutor;
pub use receipt::{ContractEvent, ContractInvokeReceipt};
