use crate::log::Level;
use crate::track::StorageChangeSet;
use crate::types::*;

/// One event emitted during an invocation, in emit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractEvent {
    pub contract_id: ContractAddress,
    pub name: String,
    pub arg: String,
}

/// Everything a successful API invocation hands back for the host to
/// commit: the result value, the ordered events, the ordered storage
/// change set, plus the collected trace log.
#[derive(Debug, Clone)]
pub struct ContractInvokeReceipt {
    pub contract: ContractAddress,
    pub api_name: String,
    pub result: lbor::Value,
    pub events: Vec<ContractEvent>,
    pub storage_changes: StorageChangeSet,
    pub logs: Vec<(Level, String)>,
    pub instructions_executed: u64,
}

impl ContractInvokeReceipt {
    /// The result as the string form hosts show to users: strings verbatim,
    /// anything else in canonical display form.
    pub fn result_string(&self) -> String {
        match &self.result {
            lbor::Value::Null => String::new(),
            lbor::Value::String(s) => s.clone(),
            lbor::Value::Bool(b) => b.to_string(),
            lbor::Value::Integer(i) => i.to_string(),
            lbor::Value::BigInteger(i) => i.to_string(),
            lbor::Value::Decimal(d) => d.to_string(),
            other => format!("{:?}", other),
        }
    }
}
