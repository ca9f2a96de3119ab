use crate::types::*;

/// How the current contract API was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Call,
    /// Read-only entry: storage writes, events and transfers are refused
    /// for as long as such a frame is on the stack.
    StaticCall,
    /// The callee runs against the caller's storage context.
    DelegateCall,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Call => "CALL",
            CallType::StaticCall => "STATIC_CALL",
            CallType::DelegateCall => "DELEGATE_CALL",
        }
    }
}

/// One level of the contract-identity stack. The stack mirrors the nesting
/// of proxied API invocations exactly: every proxy entry is matched by an
/// exit, on return and on unwind alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractStackEntry {
    pub contract_id: ContractAddress,
    /// Storage writes target this contract. Equal to `contract_id` except
    /// under a delegate call, where the caller's context is inherited.
    pub storage_contract_id: ContractAddress,
    pub api_name: String,
    pub call_type: CallType,
}
