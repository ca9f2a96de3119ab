//! The call-proxy trampoline.
//!
//! Every function the registry places into a contract table is wrapped in
//! a native closure capturing `(wrapped fn, contract id, api name)`. The
//! trampoline pushes a [`ContractStackEntry`], forwards the call, and pops
//! the entry on return and on unwind alike, so the identity stack always
//! mirrors the nesting of live API invocations.

use crate::engine::Engine;
use crate::kernel::actor::{CallType, ContractStackEntry};
use crate::le_debug;
use crate::types::*;
use crate::value::{FunctionObject, FunctionRef, NativeCall, NativeReturn};
use indexmap::IndexSet;
use lazy_static::lazy_static;

lazy_static! {
    /// APIs reachable only on the transaction's entry contract.
    pub static ref SPECIAL_APIS: IndexSet<&'static str> = {
        let mut set = IndexSet::new();
        set.insert("init");
        set.insert("on_deposit");
        set.insert("on_upgrade");
        set.insert("on_destroy");
        set
    };
}

pub fn is_special_api(name: &str) -> bool {
    SPECIAL_APIS.contains(name)
}

/// Wraps `inner` in the trampoline for `contract_id::api_name`.
pub fn make_proxy(
    engine: &mut Engine,
    inner: Value,
    contract_id: &ContractAddress,
    api_name: &str,
) -> FunctionRef {
    let id_value = engine.new_string_value(contract_id.as_str());
    let api_value = engine.new_string_value(api_name);
    engine.heap.new_function(FunctionObject::native(
        "contract_api_proxy",
        nat_contract_proxy,
        vec![inner, id_value, api_value],
    ))
}

fn nat_contract_proxy(
    engine: &mut Engine,
    call: NativeCall,
) -> Result<NativeReturn, EngineError> {
    let inner = call.captures[0];
    let contract_id = ContractAddress::new(
        engine
            .value_to_rust_string(call.captures[1])
            .expect("proxy capture must be a string"),
    )
    .expect("proxy capture must be a valid address");
    let api_name = engine
        .value_to_rust_string(call.captures[2])
        .expect("proxy capture must be a string");

    // the pending call type is strictly one-shot: only this consumption
    // point exists
    let call_type = engine.pending_call_type.take().unwrap_or(CallType::Call);
    let storage_contract_id = match call_type {
        CallType::DelegateCall => engine
            .current_contract()
            .map(|entry| entry.storage_contract_id.clone())
            .unwrap_or_else(|| contract_id.clone()),
        CallType::Call | CallType::StaticCall => contract_id.clone(),
    };

    engine.contract_stack.push(ContractStackEntry {
        contract_id: contract_id.clone(),
        storage_contract_id,
        api_name: api_name.clone(),
        call_type,
    });
    le_debug!(
        engine,
        "enter {}::{} [{}] depth={}",
        contract_id,
        api_name,
        call_type.as_str(),
        engine.contract_stack_depth()
    );

    let result = engine.call_value(inner, call.args);

    engine.contract_stack.pop();
    le_debug!(
        engine,
        "exit {}::{} ok={}",
        contract_id,
        api_name,
        result.is_ok()
    );
    result.map(NativeReturn::Values)
}

impl<'h> Engine<'h> {
    /// The contract whose storage the current code targets. Reads and
    /// writes outside any proxied API have no storage context.
    pub(crate) fn current_storage_contract(&self) -> Result<ContractAddress, EngineError> {
        self.contract_stack
            .last()
            .map(|entry| entry.storage_contract_id.clone())
            .ok_or(EngineError::Policy(PolicyError::StorageAccessOutsideContract))
    }

    pub(crate) fn assert_storage_writable(&self) -> Result<(), EngineError> {
        if self.in_static_context() {
            return Err(PolicyError::StorageWriteInStaticCall.into());
        }
        Ok(())
    }

    pub(crate) fn assert_events_allowed(&self) -> Result<(), EngineError> {
        if self.in_static_context() {
            return Err(PolicyError::EventInStaticCall.into());
        }
        Ok(())
    }

    pub(crate) fn assert_transfers_allowed(&self) -> Result<(), EngineError> {
        if self.in_static_context() {
            return Err(PolicyError::TransferInStaticCall.into());
        }
        Ok(())
    }
}
