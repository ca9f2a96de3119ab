//! Host-backed primitives exposed to contract code, and the storage
//! facade metamethods.
//!
//! Every primitive that needs to know "who is calling" reads the top of
//! the contract-identity stack; static-call contexts refuse writes,
//! events and transfers before the host is ever consulted.

use crate::engine::Engine;
use crate::kernel::actor::CallType;
use crate::transaction::receipt::ContractEvent;
use crate::types::*;
use crate::value::{FunctionObject, NativeCall, NativeFn, NativeReturn};

pub fn install(engine: &mut Engine) {
    for (name, func) in [
        ("caller_address", nat_caller_address as NativeFn),
        ("get_contract_id", nat_get_contract_id),
        ("get_chain_now", nat_get_chain_now),
        ("get_header_block_num", nat_get_header_block_num),
        ("get_transaction_id", nat_get_transaction_id),
        ("get_chain_random", nat_get_chain_random),
        ("get_system_asset_symbol", nat_get_system_asset_symbol),
        ("is_valid_address", nat_is_valid_address),
        ("get_contract_balance_amount", nat_get_contract_balance_amount),
        ("transfer_from_contract_to_address", nat_transfer_from_contract),
        ("emit", nat_emit),
        ("import_contract", nat_import_contract),
        ("static_call", nat_static_call),
        ("delegate_call", nat_delegate_call),
    ] {
        let f = engine
            .heap
            .new_function(FunctionObject::native(name, func, vec![]));
        engine.set_global(name, Value::Function(f));
    }

    // the shared storage facade metatable
    for (event, func) in [
        ("__index", nat_storage_index as NativeFn),
        ("__newindex", nat_storage_newindex),
    ] {
        let f = engine
            .heap
            .new_function(FunctionObject::native(event, func, vec![]));
        let key = TableKey::String(engine.heap.new_string(event));
        let storage_mt = engine.storage_mt;
        engine
            .heap
            .table_mut(storage_mt)
            .raw_set_unchecked(key, Value::Function(f));
    }

    // reserved globals contracts may read
    engine.set_global("contract_mt", Value::Table(engine.contract_mt));
    engine.set_global("storage_mt", Value::Table(engine.storage_mt));
    engine.set_global("last_return", Value::Nil);
}

fn values(values: Vec<Value>) -> Result<NativeReturn, EngineError> {
    Ok(NativeReturn::Values(values))
}

fn string_arg(
    engine: &Engine,
    call: &NativeCall,
    func: &'static str,
    index: usize,
) -> Result<String, EngineError> {
    engine
        .value_to_rust_string(call.arg(index))
        .ok_or_else(|| {
            RuntimeErrorKind::BadArgument {
                func,
                index: index + 1,
                expected: "string",
                found: call.arg(index).type_name(),
            }
            .into()
        })
}

// ----- identity and chain facts -----

fn nat_caller_address(engine: &mut Engine, _call: NativeCall) -> Result<NativeReturn, EngineError> {
    let caller = engine.host().caller_address();
    values(vec![engine.new_string_value(&caller)])
}

fn nat_get_contract_id(engine: &mut Engine, _call: NativeCall) -> Result<NativeReturn, EngineError> {
    match engine.current_contract() {
        Some(entry) => {
            let id = entry.contract_id.as_str().to_owned();
            values(vec![engine.new_string_value(&id)])
        }
        None => values(vec![Value::Nil]),
    }
}

fn nat_get_chain_now(engine: &mut Engine, _call: NativeCall) -> Result<NativeReturn, EngineError> {
    values(vec![Value::Integer(engine.host().now() as i64)])
}

fn nat_get_header_block_num(
    engine: &mut Engine,
    _call: NativeCall,
) -> Result<NativeReturn, EngineError> {
    values(vec![Value::Integer(engine.host().current_block_number() as i64)])
}

fn nat_get_transaction_id(
    engine: &mut Engine,
    _call: NativeCall,
) -> Result<NativeReturn, EngineError> {
    let id = engine.host().tx_id();
    values(vec![engine.new_string_value(&id)])
}

fn nat_get_chain_random(
    engine: &mut Engine,
    _call: NativeCall,
) -> Result<NativeReturn, EngineError> {
    values(vec![Value::Integer(engine.host().random() as i64)])
}

fn nat_get_system_asset_symbol(
    engine: &mut Engine,
    _call: NativeCall,
) -> Result<NativeReturn, EngineError> {
    let symbol = engine.host().system_asset_symbol();
    values(vec![engine.new_string_value(&symbol)])
}

fn nat_is_valid_address(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let candidate = engine.value_to_rust_string(call.arg(0)).unwrap_or_default();
    values(vec![Value::Bool(engine.host().is_valid_address(&candidate))])
}

// ----- balances, transfers, events -----

fn nat_get_contract_balance_amount(
    engine: &mut Engine,
    call: NativeCall,
) -> Result<NativeReturn, EngineError> {
    let address = string_arg(engine, &call, "get_contract_balance_amount", 0)?;
    let address = ContractAddress::new(address)
        .map_err(|_| HostError::new(400, "invalid contract address"))?;
    let symbol = string_arg(engine, &call, "get_contract_balance_amount", 1)?;
    engine.limits.check_stop()?;
    let balance = engine.host().get_balance(&address, &symbol)?;
    values(vec![Value::Integer(balance)])
}

fn nat_transfer_from_contract(
    engine: &mut Engine,
    call: NativeCall,
) -> Result<NativeReturn, EngineError> {
    engine.assert_transfers_allowed()?;
    let from = engine.current_storage_contract()?;
    let to = string_arg(engine, &call, "transfer_from_contract_to_address", 0)?;
    let symbol = string_arg(engine, &call, "transfer_from_contract_to_address", 1)?;
    let amount = match call.arg(2) {
        Value::Integer(i) => i,
        other => {
            return Err(RuntimeErrorKind::BadArgument {
                func: "transfer_from_contract_to_address",
                index: 3,
                expected: "integer",
                found: other.type_name(),
            }
            .into())
        }
    };
    engine.limits.check_stop()?;
    match engine.host().transfer(&from, &to, &symbol, amount) {
        Ok(()) => values(vec![Value::Integer(0)]),
        Err(error) => values(vec![Value::Integer(error.code)]),
    }
}

fn nat_emit(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    engine.assert_events_allowed()?;
    let contract_id = engine
        .current_contract()
        .map(|entry| entry.contract_id.clone())
        .ok_or(EngineError::Policy(PolicyError::StorageAccessOutsideContract))?;
    let name = string_arg(engine, &call, "emit", 0)?;
    let arg = string_arg(engine, &call, "emit", 1)?;
    engine.events.push(ContractEvent {
        contract_id,
        name,
        arg,
    });
    values(vec![])
}

// ----- cross-contract calls -----

fn nat_import_contract(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let name = string_arg(engine, &call, "import_contract", 0)?;
    engine.limits.check_stop()?;
    let loaded = crate::registry::load_contract(engine, &name)?;
    values(vec![Value::Table(loaded.table)])
}

fn nat_static_call(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    cross_contract_call(engine, call, CallType::StaticCall, "static_call")
}

fn nat_delegate_call(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    cross_contract_call(engine, call, CallType::DelegateCall, "delegate_call")
}

/// `static_call(contract, api, ...)` / `delegate_call(contract, api, ...)`:
/// arms the one-shot pending call type and invokes the target's proxy.
fn cross_contract_call(
    engine: &mut Engine,
    call: NativeCall,
    call_type: CallType,
    func: &'static str,
) -> Result<NativeReturn, EngineError> {
    let mut args = call.args;
    if args.is_empty() {
        return Err(RuntimeErrorKind::BadArgument {
            func,
            index: 1,
            expected: "contract table or name",
            found: "nil",
        }
        .into());
    }
    let target = args.remove(0);
    let contract_table = match target {
        Value::Table(r) => Value::Table(r),
        Value::String(_) => {
            let name = engine
                .value_to_rust_string(target)
                .expect("string value has content");
            let loaded = crate::registry::load_contract(engine, &name)?;
            Value::Table(loaded.table)
        }
        other => {
            return Err(RuntimeErrorKind::BadArgument {
                func,
                index: 1,
                expected: "contract table or name",
                found: other.type_name(),
            }
            .into())
        }
    };
    if args.is_empty() {
        return Err(RuntimeErrorKind::BadArgument {
            func,
            index: 2,
            expected: "api name",
            found: "nil",
        }
        .into());
    }
    let api_name = args.remove(0);
    let api = engine.table_get(contract_table, api_name)?;
    if api.is_nil() {
        let name = engine
            .value_to_rust_string(api_name)
            .unwrap_or_else(|| "?".to_owned());
        return Err(RuntimeErrorKind::ApiNotFound { api: name }.into());
    }

    let mut call_args = vec![contract_table];
    call_args.extend(args);

    engine.pending_call_type = Some(call_type);
    let result = engine.call_value(api, call_args);
    // the flag is one-shot; clear it if the call failed before any proxy
    // could consume it
    engine.pending_call_type = None;
    result.map(NativeReturn::Values)
}

// ----- the storage facade -----

fn nat_storage_index(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let slot = match engine.value_to_rust_string(call.arg(1)) {
        Some(slot) => slot,
        None => return values(vec![Value::Nil]),
    };
    let contract = engine.current_storage_contract()?;
    engine.limits.check_stop()?;
    let stored = engine
        .track
        .effective_read(engine.host, &contract, &slot)
        .map_err(EngineError::Storage)?;
    let value = engine.storage_to_value(&stored).map_err(EngineError::Storage)?;
    values(vec![value])
}

fn nat_storage_newindex(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    engine.assert_storage_writable()?;
    let slot = string_arg(engine, &call, "storage", 1)?;
    let contract = engine.current_storage_contract()?;
    let stored = engine
        .value_to_storage(call.arg(2))
        .map_err(EngineError::Storage)?;
    engine.limits.check_stop()?;
    engine
        .track
        .write(engine.host, &contract, &slot, stored)
        .map_err(EngineError::Storage)?;
    values(vec![])
}
