//! Shared fixtures: the native token contract (the reference workload for
//! the end-to-end scenarios) and hand-assembled bytecode contracts.

use luna_engine::engine::Engine;
use luna_engine::errors::{EngineError, RuntimeErrorKind};
use luna_engine::host::{ContractMetadata, InMemoryHost};
use luna_engine::value::{NativeCall, NativeFn, NativeReturn, Value};
use luna_engine::vm::dump::dump_module;
use luna_engine::vm::opcode::{rk_constant as k, rk_register as r, Instruction as I, OpCode as Op};
use luna_engine::vm::prototype::{Constant, Prototype};
use luna_engine::TransactionExecutor;
use luna_common::prelude::ContractAddress;
use std::sync::Arc;

pub const TOKEN_STATE_NOT_INITED: &str = "NOT_INITED";
pub const TOKEN_STATE_COMMON: &str = "COMMON";

pub fn addr(s: &str) -> ContractAddress {
    ContractAddress::new(s).unwrap()
}

// ----- the token contract -----

fn contract_error(engine: &mut Engine, message: &str) -> EngineError {
    let payload = engine.new_string_value(message);
    RuntimeErrorKind::ScriptRaised(payload).into()
}

fn string_result(engine: &mut Engine, text: &str) -> Result<NativeReturn, EngineError> {
    Ok(NativeReturn::Values(vec![engine.new_string_value(text)]))
}

fn arg_string(engine: &Engine, call: &NativeCall) -> String {
    engine.value_to_rust_string(call.arg(1)).unwrap_or_default()
}

fn read_string_slot(engine: &mut Engine, slot: &str) -> Result<String, EngineError> {
    match engine.contract_storage_read(slot)? {
        lbor::Value::String(s) => Ok(s),
        other => Ok(format!("{:?}", other)),
    }
}

fn read_int_slot(engine: &mut Engine, slot: &str) -> Result<i64, EngineError> {
    Ok(engine
        .contract_storage_read(slot)?
        .as_integer()
        .unwrap_or(0))
}

fn read_map_slot(
    engine: &mut Engine,
    slot: &str,
) -> Result<Vec<(String, lbor::Value)>, EngineError> {
    match engine.contract_storage_read(slot)? {
        lbor::Value::Map(entries) => Ok(entries),
        _ => Ok(Vec::new()),
    }
}

fn map_get_int(entries: &[(String, lbor::Value)], key: &str) -> i64 {
    entries
        .iter()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.as_integer())
        .unwrap_or(0)
}

fn map_put(entries: &mut Vec<(String, lbor::Value)>, key: &str, value: lbor::Value) {
    match entries.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key.to_owned(), value)),
    }
}

fn map_remove(entries: &mut Vec<(String, lbor::Value)>, key: &str) {
    entries.retain(|(k, _)| k != key);
}

fn parse_positive_int(engine: &mut Engine, text: &str) -> Result<i64, EngineError> {
    let amount: i64 = text
        .trim()
        .parse()
        .map_err(|_| contract_error(engine, "argument format error, amount must be positive integer"))?;
    if amount <= 0 {
        return Err(contract_error(
            engine,
            "argument format error, amount must be positive integer",
        ));
    }
    Ok(amount)
}

fn require_common_state(engine: &mut Engine) -> Result<(), EngineError> {
    if read_string_slot(engine, "state")? != TOKEN_STATE_COMMON {
        return Err(contract_error(
            engine,
            "this token contract state doesn't allow this api",
        ));
    }
    Ok(())
}

fn token_init(engine: &mut Engine, _call: NativeCall) -> Result<NativeReturn, EngineError> {
    engine.contract_storage_write("name", lbor::Value::String(String::new()))?;
    engine.contract_storage_write("symbol", lbor::Value::String(String::new()))?;
    engine.contract_storage_write("supply", lbor::Value::Integer(0))?;
    engine.contract_storage_write("precision", lbor::Value::Integer(0))?;
    engine.contract_storage_write("users", lbor::Value::Map(vec![]))?;
    engine.contract_storage_write("allowed", lbor::Value::Map(vec![]))?;
    engine.contract_storage_write(
        "state",
        lbor::Value::String(TOKEN_STATE_NOT_INITED.to_owned()),
    )?;
    let caller = engine.host().caller_address();
    engine.contract_storage_write("admin", lbor::Value::String(caller))?;
    Ok(NativeReturn::Values(vec![]))
}

fn check_admin(engine: &mut Engine) -> Result<(), EngineError> {
    let caller = engine.host().caller_address();
    if read_string_slot(engine, "admin")? != caller {
        return Err(contract_error(engine, "only admin can call this api"));
    }
    Ok(())
}

// arg format: name,symbol,supply,precision
fn token_init_token(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    check_admin(engine)?;
    if read_string_slot(engine, "state")? != TOKEN_STATE_NOT_INITED {
        return Err(contract_error(engine, "this token contract inited before"));
    }
    let arg = arg_string(engine, &call);
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.len() < 4 {
        return Err(contract_error(
            engine,
            "argument format error, need format: name,symbol,supply,precision",
        ));
    }
    let name = parts[0].trim().to_owned();
    let symbol = parts[1].trim().to_owned();
    if name.is_empty() || symbol.is_empty() {
        return Err(contract_error(
            engine,
            "argument format error, need format: name,symbol,supply,precision",
        ));
    }
    let supply = parse_positive_int(engine, parts[2])?;
    let precision = parse_positive_int(engine, parts[3])?;
    const ALLOWED_PRECISIONS: [i64; 9] = [
        1, 10, 100, 1000, 10000, 100000, 1000000, 10000000, 100000000,
    ];
    if !ALLOWED_PRECISIONS.contains(&precision) {
        return Err(contract_error(
            engine,
            "argument format error, precision must be any one of [1,10,100,1000,10000,100000,1000000,10000000,100000000]",
        ));
    }

    engine.contract_storage_write(
        "state",
        lbor::Value::String(TOKEN_STATE_COMMON.to_owned()),
    )?;
    engine.contract_storage_write("precision", lbor::Value::Integer(precision))?;
    engine.contract_storage_write("supply", lbor::Value::Integer(supply))?;
    engine.contract_storage_write("name", lbor::Value::String(name))?;
    engine.contract_storage_write("symbol", lbor::Value::String(symbol))?;

    let caller = engine.host().caller_address();
    engine.contract_storage_write(
        "users",
        lbor::Value::map(vec![(caller, lbor::Value::Integer(supply))]),
    )?;
    engine.emit_contract_event("Inited", parts[2].trim())?;
    Ok(NativeReturn::Values(vec![]))
}

fn token_state(engine: &mut Engine, _call: NativeCall) -> Result<NativeReturn, EngineError> {
    let state = read_string_slot(engine, "state")?;
    string_result(engine, &state)
}

fn token_name(engine: &mut Engine, _call: NativeCall) -> Result<NativeReturn, EngineError> {
    let name = read_string_slot(engine, "name")?;
    string_result(engine, &name)
}

fn token_symbol(engine: &mut Engine, _call: NativeCall) -> Result<NativeReturn, EngineError> {
    let symbol = read_string_slot(engine, "symbol")?;
    string_result(engine, &symbol)
}

fn token_supply(engine: &mut Engine, _call: NativeCall) -> Result<NativeReturn, EngineError> {
    let supply = read_int_slot(engine, "supply")?;
    string_result(engine, &supply.to_string())
}

fn token_precision(engine: &mut Engine, _call: NativeCall) -> Result<NativeReturn, EngineError> {
    let precision = read_int_slot(engine, "precision")?;
    string_result(engine, &precision.to_string())
}

fn token_balance_of(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    require_common_state(engine)?;
    let owner = arg_string(engine, &call);
    let users = read_map_slot(engine, "users")?;
    let amount = map_get_int(&users, owner.trim());
    string_result(engine, &amount.to_string())
}

// arg format: toAddress,amount
fn token_transfer(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    require_common_state(engine)?;
    let arg = arg_string(engine, &call);
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.len() < 2 {
        return Err(contract_error(
            engine,
            "argument format error, need format: toAddress,amount(with precision, integer)",
        ));
    }
    let to_address = parts[0].trim().to_owned();
    let amount = parse_positive_int(engine, parts[1])?;

    let from_address = engine.host().caller_address();
    let mut users = read_map_slot(engine, "users")?;
    if map_get_int(&users, &from_address) < amount {
        return Err(contract_error(
            engine,
            "you have not enoungh amount to transfer out",
        ));
    }
    let from_remain = map_get_int(&users, &from_address) - amount;
    if from_remain > 0 {
        map_put(&mut users, &from_address, lbor::Value::Integer(from_remain));
    } else {
        map_remove(&mut users, &from_address);
    }
    let to_amount = map_get_int(&users, &to_address);
    map_put(&mut users, &to_address, lbor::Value::Integer(to_amount + amount));
    engine.contract_storage_write("users", lbor::Value::map(users))?;

    let event_arg = format!(
        "{{\"from\":\"{}\",\"to\":\"{}\",\"amount\":{}}}",
        from_address, to_address, amount
    );
    engine.emit_contract_event("Transfer", &event_arg)?;
    Ok(NativeReturn::Values(vec![]))
}

// arg format: spenderAddress,amount
fn token_approve(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    require_common_state(engine)?;
    let arg = arg_string(engine, &call);
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.len() < 2 {
        return Err(contract_error(
            engine,
            "argument format error, need format: spenderAddress, amount(with precision, integer)",
        ));
    }
    let spender = parts[0].trim().to_owned();
    let amount = parse_positive_int(engine, parts[1])?;

    let caller = engine.host().caller_address();
    let mut allowed = read_map_slot(engine, "allowed")?;
    let mut allowed_data = match allowed.iter().find(|(k, _)| *k == caller) {
        Some((_, lbor::Value::Map(entries))) => entries.clone(),
        _ => Vec::new(),
    };
    map_put(&mut allowed_data, &spender, lbor::Value::Integer(amount));
    map_put(&mut allowed, &caller, lbor::Value::map(allowed_data));
    engine.contract_storage_write("allowed", lbor::Value::map(allowed))?;

    let event_arg = format!(
        "{{\"from\":\"{}\",\"spender\":\"{}\",\"amount\":{}}}",
        caller, spender, amount
    );
    engine.emit_contract_event("Approved", &event_arg)?;
    Ok(NativeReturn::Values(vec![]))
}

// arg format: spenderAddress,authorizerAddress
fn token_approved_balance_from(
    engine: &mut Engine,
    call: NativeCall,
) -> Result<NativeReturn, EngineError> {
    require_common_state(engine)?;
    let arg = arg_string(engine, &call);
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.len() < 2 {
        return Err(contract_error(
            engine,
            "argument format error, need format: spenderAddress, authorizerAddress",
        ));
    }
    let spender = parts[0].trim();
    let authorizer = parts[1].trim();
    let allowed = read_map_slot(engine, "allowed")?;
    let amount = match allowed.iter().find(|(k, _)| k == authorizer) {
        Some((_, lbor::Value::Map(entries))) => map_get_int(entries, spender),
        _ => 0,
    };
    string_result(engine, &amount.to_string())
}

fn token_all_approved_from_user(
    engine: &mut Engine,
    call: NativeCall,
) -> Result<NativeReturn, EngineError> {
    require_common_state(engine)?;
    let from = arg_string(engine, &call);
    let allowed = read_map_slot(engine, "allowed")?;
    let entries = match allowed.iter().find(|(k, _)| *k == from.trim()) {
        Some((_, lbor::Value::Map(entries))) => entries.clone(),
        _ => Vec::new(),
    };
    let body: Vec<String> = entries
        .iter()
        .map(|(k, v)| format!("\"{}\":{}", k, v.as_integer().unwrap_or(0)))
        .collect();
    string_result(engine, &format!("{{{}}}", body.join(",")))
}

// arg format: fromAddress,toAddress,amount
fn token_transfer_from(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    require_common_state(engine)?;
    let arg = arg_string(engine, &call);
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.len() < 3 {
        return Err(contract_error(
            engine,
            "argument format error, need format:fromAddress, toAddress, amount(with precision, integer)",
        ));
    }
    let from_address = parts[0].trim().to_owned();
    let to_address = parts[1].trim().to_owned();
    let amount = parse_positive_int(engine, parts[2])?;

    let mut users = read_map_slot(engine, "users")?;
    let mut allowed = read_map_slot(engine, "allowed")?;
    if map_get_int(&users, &from_address) < amount {
        return Err(contract_error(
            engine,
            "fromAddress not have enough token to withdraw",
        ));
    }
    let mut allowed_data = match allowed.iter().find(|(k, _)| *k == from_address) {
        Some((_, lbor::Value::Map(entries))) => entries.clone(),
        _ => {
            return Err(contract_error(
                engine,
                "not enough approved amount to withdraw",
            ))
        }
    };
    let spender = engine.host().caller_address();
    let approved = map_get_int(&allowed_data, &spender);
    if approved < amount {
        return Err(contract_error(
            engine,
            "not enough approved amount to withdraw",
        ));
    }

    let from_remain = map_get_int(&users, &from_address) - amount;
    if from_remain > 0 {
        map_put(&mut users, &from_address, lbor::Value::Integer(from_remain));
    } else {
        map_remove(&mut users, &from_address);
    }
    let to_amount = map_get_int(&users, &to_address);
    map_put(&mut users, &to_address, lbor::Value::Integer(to_amount + amount));
    engine.contract_storage_write("users", lbor::Value::map(users))?;

    if approved - amount > 0 {
        map_put(&mut allowed_data, &spender, lbor::Value::Integer(approved - amount));
    } else {
        map_remove(&mut allowed_data, &spender);
    }
    map_put(&mut allowed, &from_address, lbor::Value::map(allowed_data));
    engine.contract_storage_write("allowed", lbor::Value::map(allowed))?;

    let event_arg = format!(
        "{{\"from\":\"{}\",\"to\":\"{}\",\"amount\":{}}}",
        from_address, to_address, amount
    );
    engine.emit_contract_event("Transfer", &event_arg)?;
    Ok(NativeReturn::Values(vec![]))
}

pub fn token_apis() -> Vec<(String, NativeFn)> {
    let apis: Vec<(&str, NativeFn)> = vec![
        ("init", token_init),
        ("init_token", token_init_token),
        ("transfer", token_transfer),
        ("transferFrom", token_transfer_from),
        ("balanceOf", token_balance_of),
        ("approve", token_approve),
        ("approvedBalanceFrom", token_approved_balance_from),
        ("allApprovedFromUser", token_all_approved_from_user),
        ("state", token_state),
        ("supply", token_supply),
        ("precision", token_precision),
        ("tokenName", token_name),
        ("tokenSymbol", token_symbol),
    ];
    apis.into_iter().map(|(n, f)| (n.to_owned(), f)).collect()
}

pub fn token_metadata() -> ContractMetadata {
    ContractMetadata {
        apis: token_apis().into_iter().map(|(n, _)| n).collect(),
        offline_apis: [
            "balanceOf",
            "approvedBalanceFrom",
            "allApprovedFromUser",
            "state",
            "supply",
            "precision",
            "tokenName",
            "tokenSymbol",
        ]
        .into_iter()
        .map(str::to_owned)
        .collect(),
        ..ContractMetadata::default()
    }
}

/// Deploys the token contract on the host and registers its native module
/// with the executor's engine.
pub fn deploy_token(
    executor: &mut TransactionExecutor,
    host: &InMemoryHost,
    name: &str,
    address: &ContractAddress,
) {
    host.deploy_contract(Some(name), address.clone(), Vec::new(), token_metadata());
    executor
        .engine()
        .register_native_contract(address.clone(), token_apis());
}

// ----- hand-assembled bytecode contracts -----

fn api_proto(
    code: Vec<luna_engine::vm::opcode::Instruction>,
    constants: Vec<Constant>,
    max_stack: u8,
) -> Arc<Prototype> {
    Arc::new(Prototype {
        source: "@contract".to_owned(),
        line_defined: 1,
        last_line_defined: 1,
        num_params: 2,
        is_vararg: false,
        max_stack_size: max_stack,
        code,
        constants,
        upvalues: vec![],
        protos: vec![],
        line_info: vec![],
        local_vars: vec![],
    })
}

/// Top-level chunk returning a table of the given API closures.
pub fn module_chunk(apis: Vec<(&str, Arc<Prototype>)>) -> Vec<u8> {
    let mut code = vec![I::abc(Op::NewTable, 0, 0, 0)];
    let mut constants = Vec::new();
    let mut protos = Vec::new();
    for (index, (name, proto)) in apis.into_iter().enumerate() {
        constants.push(Constant::String(name.as_bytes().to_vec()));
        protos.push(proto);
        code.push(I::abx(Op::Closure, 1, index as u32));
        code.push(I::abc(Op::SetTable, 0, k(index as u32), r(1)));
    }
    code.push(I::abc(Op::Return, 0, 2, 0));
    let chunk = Prototype {
        source: "@contract".to_owned(),
        line_defined: 0,
        last_line_defined: 0,
        num_params: 0,
        is_vararg: true,
        max_stack_size: 3,
        code,
        constants,
        upvalues: vec![],
        protos,
        line_info: vec![],
        local_vars: vec![],
    };
    dump_module(&chunk)
}

/// A contract whose `boom` API evaluates `i64::MAX + 1`.
pub fn overflow_contract_bytes() -> Vec<u8> {
    let boom = api_proto(
        vec![
            I::abx(Op::LoadK, 2, 0),
            I::abc(Op::Add, 3, r(2), k(1)),
            I::abc(Op::Return, 3, 2, 0),
        ],
        vec![Constant::Integer(i64::MAX), Constant::Integer(1)],
        5,
    );
    let ok = api_proto(
        vec![I::abx(Op::LoadK, 2, 0), I::abc(Op::Return, 2, 2, 0)],
        vec![Constant::String(b"fine".to_vec())],
        4,
    );
    module_chunk(vec![("boom", boom), ("ok", ok)])
}

/// A counter contract driving the storage facade from bytecode:
/// `init_counter` seeds `storage.count`, `incr` bumps and returns it,
/// `get` reads it.
pub fn counter_contract_bytes() -> Vec<u8> {
    let storage_k = Constant::String(b"storage".to_vec());
    let count_k = Constant::String(b"count".to_vec());

    let init_counter = api_proto(
        vec![
            I::abc(Op::GetTable, 2, 0, k(0)),
            I::abc(Op::SetTable, 2, k(1), k(2)),
            I::abc(Op::Return, 0, 1, 0),
        ],
        vec![storage_k.clone(), count_k.clone(), Constant::Integer(0)],
        4,
    );
    let incr = api_proto(
        vec![
            I::abc(Op::GetTable, 2, 0, k(0)),
            I::abc(Op::GetTable, 3, 2, k(1)),
            I::abc(Op::Add, 3, r(3), k(2)),
            I::abc(Op::SetTable, 2, k(1), r(3)),
            I::abc(Op::Return, 3, 2, 0),
        ],
        vec![storage_k.clone(), count_k.clone(), Constant::Integer(1)],
        5,
    );
    let get = api_proto(
        vec![
            I::abc(Op::GetTable, 2, 0, k(0)),
            I::abc(Op::GetTable, 3, 2, k(1)),
            I::abc(Op::Return, 3, 2, 0),
        ],
        vec![storage_k, count_k],
        5,
    );
    module_chunk(vec![
        ("get", get),
        ("incr", incr),
        ("init_counter", init_counter),
    ])
}

pub fn bytecode_metadata(apis: &[&str], offline: &[&str]) -> ContractMetadata {
    ContractMetadata {
        apis: apis.iter().map(|s| (*s).to_owned()).collect(),
        offline_apis: offline.iter().map(|s| (*s).to_owned()).collect(),
        ..ContractMetadata::default()
    }
}
