//! Engine-level scenarios: bytecode modules through the full pipeline,
//! metadata validation, special-API quarantine, cross-contract identity,
//! interrupts.

mod common;

use common::{addr, bytecode_metadata, deploy_token, module_chunk, overflow_contract_bytes};
use luna_engine::engine::{Engine, EngineOptions};
use luna_engine::errors::{
    EngineError, InterruptReason, PolicyError, ProtocolError, RuntimeErrorKind,
};
use luna_engine::host::{HostInterface, InMemoryHost};
use luna_engine::value::{NativeCall, NativeFn, NativeReturn, Value};
use luna_engine::TransactionExecutor;

#[test]
fn test_s5_integer_overflow_aborts_the_transaction() {
    let host = InMemoryHost::new();
    let mut executor = TransactionExecutor::new(&host, EngineOptions::default());
    host.deploy_contract(
        Some("overflow"),
        addr("CONoverflow"),
        overflow_contract_bytes(),
        bytecode_metadata(&["boom", "ok"], &[]),
    );

    let error = executor
        .execute_and_commit("overflow", "boom", vec![])
        .unwrap_err();
    match &error {
        EngineError::Runtime(e) => assert_eq!(e.kind, RuntimeErrorKind::IntegerOverflow),
        other => panic!("expected runtime error, got {:?}", other),
    }
    assert!(error.to_string().contains("integer overflow"));
    // no storage was touched and the error buffer is populated
    assert_eq!(host.storage_get(&addr("CONoverflow"), "count").unwrap(), None);
    assert!(executor
        .engine()
        .last_run_error()
        .unwrap()
        .contains("integer overflow"));

    // the engine remains usable for the next transaction
    let receipt = executor.execute_and_commit("overflow", "ok", vec![]).unwrap();
    assert_eq!(receipt.result_string(), "fine");
}

#[test]
fn test_s6_api_set_mismatch_rejects_module() {
    let host = InMemoryHost::new();
    let mut executor = TransactionExecutor::new(&host, EngineOptions::default());
    // module exports {boom, ok}; metadata declares {boom, nope}
    host.deploy_contract(
        Some("mismatch"),
        addr("CONmismatch"),
        overflow_contract_bytes(),
        bytecode_metadata(&["boom", "nope"], &[]),
    );

    let error = executor
        .execute_api("mismatch", "boom", vec![])
        .unwrap_err();
    assert!(matches!(
        error,
        EngineError::Protocol(ProtocolError::ApiSetMismatch { .. })
    ));
    // nothing was memoised
    assert_eq!(executor.engine().loaded_module_count(), 0);
}

#[test]
fn test_special_apis_stripped_from_non_entry_contracts() {
    fn probe_other_init(
        engine: &mut Engine,
        _call: NativeCall,
    ) -> Result<NativeReturn, EngineError> {
        let import = engine.get_global("import_contract");
        let name = engine.new_string_value("token");
        let table = engine.call_value(import, vec![name])?[0];
        let init_key = engine.new_string_value("init");
        let init = engine.table_get(table, init_key)?;
        let state_key = engine.new_string_value("state");
        let state = engine.table_get(table, state_key)?;
        Ok(NativeReturn::Values(vec![
            Value::Bool(init.is_nil()),
            Value::Bool(state.is_nil()),
        ]))
    }

    let host = InMemoryHost::new();
    let mut executor = TransactionExecutor::new(&host, EngineOptions::default());
    deploy_token(&mut executor, &host, "token", &addr("CONtoken"));

    let probe_address = addr("CONprobe");
    host.deploy_contract(
        Some("probe"),
        probe_address.clone(),
        Vec::new(),
        bytecode_metadata(&["probe"], &[]),
    );
    executor.engine().register_native_contract(
        probe_address,
        vec![("probe".to_owned(), probe_other_init as NativeFn)],
    );

    // the probe is the entry contract; the token is imported as a
    // non-entry module, so its special `init` is gone while ordinary
    // APIs remain
    let receipt = executor.execute_api("probe", "probe", vec![]).unwrap();
    assert_eq!(
        receipt.result,
        lbor::Value::Bool(true) // init stripped
    );
}

#[test]
fn test_delegate_call_inherits_storage_context() {
    fn vault_store_marker(
        engine: &mut Engine,
        _call: NativeCall,
    ) -> Result<NativeReturn, EngineError> {
        engine.contract_storage_write("marker", lbor::Value::String("X".to_owned()))?;
        Ok(NativeReturn::Values(vec![]))
    }

    fn outer_do_delegate(
        engine: &mut Engine,
        _call: NativeCall,
    ) -> Result<NativeReturn, EngineError> {
        let delegate_call = engine.get_global("delegate_call");
        let vault = engine.new_string_value("vault");
        let api = engine.new_string_value("store_marker");
        engine.call_value(delegate_call, vec![vault, api])?;
        Ok(NativeReturn::Values(vec![]))
    }

    let host = InMemoryHost::new();
    let mut executor = TransactionExecutor::new(&host, EngineOptions::default());

    let vault_address = addr("CONvault");
    host.deploy_contract(
        Some("vault"),
        vault_address.clone(),
        Vec::new(),
        bytecode_metadata(&["store_marker"], &[]),
    );
    executor.engine().register_native_contract(
        vault_address.clone(),
        vec![("store_marker".to_owned(), vault_store_marker as NativeFn)],
    );

    let outer_address = addr("CONouter");
    host.deploy_contract(
        Some("outer"),
        outer_address.clone(),
        Vec::new(),
        bytecode_metadata(&["do_delegate"], &[]),
    );
    executor.engine().register_native_contract(
        outer_address.clone(),
        vec![("do_delegate".to_owned(), outer_do_delegate as NativeFn)],
    );

    let receipt = executor
        .execute_and_commit("outer", "do_delegate", vec![])
        .unwrap();

    // the write landed in the caller's storage, not the vault's
    assert_eq!(receipt.storage_changes.len(), 1);
    assert_eq!(receipt.storage_changes[0].contract, outer_address);
    assert_eq!(
        host.storage_get(&outer_address, "marker").unwrap(),
        Some(lbor::lbor_encode(&lbor::Value::String("X".to_owned())).unwrap())
    );
    assert_eq!(host.storage_get(&vault_address, "marker").unwrap(), None);
}

#[test]
fn test_static_context_propagates_into_nested_calls() {
    fn vault_store_marker(
        engine: &mut Engine,
        _call: NativeCall,
    ) -> Result<NativeReturn, EngineError> {
        engine.contract_storage_write("marker", lbor::Value::String("X".to_owned()))?;
        Ok(NativeReturn::Values(vec![]))
    }

    fn outer_nested_write(
        engine: &mut Engine,
        _call: NativeCall,
    ) -> Result<NativeReturn, EngineError> {
        let import = engine.get_global("import_contract");
        let vault_name = engine.new_string_value("vault");
        let table = engine.call_value(import, vec![vault_name])?[0];
        let api_key = engine.new_string_value("store_marker");
        let api = engine.table_get(table, api_key)?;
        // a plain nested call: the surrounding static frame still forbids
        // the write
        engine.call_value(api, vec![table])?;
        Ok(NativeReturn::Values(vec![]))
    }

    let host = InMemoryHost::new();
    let mut executor = TransactionExecutor::new(&host, EngineOptions::default());
    let vault_address = addr("CONvault");
    host.deploy_contract(
        Some("vault"),
        vault_address.clone(),
        Vec::new(),
        bytecode_metadata(&["store_marker"], &[]),
    );
    executor.engine().register_native_contract(
        vault_address,
        vec![("store_marker".to_owned(), vault_store_marker as NativeFn)],
    );
    let outer_address = addr("CONouter");
    host.deploy_contract(
        Some("outer"),
        outer_address.clone(),
        Vec::new(),
        bytecode_metadata(&["nested_write"], &[]),
    );
    executor.engine().register_native_contract(
        outer_address,
        vec![("nested_write".to_owned(), outer_nested_write as NativeFn)],
    );

    let error = executor
        .execute_static_api("outer", "nested_write", vec![])
        .unwrap_err();
    assert_eq!(
        error,
        EngineError::Policy(PolicyError::StorageWriteInStaticCall)
    );
}

#[test]
fn test_instruction_limit_interrupts_runaway_bytecode() {
    use luna_engine::vm::opcode::{Instruction as I, OpCode as Op};
    use luna_engine::vm::prototype::{Constant, Prototype};
    use std::sync::Arc;

    // spin: for i = 1, 10^9 do end
    let spin = Arc::new(Prototype {
        source: "@contract".to_owned(),
        line_defined: 1,
        last_line_defined: 1,
        num_params: 2,
        is_vararg: false,
        max_stack_size: 8,
        code: vec![
            I::abx(Op::LoadK, 2, 0),
            I::abx(Op::LoadK, 3, 1),
            I::abx(Op::LoadK, 4, 0),
            I::asbx(Op::ForPrep, 2, 0),
            I::asbx(Op::ForLoop, 2, -1),
            I::abc(Op::Return, 0, 1, 0),
        ],
        constants: vec![Constant::Integer(1), Constant::Integer(1_000_000_000)],
        upvalues: vec![],
        protos: vec![],
        line_info: vec![],
        local_vars: vec![],
    });
    let bytes = module_chunk(vec![("spin", spin)]);

    let host = InMemoryHost::new();
    let mut executor = TransactionExecutor::new(
        &host,
        EngineOptions {
            instruction_limit: 10_000,
            ..EngineOptions::default()
        },
    );
    host.deploy_contract(
        Some("spinner"),
        addr("CONspin"),
        bytes,
        bytecode_metadata(&["spin"], &[]),
    );

    let error = executor.execute_api("spinner", "spin", vec![]).unwrap_err();
    assert_eq!(
        error,
        EngineError::Interrupted(InterruptReason::InstructionLimitExceeded(10_000))
    );
    assert_eq!(executor.engine().contract_stack_depth(), 0);
}

#[test]
fn test_stream_modules_load_without_metadata() {
    let host = InMemoryHost::new();
    let mut executor = TransactionExecutor::new(&host, EngineOptions::default());
    executor
        .engine()
        .register_stream("demo", overflow_contract_bytes());

    let receipt = executor
        .execute_api("@stream:demo", "ok", vec![])
        .unwrap();
    assert_eq!(receipt.result_string(), "fine");
}

#[test]
fn test_address_prefixed_module_names_resolve() {
    let host = InMemoryHost::new();
    let mut executor = TransactionExecutor::new(&host, EngineOptions::default());
    let address = addr("CONoverflow");
    host.deploy_contract(
        None,
        address.clone(),
        overflow_contract_bytes(),
        bytecode_metadata(&["boom", "ok"], &[]),
    );

    let name = format!("@address:{}", address.to_hex());
    let receipt = executor.execute_api(&name, "ok", vec![]).unwrap();
    assert_eq!(receipt.result_string(), "fine");

    // unknown api on a loaded module
    let error = executor.execute_api(&name, "missing", vec![]).unwrap_err();
    assert!(matches!(
        error,
        EngineError::Runtime(e) if matches!(e.kind, RuntimeErrorKind::ApiNotFound { .. })
    ));
}

#[test]
fn test_stop_flag_unwinds_from_another_thread() {
    use luna_engine::vm::opcode::{Instruction as I, OpCode as Op};
    use luna_engine::vm::prototype::{Constant, Prototype};
    use std::sync::Arc;

    let spin = Arc::new(Prototype {
        source: "@contract".to_owned(),
        line_defined: 1,
        last_line_defined: 1,
        num_params: 2,
        is_vararg: false,
        max_stack_size: 8,
        code: vec![
            I::abx(Op::LoadK, 2, 0),
            I::abx(Op::LoadK, 3, 1),
            I::abx(Op::LoadK, 4, 0),
            I::asbx(Op::ForPrep, 2, 0),
            I::asbx(Op::ForLoop, 2, -1),
            I::abc(Op::Return, 0, 1, 0),
        ],
        constants: vec![Constant::Integer(1), Constant::Integer(2_000_000_000)],
        upvalues: vec![],
        protos: vec![],
        line_info: vec![],
        local_vars: vec![],
    });
    let bytes = module_chunk(vec![("spin", spin)]);

    let host = InMemoryHost::new();
    let mut executor = TransactionExecutor::new(
        &host,
        EngineOptions {
            instruction_limit: 0, // only the stop flag can end this
            ..EngineOptions::default()
        },
    );
    host.deploy_contract(
        Some("spinner"),
        addr("CONspin"),
        bytes,
        bytecode_metadata(&["spin"], &[]),
    );

    let stop = executor.engine().stop_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        stop.stop();
    });

    let error = executor.execute_api("spinner", "spin", vec![]).unwrap_err();
    assert_eq!(
        error,
        EngineError::Interrupted(InterruptReason::StopRequested)
    );
    stopper.join().unwrap();
}
