//! The engine entry point: one API invocation per call, one receipt out.

use crate::engine::{Engine, EngineOptions};
use crate::host::HostInterface;
use crate::kernel::actor::CallType;
use crate::le_info;
use crate::registry;
use crate::track::StorageTrack;
use crate::transaction::receipt::ContractInvokeReceipt;
use crate::types::*;

pub struct TransactionExecutor<'h> {
    engine: Engine<'h>,
}

impl<'h> TransactionExecutor<'h> {
    pub fn new(host: &'h dyn HostInterface, options: EngineOptions) -> Self {
        Self {
            engine: Engine::new(host, options),
        }
    }

    /// The engine behind this executor, for stream/native-module
    /// registration and host-side inspection.
    pub fn engine(&mut self) -> &mut Engine<'h> {
        &mut self.engine
    }

    /// Runs `contract_identifier.api_name(args)` as the transaction's
    /// entry call. On success the receipt carries the result, the events
    /// and the storage change set for the host to commit; on failure
    /// everything is discarded and the typed error surfaces.
    pub fn execute_api(
        &mut self,
        contract_identifier: &str,
        api_name: &str,
        args: Vec<lbor::Value>,
    ) -> Result<ContractInvokeReceipt, EngineError> {
        self.execute_with_call_type(contract_identifier, api_name, args, CallType::Call)
    }

    /// Read-only entry: the API runs under a `STATIC_CALL` frame and any
    /// write, event or transfer it attempts raises a policy error.
    pub fn execute_static_api(
        &mut self,
        contract_identifier: &str,
        api_name: &str,
        args: Vec<lbor::Value>,
    ) -> Result<ContractInvokeReceipt, EngineError> {
        self.execute_with_call_type(contract_identifier, api_name, args, CallType::StaticCall)
    }

    fn execute_with_call_type(
        &mut self,
        contract_identifier: &str,
        api_name: &str,
        args: Vec<lbor::Value>,
        call_type: CallType,
    ) -> Result<ContractInvokeReceipt, EngineError> {
        let engine = &mut self.engine;
        let entry_address = registry::resolve_address(engine, contract_identifier)?;
        engine.begin_invocation(entry_address.clone());

        let depth_before = engine.contract_stack_depth();
        let result =
            Self::invoke(engine, contract_identifier, api_name, args, call_type, &entry_address);
        debug_assert_eq!(engine.contract_stack_depth(), depth_before);

        match result {
            Ok(receipt) => Ok(receipt),
            Err(error) => {
                match &error {
                    EngineError::Compile(e) => {
                        engine.last_compile_error.get_or_insert(format!("{:?}", e));
                    }
                    other => {
                        engine.last_run_error = Some(other.to_string());
                    }
                }
                engine.abort_invocation();
                Err(error)
            }
        }
    }

    fn invoke(
        engine: &mut Engine<'h>,
        contract_identifier: &str,
        api_name: &str,
        args: Vec<lbor::Value>,
        call_type: CallType,
        entry_address: &ContractAddress,
    ) -> Result<ContractInvokeReceipt, EngineError> {
        let contract = registry::load_contract(engine, contract_identifier)?;

        if !contract.apis.contains(api_name) && !contract.offline_apis.contains(api_name) {
            return Err(RuntimeErrorKind::ApiNotFound {
                api: api_name.to_owned(),
            }
            .into());
        }
        check_declared_arg_types(&contract.arg_types, api_name, &args)?;

        let api_key = engine.new_string_value(api_name);
        let api = engine.table_get(Value::Table(contract.table), api_key)?;
        if api.is_nil() {
            return Err(RuntimeErrorKind::ApiNotFound {
                api: api_name.to_owned(),
            }
            .into());
        }

        let mut call_args = vec![Value::Table(contract.table)];
        for arg in &args {
            call_args.push(engine.storage_to_value(arg).map_err(EngineError::Storage)?);
        }

        if call_type != CallType::Call {
            engine.pending_call_type = Some(call_type);
        }
        let invoke_result = engine.call_value(api, call_args);
        engine.pending_call_type = None;
        let results = invoke_result?;

        let result_value = results.first().copied().unwrap_or(Value::Nil);
        engine.set_global("last_return", result_value);
        let result = engine
            .value_to_storage(result_value)
            .map_err(EngineError::Storage)?;

        let track = std::mem::replace(&mut engine.track, StorageTrack::new());
        let storage_changes = track.finalize().map_err(EngineError::Storage)?;
        let events = std::mem::take(&mut engine.events);
        engine.exec_states.clear();

        le_info!(
            engine,
            "{}::{} finished: {} changes, {} events, {} instructions",
            entry_address,
            api_name,
            storage_changes.len(),
            events.len(),
            engine.instructions_executed()
        );

        Ok(ContractInvokeReceipt {
            contract: entry_address.clone(),
            api_name: api_name.to_owned(),
            result,
            events,
            storage_changes,
            logs: engine.take_logs(),
            instructions_executed: engine.instructions_executed(),
        })
    }

    /// `execute_api` followed by the host-side commit: the change set is
    /// applied atomically and the events are delivered in emit order.
    pub fn execute_and_commit(
        &mut self,
        contract_identifier: &str,
        api_name: &str,
        args: Vec<lbor::Value>,
    ) -> Result<ContractInvokeReceipt, EngineError> {
        let receipt = self.execute_api(contract_identifier, api_name, args)?;
        self.commit(&receipt)?;
        Ok(receipt)
    }

    pub fn commit(&mut self, receipt: &ContractInvokeReceipt) -> Result<(), EngineError> {
        let host = self.engine.host();
        host.storage_commit(&receipt.storage_changes)
            .map_err(|e| EngineError::Storage(StorageError::CommitRejected(e)))?;
        for event in &receipt.events {
            host.emit_event(&event.contract_id, &event.name, &event.arg);
        }
        Ok(())
    }
}

fn type_name_of(value: &lbor::Value) -> &'static str {
    match value {
        lbor::Value::Null => "nil",
        lbor::Value::Bool(_) => "boolean",
        lbor::Value::Integer(_) | lbor::Value::BigInteger(_) | lbor::Value::Decimal(_) => "number",
        lbor::Value::String(_) | lbor::Value::Bytes(_) => "string",
        lbor::Value::Array(_) | lbor::Value::Map(_) => "table",
    }
}

/// When the host metadata declares argument types for an API, the provided
/// arguments must match them positionally.
fn check_declared_arg_types(
    arg_types: &IndexMap<String, Vec<String>>,
    api_name: &str,
    args: &[lbor::Value],
) -> Result<(), EngineError> {
    let declared = match arg_types.get(api_name) {
        Some(declared) => declared,
        None => return Ok(()),
    };
    for (index, expected) in declared.iter().enumerate() {
        let found = args.get(index).map(type_name_of).unwrap_or("nil");
        if expected != found {
            return Err(ProtocolError::ArgTypeMismatch {
                api: api_name.to_owned(),
                expected: expected.clone(),
                found: found.to_owned(),
            }
            .into());
        }
    }
    Ok(())
}
