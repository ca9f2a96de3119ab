//! Module name resolution, contract loading and memoisation.
//!
//! Name forms: `foo` resolves through the host's named-contract lookup,
//! `@address:<hex>` through the host's address lookup, `@stream:<id>`
//! against byte streams registered with the engine. Loaded modules are
//! memoised by resolved identity; validation failures leave the memo
//! table untouched.

use crate::engine::Engine;
use crate::host::{ContractIdentifier, ContractMetadata};
use crate::kernel::proxy::{is_special_api, make_proxy};
use crate::le_info;
use crate::types::*;
use crate::value::{FunctionObject, GcRoots};
use crate::vm::loader::load_module;
use crate::value::Upvalue;

pub const ADDRESS_PREFIX: &str = "@address:";
pub const STREAM_PREFIX: &str = "@stream:";

/// A memoised, fully wrapped contract module.
#[derive(Debug, Clone)]
pub struct LoadedContract {
    pub name: String,
    pub address: ContractAddress,
    pub table: TableRef,
    pub apis: IndexSet<String>,
    pub offline_apis: IndexSet<String>,
    pub arg_types: IndexMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    loaded: IndexMap<String, LoadedContract>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            loaded: index_map_new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&LoadedContract> {
        self.loaded.get(key)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub(crate) fn extend_roots(&self, roots: &mut GcRoots) {
        for contract in self.loaded.values() {
            roots.values.push(Value::Table(contract.table));
        }
    }
}

/// A parsed module name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedModule {
    Host(ContractIdentifier),
    Stream(String),
}

pub fn parse_module_name(name: &str) -> Result<ResolvedModule, ProtocolError> {
    if let Some(hex_part) = name.strip_prefix(ADDRESS_PREFIX) {
        let address = ContractAddress::from_hex(hex_part)
            .map_err(|_| ProtocolError::BadModuleName(name.to_owned()))?;
        return Ok(ResolvedModule::Host(ContractIdentifier::Address(address)));
    }
    if let Some(stream_id) = name.strip_prefix(STREAM_PREFIX) {
        if stream_id.is_empty() {
            return Err(ProtocolError::BadModuleName(name.to_owned()));
        }
        return Ok(ResolvedModule::Stream(stream_id.to_owned()));
    }
    if name.is_empty() || name.starts_with('@') {
        return Err(ProtocolError::BadModuleName(name.to_owned()));
    }
    Ok(ResolvedModule::Host(ContractIdentifier::Name(
        name.to_owned(),
    )))
}

/// Resolves a module name to the address the host knows it by.
pub fn resolve_address(
    engine: &Engine,
    name: &str,
) -> Result<ContractAddress, EngineError> {
    match parse_module_name(name)? {
        ResolvedModule::Host(ContractIdentifier::Address(address)) => Ok(address),
        ResolvedModule::Host(ContractIdentifier::Name(bare)) => Ok(engine
            .host()
            .get_contract_address_by_name(&bare)?),
        ResolvedModule::Stream(id) => stream_address(&id),
    }
}

fn stream_address(id: &str) -> Result<ContractAddress, EngineError> {
    ContractAddress::new(format!("STREAM{}", id))
        .map_err(|_| ProtocolError::BadModuleName(format!("{}{}", STREAM_PREFIX, id)).into())
}

/// Loads a contract module through the full pipeline: fetch, verify,
/// execute, validate against host metadata, attach standard fields, wrap
/// APIs in proxies, strip special APIs on non-entry contracts, memoise.
pub fn load_contract(
    engine: &mut Engine,
    name: &str,
) -> Result<LoadedContract, EngineError> {
    let resolved = parse_module_name(name)?;

    let (address, metadata, bytecode) = match &resolved {
        ResolvedModule::Host(identifier) => {
            let opened = engine.host().open_contract(identifier)?;
            (opened.address, Some(opened.metadata), opened.bytecode)
        }
        ResolvedModule::Stream(id) => {
            let bytes = engine
                .streams
                .get(id)
                .cloned()
                .ok_or_else(|| ProtocolError::StreamNotFound(id.clone()))?;
            (stream_address(id)?, None, bytes)
        }
    };

    if let Some(metadata) = &metadata {
        if let Some(state) = &metadata.state {
            if state == "DESTROYED" {
                return Err(ProtocolError::ContractStateForbidsInvocation {
                    state: state.clone(),
                }
                .into());
            }
        }
    }

    let memo_key = address.as_str().to_owned();
    if let Some(loaded) = engine.registry.get(&memo_key) {
        return Ok(loaded.clone());
    }

    // build the raw API table: native module or executed bytecode chunk
    let (table, declared_locals) = if engine.native_modules.contains_key(&address) {
        (build_native_table(engine, &address), None)
    } else {
        let proto = match load_module(&bytecode) {
            Ok(proto) => proto,
            Err(error) => {
                engine.last_compile_error = Some(format!("{:?}", error));
                return Err(error.into());
            }
        };
        let mut upvalues = Vec::new();
        if !proto.upvalues.is_empty() {
            // the single permitted root upvalue is the environment
            let cell = engine
                .heap
                .new_upvalue(Upvalue::Closed(Value::Table(engine.globals)));
            upvalues.push(cell);
        }
        let chunk = engine
            .heap
            .new_function(FunctionObject::lua(proto, upvalues));
        let results = engine.call_value(Value::Function(chunk), vec![])?;
        let table = match results.first() {
            Some(Value::Table(r)) => *r,
            _ => return Err(ProtocolError::ModuleDidNotReturnTable.into()),
        };
        let locals = read_locals_field(engine, table)?;
        (table, locals)
    };

    // exported API set: function-valued string keys
    let mut exported: IndexSet<String> = index_set_new();
    {
        let object = engine.heap.table(table);
        for (key, value) in object.hash_part() {
            if let (TableKey::String(s), Value::Function(_)) = (key, value) {
                exported.insert(engine.heap.string_lossy(*s));
            }
        }
    }
    exported.sort();

    let (apis, offline_apis, arg_types) =
        validate_against_metadata(engine, &address, metadata.as_ref(), exported, declared_locals)?;

    attach_standard_fields(engine, table, name, &address);

    // wrap every function-valued field with the call-proxy trampoline
    let entries: Vec<(TableKey, Value)> = engine
        .heap
        .table(table)
        .hash_part()
        .iter()
        .map(|(k, v)| (*k, *v))
        .collect();
    for (key, inner) in entries {
        let api_name = match (key, inner) {
            (TableKey::String(s), Value::Function(_)) => engine.heap.string_lossy(s),
            _ => continue,
        };
        let proxy = make_proxy(engine, inner, &address, &api_name);
        engine
            .heap
            .table_mut(table)
            .raw_set_unchecked(key, Value::Function(proxy));
    }

    // only the entry contract keeps its special APIs
    let is_entry = engine.entry_contract.as_ref() == Some(&address);
    if !is_entry {
        let keys: Vec<TableKey> = engine.heap.table(table).hash_part().keys().copied().collect();
        for key in keys {
            if let TableKey::String(s) = key {
                if is_special_api(&engine.heap.string_lossy(s)) {
                    engine
                        .heap
                        .table_mut(table)
                        .raw_set_unchecked(key, Value::Nil);
                }
            }
        }
    }

    engine.heap.table_mut(table).set_read_only(true);

    let loaded = LoadedContract {
        name: name.to_owned(),
        address: address.clone(),
        table,
        apis,
        offline_apis,
        arg_types,
    };
    engine.registry.loaded.insert(memo_key, loaded.clone());
    le_info!(
        engine,
        "loaded contract {} as {} ({} apis)",
        name,
        address,
        loaded.apis.len()
    );
    Ok(loaded)
}

fn build_native_table(engine: &mut Engine, address: &ContractAddress) -> TableRef {
    let table = engine.heap.new_table();
    let apis: Vec<(String, crate::value::NativeFn)> = engine.native_modules[address]
        .apis
        .iter()
        .map(|(name, func)| (name.clone(), *func))
        .collect();
    for (name, func) in apis {
        let f = engine
            .heap
            .new_function(FunctionObject::native("contract_api", func, vec![]));
        let key = TableKey::String(engine.heap.new_string(&name));
        engine
            .heap
            .table_mut(table)
            .raw_set_unchecked(key, Value::Function(f));
    }
    table
}

/// The optional `locals` field: a list of offline-only API names.
fn read_locals_field(
    engine: &mut Engine,
    table: TableRef,
) -> Result<Option<IndexSet<String>>, EngineError> {
    let key = TableKey::String(engine.heap.new_string("locals"));
    match engine.heap.table(table).raw_get(&key) {
        Value::Nil => Ok(None),
        Value::Table(list) => {
            let mut names = index_set_new();
            for value in engine.heap.table(list).array_part() {
                if let Value::String(s) = value {
                    names.insert(engine.heap.string_lossy(*s));
                }
            }
            names.sort();
            Ok(Some(names))
        }
        _ => Ok(None),
    }
}

/// Step four of the load pipeline: the exported API set must match what
/// the host has on record for the contract. A mismatch aborts the load
/// before anything is memoised.
fn validate_against_metadata(
    engine: &mut Engine,
    address: &ContractAddress,
    metadata: Option<&ContractMetadata>,
    exported: IndexSet<String>,
    declared_locals: Option<IndexSet<String>>,
) -> Result<(IndexSet<String>, IndexSet<String>, IndexMap<String, Vec<String>>), EngineError> {
    let metadata = match metadata {
        Some(metadata) => metadata,
        // stream modules carry no host metadata to check against
        None => {
            let offline = declared_locals.unwrap_or_default();
            return Ok((exported, offline, index_map_new()));
        }
    };

    let mut declared: IndexSet<String> = metadata.apis.iter().cloned().collect();
    declared.sort();
    if declared != exported {
        engine.last_compile_error = Some(format!(
            "api set mismatch for {}: host declares {:?}, module exports {:?}",
            address, declared, exported
        ));
        return Err(ProtocolError::ApiSetMismatch {
            declared: declared.into_iter().collect(),
            exported: exported.into_iter().collect(),
        }
        .into());
    }

    let mut declared_offline: IndexSet<String> = metadata.offline_apis.iter().cloned().collect();
    declared_offline.sort();
    if let Some(mut locals) = declared_locals {
        locals.sort();
        if locals != declared_offline {
            return Err(ProtocolError::OfflineApiSetMismatch {
                declared: declared_offline.into_iter().collect(),
                exported: locals.into_iter().collect(),
            }
            .into());
        }
    }

    for api in metadata.arg_types.keys() {
        if !exported.contains(api) {
            return Err(ProtocolError::ArgTypeMismatch {
                api: api.clone(),
                expected: "declared api".to_owned(),
                found: "absent".to_owned(),
            }
            .into());
        }
    }

    Ok((exported, declared_offline, metadata.arg_types.clone()))
}

/// Step five: `name`, `id`, the `storage` facade and the read-only
/// `_data` table.
fn attach_standard_fields(
    engine: &mut Engine,
    table: TableRef,
    name: &str,
    address: &ContractAddress,
) {
    let name_value = engine.new_string_value(name);
    let id_value = engine.new_string_value(address.as_str());

    let storage = engine.heap.new_table();
    engine
        .heap
        .table_mut(storage)
        .set_metatable(Some(engine.storage_mt));

    let data = engine.heap.new_table();
    engine.heap.table_mut(data).set_read_only(true);

    let assignments = [
        ("name", name_value),
        ("id", id_value),
        ("storage", Value::Table(storage)),
        ("_data", Value::Table(data)),
    ];
    for (field, value) in assignments {
        let key = TableKey::String(engine.heap.new_string(field));
        engine.heap.table_mut(table).raw_set_unchecked(key, value);
    }
    engine
        .heap
        .table_mut(table)
        .set_metatable(Some(engine.contract_mt));
}
