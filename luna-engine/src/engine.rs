//! The engine instance: one value heap, one identity stack, one registry,
//! one track. Everything is owned here and passed down explicitly; there
//! is no process-global or thread-local engine state anywhere.

use crate::host::HostInterface;
use crate::kernel::actor::{CallType, ContractStackEntry};
use crate::log::Level;
use crate::registry::ModuleRegistry;
use crate::track::StorageTrack;
use crate::transaction::receipt::ContractEvent;
use crate::types::*;
use crate::value::{GcRoots, Heap, NativeFn};
use crate::vm::frame::ExecState;

pub use crate::system::limits::StopHandle;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Executed-instruction budget per invocation; 0 disables the meter.
    pub instruction_limit: u64,
    pub max_call_depth: usize,
    pub max_value_stack: usize,
    /// Recursion bound when serialising tables into storage.
    pub storage_serialize_depth: usize,
    /// Collect `le_debug!`-style lines into the receipt.
    pub trace: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            instruction_limit: 10_000_000,
            max_call_depth: 200,
            max_value_stack: 1_000_000,
            storage_serialize_depth: 16,
            trace: false,
        }
    }
}

/// A native contract module registered with the engine: API names mapped
/// to native functions, standing in for a compiled bytecode module.
pub(crate) struct NativeModuleSpec {
    pub apis: Vec<(String, NativeFn)>,
}

pub struct Engine<'h> {
    pub(crate) host: &'h dyn HostInterface,
    pub(crate) heap: Heap,
    pub(crate) globals: TableRef,
    pub(crate) type_metatables: [Option<TableRef>; Value::NUM_TYPE_TAGS],
    pub(crate) contract_mt: TableRef,
    pub(crate) storage_mt: TableRef,

    pub(crate) exec_states: Vec<ExecState>,
    next_exec_id: u64,

    pub(crate) registry: ModuleRegistry,
    pub(crate) track: StorageTrack,
    pub(crate) events: Vec<ContractEvent>,

    pub(crate) contract_stack: Vec<ContractStackEntry>,
    /// One-shot: consumed by the next call-proxy entry.
    pub(crate) pending_call_type: Option<CallType>,
    pub(crate) entry_contract: Option<ContractAddress>,

    pub(crate) streams: IndexMap<String, Vec<u8>>,
    pub(crate) native_modules: IndexMap<ContractAddress, NativeModuleSpec>,

    pub(crate) options: EngineOptions,
    pub(crate) limits: crate::system::limits::ExecutionLimits,
    /// Rust-level reentry depth (natives calling back into the
    /// interpreter); counted against `max_call_depth` together with
    /// bytecode frames.
    pub(crate) native_depth: usize,

    pub(crate) last_compile_error: Option<String>,
    pub(crate) last_run_error: Option<String>,
    logs: Vec<(Level, String)>,

    /// Error payload kept alive across an unwind (GC root).
    pub(crate) in_flight_error: Option<Value>,

    /// Optional host-installed hook observing interpreter transitions.
    pub(crate) hook: Option<HookFn<'h>>,
}

/// Hook callback type: fired at instruction, call and return boundaries.
/// Hooks run synchronously on the engine thread and cannot suspend.
pub type HookFn<'h> = Box<dyn FnMut(&mut Engine<'h>, crate::vm::interpreter::HookEvent) + 'h>;

impl<'h> Engine<'h> {
    pub fn new(host: &'h dyn HostInterface, options: EngineOptions) -> Self {
        let mut heap = Heap::new();
        let globals = heap.new_table();
        let contract_mt = heap.new_table();
        let storage_mt = heap.new_table();
        let limits = crate::system::limits::ExecutionLimits::new(options.instruction_limit);
        let mut engine = Self {
            host,
            heap,
            globals,
            type_metatables: [None; Value::NUM_TYPE_TAGS],
            contract_mt,
            storage_mt,
            exec_states: Vec::new(),
            next_exec_id: 1,
            registry: ModuleRegistry::new(),
            track: StorageTrack::new(),
            events: Vec::new(),
            contract_stack: Vec::new(),
            pending_call_type: None,
            entry_contract: None,
            streams: index_map_new(),
            native_modules: index_map_new(),
            options,
            limits,
            native_depth: 0,
            last_compile_error: None,
            last_run_error: None,
            logs: Vec::new(),
            in_flight_error: None,
            hook: None,
        };
        crate::vm::baselib::install(&mut engine);
        crate::system::natives::install(&mut engine);
        engine
    }

    pub fn host(&self) -> &'h dyn HostInterface {
        self.host
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.limits.stop_handle()
    }

    pub fn instructions_executed(&self) -> u64 {
        self.limits.instructions_executed
    }

    pub fn last_compile_error(&self) -> Option<&str> {
        self.last_compile_error.as_deref()
    }

    pub fn last_run_error(&self) -> Option<&str> {
        self.last_run_error.as_deref()
    }

    // ----- logging -----

    pub fn trace_enabled(&self) -> bool {
        self.options.trace
    }

    pub fn log(&mut self, level: Level, message: String) {
        self.logs.push((level, message));
    }

    pub fn take_logs(&mut self) -> Vec<(Level, String)> {
        std::mem::take(&mut self.logs)
    }

    // ----- invocation lifecycle -----

    /// Clears all per-invocation state. The identity stack must already be
    /// balanced; a leftover entry would be a proxy bug.
    pub(crate) fn begin_invocation(&mut self, entry: ContractAddress) {
        debug_assert!(self.contract_stack.is_empty());
        self.track.clear();
        self.events.clear();
        self.logs.clear();
        self.last_compile_error = None;
        self.last_run_error = None;
        self.pending_call_type = None;
        self.entry_contract = Some(entry);
        self.limits.reset_for_invocation();
        self.in_flight_error = None;
    }

    /// Rolls the engine back after a failed invocation: the track and
    /// events are discarded and the identity stack is forcibly rebalanced.
    pub(crate) fn abort_invocation(&mut self) {
        self.track.clear();
        self.events.clear();
        self.contract_stack.clear();
        self.pending_call_type = None;
        self.exec_states.clear();
        self.native_depth = 0;
        self.in_flight_error = None;
    }

    // ----- streams and native modules -----

    /// Hands the engine an in-memory byte stream, loadable through the
    /// `@stream:<id>` module-name form.
    pub fn register_stream(&mut self, id: &str, bytes: Vec<u8>) {
        self.streams.insert(id.to_owned(), bytes);
    }

    /// Registers a native contract module for `address`. The registry
    /// treats it exactly like a bytecode module from the API-validation
    /// step onward.
    pub fn register_native_contract(
        &mut self,
        address: ContractAddress,
        apis: Vec<(String, NativeFn)>,
    ) {
        self.native_modules
            .insert(address, NativeModuleSpec { apis });
    }

    // ----- execution states -----

    pub(crate) fn push_exec_state(&mut self) -> usize {
        let id = self.next_exec_id;
        self.next_exec_id += 1;
        self.exec_states.push(ExecState::new(id));
        self.exec_states.len() - 1
    }

    pub(crate) fn fresh_exec_state(&mut self) -> ExecState {
        let id = self.next_exec_id;
        self.next_exec_id += 1;
        ExecState::new(id)
    }

    pub(crate) fn exec(&self) -> &ExecState {
        self.exec_states.last().expect("no active execution state")
    }

    pub(crate) fn exec_mut(&mut self) -> &mut ExecState {
        self.exec_states
            .last_mut()
            .expect("no active execution state")
    }

    // ----- value helpers -----

    pub fn new_string_value(&mut self, s: &str) -> Value {
        Value::String(self.heap.new_string(s))
    }

    pub fn new_bytes_value(&mut self, bytes: &[u8]) -> Value {
        Value::String(self.heap.intern(bytes))
    }

    /// String content of a value, when it is a string.
    pub fn value_to_rust_string(&self, value: Value) -> Option<String> {
        match value {
            Value::String(r) => Some(self.heap.string_lossy(r)),
            _ => None,
        }
    }

    pub fn globals(&self) -> TableRef {
        self.globals
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        let key = TableKey::String(self.heap.new_string(name));
        self.heap
            .table_mut(self.globals)
            .raw_set_unchecked(key, value);
    }

    pub fn get_global(&mut self, name: &str) -> Value {
        let key = TableKey::String(self.heap.new_string(name));
        self.heap.table(self.globals).raw_get(&key)
    }

    pub fn type_metatable(&self, tag: usize) -> Option<TableRef> {
        self.type_metatables[tag]
    }

    pub fn set_type_metatable(&mut self, tag: usize, metatable: Option<TableRef>) {
        self.type_metatables[tag] = metatable;
    }

    // ----- garbage collection -----

    pub(crate) fn gather_roots(&self) -> GcRoots {
        let mut roots = GcRoots::default();
        roots.values.push(Value::Table(self.globals));
        roots.values.push(Value::Table(self.contract_mt));
        roots.values.push(Value::Table(self.storage_mt));
        for metatable in self.type_metatables.iter().flatten() {
            roots.values.push(Value::Table(*metatable));
        }
        for exec in &self.exec_states {
            roots.values.extend(exec.stack.iter().copied());
            for frame in &exec.frames {
                roots.values.push(Value::Function(frame.func));
            }
            roots
                .upvalues
                .extend(exec.open_upvalues.iter().map(|(_, r)| *r));
        }
        self.registry.extend_roots(&mut roots);
        if let Some(value) = self.in_flight_error {
            roots.values.push(value);
        }
        roots
    }

    /// Safepoint called between instructions: all live data is reachable
    /// from the root set here.
    pub(crate) fn gc_safepoint(&mut self) {
        if self.heap.should_collect() {
            let roots = self.gather_roots();
            let freed = self.heap.collect(&roots);
            crate::le_trace!(self, "gc reclaimed {} objects", freed);
        }
    }

    /// Forces a full collection; mainly for tests and embedders.
    pub fn collect_garbage(&mut self) -> usize {
        let roots = self.gather_roots();
        self.heap.collect(&roots)
    }

    // ----- identity stack -----

    pub fn current_contract(&self) -> Option<&ContractStackEntry> {
        self.contract_stack.last()
    }

    pub fn loaded_module_count(&self) -> usize {
        self.registry.loaded_count()
    }

    pub fn contract_stack_depth(&self) -> usize {
        self.contract_stack.len()
    }

    /// True when any active frame was entered as a static call.
    pub fn in_static_context(&self) -> bool {
        self.contract_stack
            .iter()
            .any(|entry| entry.call_type == CallType::StaticCall)
    }

    // ----- embedding API for native contract modules -----

    /// Effective read of the calling contract's storage slot: the
    /// transaction's own post-image when present, the host value
    /// otherwise.
    pub fn contract_storage_read(&mut self, slot: &str) -> Result<lbor::Value, EngineError> {
        let contract = self.current_storage_contract()?;
        self.limits.check_stop()?;
        self.track
            .effective_read(self.host, &contract, slot)
            .map_err(EngineError::Storage)
    }

    /// Policy-checked write into the calling contract's storage slot.
    pub fn contract_storage_write(
        &mut self,
        slot: &str,
        value: lbor::Value,
    ) -> Result<(), EngineError> {
        self.assert_storage_writable()?;
        let contract = self.current_storage_contract()?;
        self.limits.check_stop()?;
        self.track
            .write(self.host, &contract, slot, value)
            .map_err(EngineError::Storage)
    }

    /// Policy-checked event emission attributed to the calling contract.
    pub fn emit_contract_event(&mut self, name: &str, arg: &str) -> Result<(), EngineError> {
        self.assert_events_allowed()?;
        let contract_id = self
            .current_contract()
            .map(|entry| entry.contract_id.clone())
            .ok_or(EngineError::Policy(PolicyError::StorageAccessOutsideContract))?;
        self.events.push(ContractEvent {
            contract_id,
            name: name.to_owned(),
            arg: arg.to_owned(),
        });
        Ok(())
    }

    /// Source position of the instruction currently executing, when a
    /// bytecode frame is active and carries debug info.
    pub(crate) fn current_location(&self) -> Option<SourceLocation> {
        let exec = self.exec_states.last()?;
        let frame = exec.frames.last()?;
        let closure = self.heap.function(frame.func).as_lua()?;
        let pc = frame.pc.saturating_sub(1);
        Some(SourceLocation {
            source: closure.proto.source.clone(),
            line: closure.proto.line_at(pc).unwrap_or(0),
        })
    }

    /// The value a protected call hands its handler: the raised payload
    /// for `error(v)`, the display text for engine-raised errors.
    pub(crate) fn error_to_value(&mut self, error: &EngineError) -> Value {
        if let EngineError::Runtime(runtime) = error {
            if let RuntimeErrorKind::ScriptRaised(value) = &runtime.kind {
                return *value;
            }
        }
        let text = error.to_string();
        self.new_string_value(&text)
    }

    // ----- hooks -----

    pub fn set_hook(&mut self, hook: HookFn<'h>) {
        self.hook = Some(hook);
    }

    pub fn clear_hook(&mut self) {
        self.hook = None;
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }
}
