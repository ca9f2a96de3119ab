//! The base library subset contracts rely on, plus the coroutine library.
//!
//! Everything here is a native closure registered in the engine's globals
//! table. `pcall`/`xpcall` are the protected-call markers of the error
//! recovery design: they call back into the interpreter and absorb any
//! catchable error.

use crate::engine::Engine;
use crate::types::*;
use crate::value::{FunctionObject, NativeCall, NativeFn, NativeReturn};
use crate::vm::frame::{ThreadObject, ThreadStatus};

pub fn install(engine: &mut Engine) {
    register(engine, "type", nat_type);
    register(engine, "tostring", nat_tostring);
    register(engine, "tonumber", nat_tonumber);
    register(engine, "rawget", nat_rawget);
    register(engine, "rawset", nat_rawset);
    register(engine, "rawequal", nat_rawequal);
    register(engine, "rawlen", nat_rawlen);
    register(engine, "next", nat_next);
    register(engine, "pairs", nat_pairs);
    register(engine, "ipairs", nat_ipairs);
    register(engine, "select", nat_select);
    register(engine, "assert", nat_assert);
    register(engine, "error", nat_error);
    register(engine, "pcall", nat_pcall);
    register(engine, "xpcall", nat_xpcall);

    let coroutine = engine.heap.new_table();
    for (name, func) in [
        ("create", nat_coroutine_create as NativeFn),
        ("resume", nat_coroutine_resume as NativeFn),
        ("yield", nat_coroutine_yield as NativeFn),
        ("status", nat_coroutine_status as NativeFn),
        ("isyieldable", nat_coroutine_isyieldable as NativeFn),
    ] {
        let f = engine.heap.new_function(FunctionObject::native(name, func, vec![]));
        let key = TableKey::String(engine.heap.new_string(name));
        engine
            .heap
            .table_mut(coroutine)
            .raw_set_unchecked(key, Value::Function(f));
    }
    engine.set_global("coroutine", Value::Table(coroutine));

    let globals = engine.globals();
    engine.set_global("_G", Value::Table(globals));
}

fn register(engine: &mut Engine, name: &'static str, func: NativeFn) {
    let f = engine.heap.new_function(FunctionObject::native(name, func, vec![]));
    engine.set_global(name, Value::Function(f));
}

fn values(values: Vec<Value>) -> Result<NativeReturn, EngineError> {
    Ok(NativeReturn::Values(values))
}

fn bad_argument(
    func: &'static str,
    index: usize,
    expected: &'static str,
    found: Value,
) -> EngineError {
    RuntimeErrorKind::BadArgument {
        func,
        index,
        expected,
        found: found.type_name(),
    }
    .into()
}

fn want_table(
    func: &'static str,
    index: usize,
    value: Value,
) -> Result<TableRef, EngineError> {
    match value {
        Value::Table(r) => Ok(r),
        other => Err(bad_argument(func, index, "table", other)),
    }
}

// ----- values and tables -----

fn nat_type(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let name = call.arg(0).type_name();
    values(vec![engine.new_string_value(name)])
}

fn nat_tostring(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let text = engine.display_value(call.arg(0));
    values(vec![engine.new_string_value(&text)])
}

fn nat_tonumber(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    values(vec![
        engine.coerce_to_number(call.arg(0)).unwrap_or(Value::Nil)
    ])
}

fn nat_rawget(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let table = want_table("rawget", 1, call.arg(0))?;
    let value = match TableKey::from_value(call.arg(1)) {
        Ok(key) => engine.heap.table(table).raw_get(&key),
        Err(_) => Value::Nil,
    };
    values(vec![value])
}

fn nat_rawset(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let table = want_table("rawset", 1, call.arg(0))?;
    let key = TableKey::from_value(call.arg(1)).map_err(EngineError::from)?;
    engine
        .heap
        .table_mut(table)
        .raw_set(key, call.arg(2))
        .map_err(EngineError::Policy)?;
    values(vec![call.arg(0)])
}

fn nat_rawequal(_engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    values(vec![Value::Bool(call.arg(0).raw_equals(&call.arg(1)))])
}

fn nat_rawlen(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    match call.arg(0) {
        Value::Table(r) => values(vec![Value::Integer(engine.heap.table(r).length())]),
        Value::String(r) => values(vec![Value::Integer(engine.heap.string(r).len() as i64)]),
        other => Err(bad_argument("rawlen", 1, "table or string", other)),
    }
}

fn nat_next(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let table = want_table("next", 1, call.arg(0))?;
    let key = match call.arg(1) {
        Value::Nil => None,
        other => Some(TableKey::from_value(other).map_err(EngineError::from)?),
    };
    match engine.heap.table(table).next_entry(key.as_ref()) {
        Some((k, v)) => values(vec![k.to_value(), v]),
        None => values(vec![Value::Nil]),
    }
}

fn nat_pairs(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    want_table("pairs", 1, call.arg(0))?;
    let iter = engine
        .heap
        .new_function(FunctionObject::native("next", nat_next, vec![]));
    values(vec![Value::Function(iter), call.arg(0), Value::Nil])
}

fn nat_ipairs(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let iter = engine
        .heap
        .new_function(FunctionObject::native("ipairs_iter", nat_ipairs_iter, vec![]));
    values(vec![Value::Function(iter), call.arg(0), Value::Integer(0)])
}

fn nat_ipairs_iter(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let index = match call.arg(1) {
        Value::Integer(i) => i,
        other => return Err(bad_argument("ipairs", 2, "integer", other)),
    };
    let next = index
        .checked_add(1)
        .ok_or(RuntimeErrorKind::IntegerOverflow)?;
    let value = engine.table_get(call.arg(0), Value::Integer(next))?;
    if value.is_nil() {
        values(vec![Value::Nil])
    } else {
        values(vec![Value::Integer(next), value])
    }
}

fn nat_select(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let selector = call.arg(0);
    if let Some(text) = engine.value_to_rust_string(selector) {
        if text == "#" {
            return values(vec![Value::Integer(call.args.len() as i64 - 1)]);
        }
    }
    match selector {
        Value::Integer(n) if n >= 1 => {
            values(call.args.iter().skip(n as usize).copied().collect())
        }
        Value::Integer(n) if n < 0 => {
            let len = call.args.len() as i64 - 1;
            let start = (len + n).max(0);
            values(call.args.iter().skip(1 + start as usize).copied().collect())
        }
        other => Err(bad_argument("select", 1, "index", other)),
    }
}

// ----- errors and protected calls -----

fn nat_assert(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    if call.arg(0).truthy() {
        return values(call.args);
    }
    if call.args.len() > 1 {
        let payload = call.arg(1);
        engine.in_flight_error = Some(payload);
        return Err(RuntimeErrorKind::ScriptRaised(payload).into());
    }
    Err(RuntimeErrorKind::AssertionFailed.into())
}

fn nat_error(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let level = match call.arg(1) {
        Value::Nil => 1,
        Value::Integer(i) => i,
        _ => 1,
    };
    let mut payload = call.arg(0);
    if level > 0 {
        if let Some(text) = engine.value_to_rust_string(payload) {
            if let Some(location) = engine.current_location() {
                payload = engine.new_string_value(&format!("{}: {}", location, text));
            }
        }
    }
    engine.in_flight_error = Some(payload);
    Err(RuntimeErrorKind::ScriptRaised(payload).into())
}

fn nat_pcall(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let mut args = call.args;
    if args.is_empty() {
        return Err(bad_argument("pcall", 1, "value", Value::Nil));
    }
    let func = args.remove(0);
    let contract_depth = engine.contract_stack.len();
    match engine.call_value(func, args) {
        Ok(mut results) => {
            results.insert(0, Value::Bool(true));
            values(results)
        }
        Err(error) if error.is_catchable() => {
            let payload = engine.error_to_value(&error);
            engine.in_flight_error = None;
            engine.contract_stack.truncate(contract_depth);
            values(vec![Value::Bool(false), payload])
        }
        Err(error) => Err(error),
    }
}

fn nat_xpcall(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let mut args = call.args;
    if args.len() < 2 {
        return Err(bad_argument("xpcall", 2, "value", Value::Nil));
    }
    let func = args.remove(0);
    let handler = args.remove(0);
    let contract_depth = engine.contract_stack.len();
    match engine.call_value(func, args) {
        Ok(mut results) => {
            results.insert(0, Value::Bool(true));
            values(results)
        }
        Err(error) if error.is_catchable() => {
            let payload = engine.error_to_value(&error);
            engine.in_flight_error = None;
            engine.contract_stack.truncate(contract_depth);
            let mut handled = engine.call_value(handler, vec![payload])?;
            handled.insert(0, Value::Bool(false));
            values(handled)
        }
        Err(error) => Err(error),
    }
}

// ----- coroutines -----

fn nat_coroutine_create(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let body = match call.arg(0) {
        Value::Function(r) if engine.heap.function(r).as_lua().is_some() => r,
        other => return Err(bad_argument("coroutine.create", 1, "function", other)),
    };
    let exec = engine.fresh_exec_state();
    let thread = engine.heap.new_thread(ThreadObject::new(body, exec));
    values(vec![Value::Thread(thread)])
}

fn nat_coroutine_resume(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let mut args = call.args;
    if args.is_empty() {
        return Err(bad_argument("coroutine.resume", 1, "coroutine", Value::Nil));
    }
    let thread = match args.remove(0) {
        Value::Thread(r) => r,
        other => return Err(bad_argument("coroutine.resume", 1, "coroutine", other)),
    };

    let status = engine.heap.thread(thread).status;
    if status != ThreadStatus::Suspended {
        let message =
            engine.new_string_value(&format!("cannot resume {} coroutine", status.as_str()));
        return values(vec![Value::Bool(false), message]);
    }

    let (exec, body) = {
        let object = engine.heap.thread_mut(thread);
        object.status = ThreadStatus::Running;
        (
            object.exec.take().expect("suspended coroutine without state"),
            object.body.expect("coroutine without body"),
        )
    };
    let first_resume = exec.frames.is_empty();
    engine.exec_states.push(exec);

    let run_result = (|| {
        if first_resume {
            let func_index = engine.exec().top();
            {
                let exec = engine.exec_mut();
                exec.stack.push(Value::Function(body));
                exec.stack.extend(args.iter().copied());
            }
            engine.push_lua_frame(
                body,
                func_index,
                -1,
                crate::vm::frame::FrameFlags::LUA | crate::vm::frame::FrameFlags::ENTRY,
            )?;
        } else {
            engine.deliver_resume_values(args);
        }
        engine.run_frames(0)
    })();

    let exec = engine
        .exec_states
        .pop()
        .expect("coroutine execution state missing");

    match run_result {
        Ok(crate::vm::interpreter::RunOutcome::Return(mut results)) => {
            let object = engine.heap.thread_mut(thread);
            object.status = ThreadStatus::Dead;
            object.exec = None;
            results.insert(0, Value::Bool(true));
            values(results)
        }
        Ok(crate::vm::interpreter::RunOutcome::Yield(mut yielded)) => {
            let object = engine.heap.thread_mut(thread);
            object.status = ThreadStatus::Suspended;
            object.exec = Some(exec);
            yielded.insert(0, Value::Bool(true));
            values(yielded)
        }
        Err(error) if error.is_catchable() => {
            let object = engine.heap.thread_mut(thread);
            object.status = ThreadStatus::Dead;
            object.exec = None;
            let payload = engine.error_to_value(&error);
            engine.in_flight_error = None;
            values(vec![Value::Bool(false), payload])
        }
        Err(error) => Err(error),
    }
}

fn nat_coroutine_yield(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    if engine.exec_states.len() < 2 {
        return Err(RuntimeErrorKind::YieldFromOutsideCoroutine.into());
    }
    Ok(NativeReturn::Yield(call.args))
}

fn nat_coroutine_status(engine: &mut Engine, call: NativeCall) -> Result<NativeReturn, EngineError> {
    let thread = match call.arg(0) {
        Value::Thread(r) => r,
        other => return Err(bad_argument("coroutine.status", 1, "coroutine", other)),
    };
    let object = engine.heap.thread(thread);
    let current_id = engine.exec_states.last().map(|e| e.id);
    let name = match object.status {
        ThreadStatus::Running if current_id != Some(object.exec_id) => "normal",
        other => other.as_str(),
    };
    values(vec![engine.new_string_value(name)])
}

fn nat_coroutine_isyieldable(
    engine: &mut Engine,
    _call: NativeCall,
) -> Result<NativeReturn, EngineError> {
    values(vec![Value::Bool(engine.exec_states.len() >= 2)])
}
