//! The register-based dispatch loop.
//!
//! Bytecode-to-bytecode calls never recurse in Rust: `CALL` pushes a
//! frame and the loop continues, `TAILCALL` replaces the current frame,
//! `RETURN` pops. Rust-level recursion happens only when a native needs
//! results from contract code (`call_value`), which is bounded together
//! with the frame chain by the call-depth limit.

use crate::engine::Engine;
use crate::types::*;
use crate::value::{FunctionKind, FunctionObject, NativeCall, NativeReturn, Upvalue};
use crate::vm::arith::ArithOp;
use crate::vm::frame::{CallFrame, FrameFlags};
use crate::vm::metamethods::Metamethod;
use crate::vm::opcode::{fb_to_int, is_constant, rk_index, Instruction, OpCode, FIELDS_PER_FLUSH};
use crate::vm::prototype::{Constant, Prototype};

/// How a `run_frames` entry finished.
pub enum RunOutcome {
    Return(Vec<Value>),
    Yield(Vec<Value>),
}

enum StepOutcome {
    Continue,
    Return(Vec<Value>),
    Yield(Vec<Value>),
}

/// Observable interpreter transitions, for host-installed hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Instruction { pc: usize, line: u32 },
    Call,
    Return,
}

impl<'h> Engine<'h> {
    /// Calls a callable value and waits for its results. A yield arriving
    /// here would have to cross this native boundary, which is refused.
    pub fn call_value(&mut self, func: Value, args: Vec<Value>) -> Result<Vec<Value>, EngineError> {
        match self.call_value_allow_yield(func, args)? {
            RunOutcome::Return(values) => Ok(values),
            RunOutcome::Yield(_) => Err(RuntimeErrorKind::YieldAcrossNativeBoundary.into()),
        }
    }

    /// Like [`Engine::call_value`] but lets a yield escape to the caller;
    /// only `coroutine.resume` wants that.
    pub(crate) fn call_value_allow_yield(
        &mut self,
        func: Value,
        args: Vec<Value>,
    ) -> Result<RunOutcome, EngineError> {
        self.check_call_depth()?;
        self.native_depth += 1;
        let result = self.call_value_inner(func, args);
        self.native_depth -= 1;
        result
    }

    fn call_value_inner(
        &mut self,
        func: Value,
        mut args: Vec<Value>,
    ) -> Result<RunOutcome, EngineError> {
        let func_ref = self.resolve_callable(func, &mut args)?;
        match &self.heap.function(func_ref).kind {
            FunctionKind::Native(_) => {
                let outcome = self.invoke_native(func_ref, args)?;
                Ok(match outcome {
                    NativeReturn::Values(values) => RunOutcome::Return(values),
                    NativeReturn::Yield(values) => RunOutcome::Yield(values),
                })
            }
            FunctionKind::Lua(_) => {
                if self.exec_states.is_empty() {
                    self.push_exec_state();
                }
                let func_index = self.exec().top();
                let floor = self.exec().frames.len();
                {
                    let exec = self.exec_mut();
                    exec.stack.push(Value::Function(func_ref));
                    exec.stack.extend(args);
                }
                self.push_lua_frame(func_ref, func_index, -1, FrameFlags::LUA | FrameFlags::ENTRY)?;
                match self.run_frames(floor) {
                    Ok(outcome) => Ok(outcome),
                    Err(error) => {
                        self.unwind_to(floor, func_index);
                        Err(error)
                    }
                }
            }
        }
    }

    /// Resolves a value to a function, following the `__call` chain and
    /// accumulating implicit self arguments.
    fn resolve_callable(
        &mut self,
        mut func: Value,
        args: &mut Vec<Value>,
    ) -> Result<crate::value::FunctionRef, EngineError> {
        for _ in 0..crate::vm::metamethods::MAX_META_CHAIN {
            match func {
                Value::Function(r) => return Ok(r),
                other => match self.metamethod(other, Metamethod::Call) {
                    Some(handler) => {
                        args.insert(0, other);
                        func = handler;
                    }
                    None => {
                        return Err(RuntimeErrorKind::NotCallable {
                            type_name: other.type_name(),
                        }
                        .into())
                    }
                },
            }
        }
        Err(RuntimeErrorKind::MetamethodChainTooLong { event: "__call" }.into())
    }

    fn invoke_native(
        &mut self,
        func_ref: crate::value::FunctionRef,
        args: Vec<Value>,
    ) -> Result<NativeReturn, EngineError> {
        self.limits.check_stop()?;
        let (func, captures) = match &self.heap.function(func_ref).kind {
            FunctionKind::Native(native) => (native.func, native.captures.clone()),
            FunctionKind::Lua(_) => unreachable!("invoke_native on bytecode closure"),
        };
        func(self, NativeCall { args, captures })
    }

    fn check_call_depth(&self) -> Result<(), EngineError> {
        let frames: usize = self.exec_states.iter().map(|e| e.frames.len()).sum();
        if frames + self.native_depth >= self.options.max_call_depth {
            return Err(StackOverflowError::CallDepthLimitExceeded(self.options.max_call_depth).into());
        }
        Ok(())
    }

    fn check_stack_growth(&self, needed: usize) -> Result<(), EngineError> {
        if needed > self.options.max_value_stack {
            return Err(StackOverflowError::ValueStackLimitExceeded(self.options.max_value_stack).into());
        }
        Ok(())
    }

    /// Builds the frame for a bytecode call whose function value sits at
    /// `func_index` with its arguments above it.
    pub(crate) fn push_lua_frame(
        &mut self,
        func_ref: crate::value::FunctionRef,
        func_index: usize,
        expected_results: i32,
        flags: FrameFlags,
    ) -> Result<(), EngineError> {
        self.check_call_depth()?;
        let proto = self
            .heap
            .function(func_ref)
            .as_lua()
            .expect("lua frame for native closure")
            .proto
            .clone();
        let exec = self.exec_mut();
        let actual_args = exec.top() - func_index - 1;

        let base = if proto.is_vararg {
            // move the fixed parameters above the varargs; the extras stay
            // between the function slot and the new base
            let base = exec.top();
            for i in 0..proto.num_params as usize {
                let value = if i < actual_args {
                    let v = exec.stack[func_index + 1 + i];
                    exec.stack[func_index + 1 + i] = Value::Nil;
                    v
                } else {
                    Value::Nil
                };
                exec.stack.push(value);
            }
            base
        } else {
            func_index + 1
        };

        let needed = base + proto.max_stack_size as usize;
        self.check_stack_growth(needed)?;
        let exec = self.exec_mut();
        exec.stack.resize(needed, Value::Nil);
        exec.frames.push(CallFrame {
            func: func_ref,
            func_index,
            base,
            pc: 0,
            expected_results,
            flags,
        });
        self.fire_hook(HookEvent::Call);
        Ok(())
    }

    /// Error unwind of the current execution state down to `floor` frames:
    /// closes intervening upvalues, drops the frames, truncates the stack.
    pub(crate) fn unwind_to(&mut self, floor: usize, stack_floor: usize) {
        self.close_upvalues(stack_floor);
        let exec = self.exec_mut();
        exec.frames.truncate(floor);
        exec.truncate(stack_floor);
    }

    // ----- upvalues -----

    /// One open cell per stack slot: reuse an existing cell or mint one.
    fn find_or_create_upvalue(&mut self, index: usize) -> UpvalueRef {
        let exec_id = self.exec().id;
        if let Some((_, r)) = self
            .exec()
            .open_upvalues
            .iter()
            .find(|(slot, _)| *slot == index)
        {
            return *r;
        }
        let cell = self.heap.new_upvalue(Upvalue::Open { exec_id, index });
        let exec = self.exec_mut();
        exec.open_upvalues.push((index, cell));
        exec.open_upvalues.sort_by_key(|(slot, _)| *slot);
        cell
    }

    /// Closes every open upvalue at or above `from` in the current
    /// execution state.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let to_close: Vec<(usize, UpvalueRef)> = {
            let exec = self.exec_mut();
            let mut kept = Vec::with_capacity(exec.open_upvalues.len());
            let mut closing = Vec::new();
            for entry in exec.open_upvalues.drain(..) {
                if entry.0 >= from {
                    closing.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            exec.open_upvalues = kept;
            closing
        };
        for (slot, cell) in to_close {
            let value = self.exec().get(slot);
            *self.heap.upvalue_mut(cell) = Upvalue::Closed(value);
        }
    }

    pub(crate) fn read_upvalue(&self, cell: UpvalueRef) -> Value {
        match *self.heap.upvalue(cell) {
            Upvalue::Closed(value) => value,
            Upvalue::Open { exec_id, index } => self
                .find_exec_stack_slot(exec_id, index)
                .unwrap_or(Value::Nil),
        }
    }

    pub(crate) fn write_upvalue(&mut self, cell: UpvalueRef, value: Value) {
        match *self.heap.upvalue(cell) {
            Upvalue::Closed(_) => {
                *self.heap.upvalue_mut(cell) = Upvalue::Closed(value);
            }
            Upvalue::Open { exec_id, index } => {
                for exec in self.exec_states.iter_mut().rev() {
                    if exec.id == exec_id {
                        exec.set(index, value);
                        return;
                    }
                }
                // the home state is a suspended coroutine
                for r in self.heap.live_threads() {
                    if let Some(exec) = self.heap.thread_mut(r).exec.as_mut() {
                        if exec.id == exec_id {
                            exec.set(index, value);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn find_exec_stack_slot(&self, exec_id: u64, index: usize) -> Option<Value> {
        for exec in self.exec_states.iter().rev() {
            if exec.id == exec_id {
                return Some(exec.get(index));
            }
        }
        for r in self.heap.live_threads() {
            if let Some(exec) = self.heap.thread(r).exec.as_ref() {
                if exec.id == exec_id {
                    return Some(exec.get(index));
                }
            }
        }
        None
    }

    // ----- the loop -----

    pub(crate) fn run_frames(&mut self, floor: usize) -> Result<RunOutcome, EngineError> {
        loop {
            match self.step(floor)? {
                StepOutcome::Continue => {}
                StepOutcome::Return(values) => return Ok(RunOutcome::Return(values)),
                StepOutcome::Yield(values) => return Ok(RunOutcome::Yield(values)),
            }
        }
    }

    fn constant_value(&mut self, constant: &Constant) -> Value {
        match constant {
            Constant::Nil => Value::Nil,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Integer(i) => Value::Integer(*i),
            Constant::Number(n) => Value::Number(*n),
            Constant::String(bytes) => Value::String(self.heap.intern(bytes)),
        }
    }

    fn rk(&mut self, proto: &Prototype, base: usize, operand: u32) -> Value {
        if is_constant(operand) {
            self.constant_value(&proto.constants[rk_index(operand)])
        } else {
            self.exec().get(base + operand as usize)
        }
    }

    fn reg(&self, base: usize, index: u32) -> Value {
        self.exec().get(base + index as usize)
    }

    fn set_reg(&mut self, base: usize, index: u32, value: Value) {
        self.exec_mut().set(base + index as usize, value);
    }

    fn fire_hook(&mut self, event: HookEvent) {
        if let Some(mut hook) = self.hook.take() {
            hook(self, event);
            if self.hook.is_none() {
                self.hook = Some(hook);
            }
        }
    }

    /// Executes exactly one instruction of the current frame.
    fn step(&mut self, floor: usize) -> Result<StepOutcome, EngineError> {
        self.limits.tick()?;
        self.gc_safepoint();

        let (proto, base, pc) = {
            let frame = self.exec().frames.last().expect("no frame to step");
            let proto = self
                .heap
                .function(frame.func)
                .as_lua()
                .expect("stepping a native frame")
                .proto
                .clone();
            (proto, frame.base, frame.pc)
        };
        let instr = proto.code[pc];
        self.exec_mut().frames.last_mut().unwrap().pc = pc + 1;
        if self.hook.is_some() {
            let line = proto.line_at(pc).unwrap_or(0);
            self.fire_hook(HookEvent::Instruction { pc, line });
        }

        let result = self.dispatch(&proto, base, pc, instr, floor);
        match result {
            Err(EngineError::Runtime(mut error)) => {
                if error.location.is_none() {
                    error.location = Some(SourceLocation {
                        source: proto.source.clone(),
                        line: proto.line_at(pc).unwrap_or(0),
                    });
                }
                Err(EngineError::Runtime(error))
            }
            other => other,
        }
    }

    fn dispatch(
        &mut self,
        proto: &Prototype,
        base: usize,
        pc: usize,
        instr: Instruction,
        floor: usize,
    ) -> Result<StepOutcome, EngineError> {
        let op = instr.opcode().expect("verified opcode");
        let a = instr.a();
        match op {
            OpCode::Move => {
                let value = self.reg(base, instr.b());
                self.set_reg(base, a, value);
            }
            OpCode::LoadK => {
                let value = self.constant_value(&proto.constants[instr.bx() as usize]);
                self.set_reg(base, a, value);
            }
            OpCode::LoadKx => {
                let extra = proto.code[pc + 1];
                let value = self.constant_value(&proto.constants[extra.ax() as usize]);
                self.set_reg(base, a, value);
                self.exec_mut().frames.last_mut().unwrap().pc = pc + 2;
            }
            OpCode::LoadBool => {
                self.set_reg(base, a, Value::Bool(instr.b() != 0));
                if instr.c() != 0 {
                    self.exec_mut().frames.last_mut().unwrap().pc = pc + 2;
                }
            }
            OpCode::LoadNil => {
                for i in 0..=instr.b() {
                    self.set_reg(base, a + i, Value::Nil);
                }
            }
            OpCode::GetUpval => {
                let cell = self.current_upvalue(instr.b())?;
                let value = self.read_upvalue(cell);
                self.set_reg(base, a, value);
            }
            OpCode::SetUpval => {
                let cell = self.current_upvalue(instr.b())?;
                let value = self.reg(base, a);
                self.write_upvalue(cell, value);
            }
            OpCode::GetTabUp => {
                let cell = self.current_upvalue(instr.b())?;
                let table = self.read_upvalue(cell);
                let key = self.rk(proto, base, instr.c());
                let value = self.table_get(table, key)?;
                self.set_reg(base, a, value);
            }
            OpCode::SetTabUp => {
                let cell = self.current_upvalue(a)?;
                let table = self.read_upvalue(cell);
                let key = self.rk(proto, base, instr.b());
                let value = self.rk(proto, base, instr.c());
                self.table_set(table, key, value)?;
            }
            OpCode::GetTable => {
                let table = self.reg(base, instr.b());
                let key = self.rk(proto, base, instr.c());
                let value = self.table_get(table, key)?;
                self.set_reg(base, a, value);
            }
            OpCode::SetTable => {
                let table = self.reg(base, a);
                let key = self.rk(proto, base, instr.b());
                let value = self.rk(proto, base, instr.c());
                self.table_set(table, key, value)?;
            }
            OpCode::NewTable => {
                let array = fb_to_int(instr.b()) as usize;
                let hash = fb_to_int(instr.c()) as usize;
                let table = self.heap.new_table_with_capacity(array, hash);
                self.set_reg(base, a, Value::Table(table));
            }
            OpCode::SelfOp => {
                let receiver = self.reg(base, instr.b());
                self.set_reg(base, a + 1, receiver);
                let key = self.rk(proto, base, instr.c());
                let method = self.table_get(receiver, key)?;
                self.set_reg(base, a, method);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Mod | OpCode::Pow | OpCode::Div
            | OpCode::IDiv | OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl
            | OpCode::Shr => {
                let lhs = self.rk(proto, base, instr.b());
                let rhs = self.rk(proto, base, instr.c());
                let value = self.arith(Self::arith_op_of(op), lhs, rhs)?;
                self.set_reg(base, a, value);
            }
            OpCode::Unm | OpCode::BNot => {
                let operand = self.reg(base, instr.b());
                let value = self.arith(Self::arith_op_of(op), operand, operand)?;
                self.set_reg(base, a, value);
            }
            OpCode::Not => {
                let operand = self.reg(base, instr.b());
                self.set_reg(base, a, Value::Bool(!operand.truthy()));
            }
            OpCode::Len => {
                let operand = self.reg(base, instr.b());
                let value = self.length_of(operand)?;
                self.set_reg(base, a, value);
            }
            OpCode::Concat => {
                let (b, c) = (instr.b(), instr.c());
                let mut result = self.reg(base, c);
                for i in (b..c).rev() {
                    let lhs = self.reg(base, i);
                    result = self.concat_pair(lhs, result)?;
                }
                self.set_reg(base, a, result);
            }
            OpCode::Jmp => {
                self.do_jump(base, instr, pc);
            }
            OpCode::Eq => {
                let lhs = self.rk(proto, base, instr.b());
                let rhs = self.rk(proto, base, instr.c());
                let cond = self.values_equal(lhs, rhs)?;
                self.conditional_jump(proto, base, pc, cond == (a != 0))?;
            }
            OpCode::Lt => {
                let lhs = self.rk(proto, base, instr.b());
                let rhs = self.rk(proto, base, instr.c());
                let cond = self.less_than(lhs, rhs)?;
                self.conditional_jump(proto, base, pc, cond == (a != 0))?;
            }
            OpCode::Le => {
                let lhs = self.rk(proto, base, instr.b());
                let rhs = self.rk(proto, base, instr.c());
                let cond = self.less_equal(lhs, rhs)?;
                self.conditional_jump(proto, base, pc, cond == (a != 0))?;
            }
            OpCode::Test => {
                let cond = self.reg(base, a).truthy();
                self.conditional_jump(proto, base, pc, cond == (instr.c() != 0))?;
            }
            OpCode::TestSet => {
                let value = self.reg(base, instr.b());
                if value.truthy() == (instr.c() != 0) {
                    self.set_reg(base, a, value);
                    self.conditional_jump(proto, base, pc, true)?;
                } else {
                    self.exec_mut().frames.last_mut().unwrap().pc = pc + 2;
                }
            }
            OpCode::Call => {
                return self.do_call(base, instr, floor);
            }
            OpCode::TailCall => {
                return self.do_tailcall(base, instr, floor);
            }
            OpCode::Return => {
                return self.do_return(base, instr, floor);
            }
            OpCode::ForPrep => {
                self.do_forprep(base, instr, pc)?;
            }
            OpCode::ForLoop => {
                self.do_forloop(base, instr, pc)?;
            }
            OpCode::TForCall => {
                let iterator = self.reg(base, a);
                let state = self.reg(base, a + 1);
                let control = self.reg(base, a + 2);
                let results = self.call_value(iterator, vec![state, control])?;
                for i in 0..instr.c() {
                    let value = results.get(i as usize).copied().unwrap_or(Value::Nil);
                    self.set_reg(base, a + 3 + i, value);
                }
            }
            OpCode::TForLoop => {
                let control = self.reg(base, a + 1);
                if !control.is_nil() {
                    self.set_reg(base, a, control);
                    let frame = self.exec_mut().frames.last_mut().unwrap();
                    frame.pc = (pc as isize + 1 + instr.sbx() as isize) as usize;
                }
            }
            OpCode::SetList => {
                self.do_setlist(base, instr, pc, proto)?;
            }
            OpCode::Closure => {
                let nested = proto.protos[instr.bx() as usize].clone();
                let closure = self.instantiate_closure(base, nested)?;
                self.set_reg(base, a, closure);
            }
            OpCode::Vararg => {
                self.do_vararg(base, instr)?;
            }
            OpCode::ExtraArg => {
                // consumed by the preceding instruction; stray ones are inert
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn arith_op_of(op: OpCode) -> ArithOp {
        match op {
            OpCode::Add => ArithOp::Add,
            OpCode::Sub => ArithOp::Sub,
            OpCode::Mul => ArithOp::Mul,
            OpCode::Mod => ArithOp::Mod,
            OpCode::Pow => ArithOp::Pow,
            OpCode::Div => ArithOp::Div,
            OpCode::IDiv => ArithOp::IDiv,
            OpCode::BAnd => ArithOp::BAnd,
            OpCode::BOr => ArithOp::BOr,
            OpCode::BXor => ArithOp::BXor,
            OpCode::Shl => ArithOp::Shl,
            OpCode::Shr => ArithOp::Shr,
            OpCode::Unm => ArithOp::Unm,
            OpCode::BNot => ArithOp::BNot,
            _ => unreachable!("not an arithmetic opcode"),
        }
    }

    fn current_upvalue(&self, index: u32) -> Result<UpvalueRef, EngineError> {
        let frame = self.exec().frames.last().expect("no current frame");
        let closure = self
            .heap
            .function(frame.func)
            .as_lua()
            .expect("upvalue access in native frame");
        Ok(closure.upvalues[index as usize])
    }

    /// An unconditional jump; a non-zero A closes upvalues from R(A-1).
    fn do_jump(&mut self, base: usize, instr: Instruction, pc: usize) {
        if instr.a() > 0 {
            self.close_upvalues(base + instr.a() as usize - 1);
        }
        let frame = self.exec_mut().frames.last_mut().unwrap();
        frame.pc = (pc as isize + 1 + instr.sbx() as isize) as usize;
    }

    /// Test instructions: on success execute the following `JMP`, on
    /// failure skip it.
    fn conditional_jump(
        &mut self,
        proto: &Prototype,
        base: usize,
        pc: usize,
        take: bool,
    ) -> Result<(), EngineError> {
        if take {
            let jump = proto.code[pc + 1];
            debug_assert_eq!(jump.opcode(), Some(OpCode::Jmp));
            self.exec_mut().frames.last_mut().unwrap().pc = pc + 1;
            self.do_jump(base, jump, pc + 1);
        } else {
            self.exec_mut().frames.last_mut().unwrap().pc = pc + 2;
        }
        Ok(())
    }

    fn instantiate_closure(
        &mut self,
        base: usize,
        proto: std::sync::Arc<Prototype>,
    ) -> Result<Value, EngineError> {
        let parent_upvalues = {
            let frame = self.exec().frames.last().unwrap();
            self.heap
                .function(frame.func)
                .as_lua()
                .expect("closure in native frame")
                .upvalues
                .clone()
        };
        let mut upvalues = Vec::with_capacity(proto.upvalues.len());
        for descriptor in &proto.upvalues {
            let cell = if descriptor.in_stack {
                self.find_or_create_upvalue(base + descriptor.index as usize)
            } else {
                parent_upvalues[descriptor.index as usize]
            };
            upvalues.push(cell);
        }
        let func = self.heap.new_function(FunctionObject::lua(proto, upvalues));
        Ok(Value::Function(func))
    }

    // ----- calls -----

    fn do_call(
        &mut self,
        base: usize,
        instr: Instruction,
        _floor: usize,
    ) -> Result<StepOutcome, EngineError> {
        let a = instr.a();
        let func_index = base + a as usize;
        let nargs = if instr.b() == 0 {
            self.exec().top() - func_index - 1
        } else {
            instr.b() as usize - 1
        };
        let expected = instr.c() as i32 - 1;

        let callee = self.exec().get(func_index);
        let mut args: Vec<Value> = (0..nargs)
            .map(|i| self.exec().get(func_index + 1 + i))
            .collect();
        let func_ref = self.resolve_callable(callee, &mut args)?;

        match &self.heap.function(func_ref).kind {
            FunctionKind::Native(_) => {
                self.exec_mut().truncate(func_index);
                match self.invoke_native(func_ref, args)? {
                    NativeReturn::Values(values) => {
                        self.place_call_results(func_index, values, expected);
                        Ok(StepOutcome::Continue)
                    }
                    NativeReturn::Yield(values) => {
                        self.exec_mut().resume_target = Some((func_index, expected));
                        Ok(StepOutcome::Yield(values))
                    }
                }
            }
            FunctionKind::Lua(_) => {
                {
                    let exec = self.exec_mut();
                    exec.truncate(func_index);
                    exec.stack.push(Value::Function(func_ref));
                    exec.stack.extend(args.iter().copied());
                }
                self.push_lua_frame(func_ref, func_index, expected, FrameFlags::LUA)?;
                Ok(StepOutcome::Continue)
            }
        }
    }

    fn do_tailcall(
        &mut self,
        base: usize,
        instr: Instruction,
        floor: usize,
    ) -> Result<StepOutcome, EngineError> {
        let a = instr.a();
        let func_index = base + a as usize;
        let nargs = if instr.b() == 0 {
            self.exec().top() - func_index - 1
        } else {
            instr.b() as usize - 1
        };

        let callee = self.exec().get(func_index);
        let mut args: Vec<Value> = (0..nargs)
            .map(|i| self.exec().get(func_index + 1 + i))
            .collect();
        let func_ref = self.resolve_callable(callee, &mut args)?;

        match &self.heap.function(func_ref).kind {
            FunctionKind::Native(_) => {
                self.exec_mut().truncate(func_index);
                match self.invoke_native(func_ref, args)? {
                    NativeReturn::Values(values) => self.finish_return(values, floor),
                    NativeReturn::Yield(_) => {
                        Err(RuntimeErrorKind::YieldAcrossNativeBoundary.into())
                    }
                }
            }
            FunctionKind::Lua(_) => {
                // the tail call replaces the running frame: same result
                // slot, same expectations, no frame-chain growth
                let old = self.exec_mut().frames.pop().expect("tailcall without frame");
                self.close_upvalues(old.base);
                {
                    let exec = self.exec_mut();
                    exec.truncate(old.func_index);
                    exec.stack.push(Value::Function(func_ref));
                    exec.stack.extend(args.iter().copied());
                }
                let flags = (old.flags & FrameFlags::ENTRY) | FrameFlags::LUA | FrameFlags::TAILCALL;
                self.push_lua_frame(func_ref, old.func_index, old.expected_results, flags)?;
                Ok(StepOutcome::Continue)
            }
        }
    }

    fn do_return(
        &mut self,
        base: usize,
        instr: Instruction,
        floor: usize,
    ) -> Result<StepOutcome, EngineError> {
        let a = instr.a();
        let count = if instr.b() == 0 {
            self.exec().top() - (base + a as usize)
        } else {
            instr.b() as usize - 1
        };
        let results: Vec<Value> = (0..count)
            .map(|i| self.exec().get(base + a as usize + i))
            .collect();
        self.close_upvalues(base);
        self.fire_hook(HookEvent::Return);
        self.finish_return(results, floor)
    }

    /// Pops the current frame and hands `results` to whoever is waiting:
    /// the Rust caller when this was the entry frame, the calling bytecode
    /// frame otherwise.
    fn finish_return(
        &mut self,
        results: Vec<Value>,
        floor: usize,
    ) -> Result<StepOutcome, EngineError> {
        let frame = self.exec_mut().frames.pop().expect("return without frame");
        self.exec_mut().truncate(frame.func_index);

        if frame.flags.contains(FrameFlags::ENTRY) || self.exec().frames.len() == floor {
            return Ok(StepOutcome::Return(results));
        }
        self.place_call_results(frame.func_index, results, frame.expected_results);
        Ok(StepOutcome::Continue)
    }

    /// Writes call results at `at` and restores the caller's stack top:
    /// exact for multret, padded to the frame window otherwise.
    fn place_call_results(&mut self, at: usize, results: Vec<Value>, expected: i32) {
        let caller_top = {
            let frame = self.exec().frames.last().expect("no caller frame");
            let proto = &self
                .heap
                .function(frame.func)
                .as_lua()
                .expect("caller must be a bytecode frame")
                .proto;
            frame.base + proto.max_stack_size as usize
        };
        let exec = self.exec_mut();
        if expected < 0 {
            exec.truncate(at);
            for value in results {
                exec.stack.push(value);
            }
        } else {
            exec.ensure_size(caller_top.max(at + expected as usize));
            for i in 0..expected as usize {
                let value = results.get(i).copied().unwrap_or(Value::Nil);
                exec.stack[at + i] = value;
            }
            exec.truncate(caller_top);
        }
    }

    /// Seeds resumed values into the slot recorded at yield time.
    pub(crate) fn deliver_resume_values(&mut self, values: Vec<Value>) {
        if let Some((at, expected)) = self.exec_mut().resume_target.take() {
            self.place_call_results(at, values, expected);
        }
    }

    // ----- numeric for -----

    fn for_number(&self, value: Value, what: &'static str) -> Result<Value, RuntimeErrorKind> {
        match value {
            Value::Integer(_) | Value::Number(_) => Ok(value),
            other => Err(RuntimeErrorKind::ForLoopNonNumeric {
                what,
                type_name: other.type_name(),
            }),
        }
    }

    fn do_forprep(
        &mut self,
        base: usize,
        instr: Instruction,
        pc: usize,
    ) -> Result<(), EngineError> {
        let a = instr.a();
        let init = self.for_number(self.reg(base, a), "initial value")?;
        let limit = self.for_number(self.reg(base, a + 1), "limit")?;
        let step = self.for_number(self.reg(base, a + 2), "step")?;

        let all_integer = matches!(
            (init, limit, step),
            (Value::Integer(_), Value::Integer(_), Value::Integer(_))
        );
        if all_integer {
            let (init, step) = match (init, step) {
                (Value::Integer(i), Value::Integer(s)) => (i, s),
                _ => unreachable!(),
            };
            if step == 0 {
                return Err(RuntimeErrorKind::ForLoopZeroStep.into());
            }
            let prepared = init
                .checked_sub(step)
                .ok_or(RuntimeErrorKind::ForLoopInitOutOfRange)?;
            self.set_reg(base, a, Value::Integer(prepared));
        } else {
            let to_dec = |v: Value| match v {
                Value::Integer(i) => Decimal::from_i64(i),
                Value::Number(n) => n,
                _ => unreachable!(),
            };
            let (init, limit, step) = (to_dec(init), to_dec(limit), to_dec(step));
            if step.is_zero() {
                return Err(RuntimeErrorKind::ForLoopZeroStep.into());
            }
            let prepared = init
                .checked_sub(step)
                .ok_or(RuntimeErrorKind::ForLoopInitOutOfRange)?;
            self.set_reg(base, a, Value::Number(prepared));
            self.set_reg(base, a + 1, Value::Number(limit));
            self.set_reg(base, a + 2, Value::Number(step));
        }
        let frame = self.exec_mut().frames.last_mut().unwrap();
        frame.pc = (pc as isize + 1 + instr.sbx() as isize) as usize;
        Ok(())
    }

    /// Integer and number variants share one overflow rule: an index that
    /// can no longer be represented terminates the loop.
    fn do_forloop(
        &mut self,
        base: usize,
        instr: Instruction,
        pc: usize,
    ) -> Result<(), EngineError> {
        let a = instr.a();
        let (next, continues) = match (self.reg(base, a), self.reg(base, a + 1), self.reg(base, a + 2)) {
            (Value::Integer(idx), Value::Integer(limit), Value::Integer(step)) => {
                match idx.checked_add(step) {
                    None => (Value::Nil, false),
                    Some(next) => {
                        let continues = if step > 0 { next <= limit } else { limit <= next };
                        (Value::Integer(next), continues)
                    }
                }
            }
            (Value::Number(idx), Value::Number(limit), Value::Number(step)) => {
                match idx.checked_add(step) {
                    None => (Value::Nil, false),
                    Some(next) => {
                        let continues = if step.is_positive() {
                            next <= limit
                        } else {
                            limit <= next
                        };
                        (Value::Number(next), continues)
                    }
                }
            }
            _ => (Value::Nil, false),
        };
        if continues {
            self.set_reg(base, a, next);
            self.set_reg(base, a + 3, next);
            let frame = self.exec_mut().frames.last_mut().unwrap();
            frame.pc = (pc as isize + 1 + instr.sbx() as isize) as usize;
        }
        Ok(())
    }

    fn do_setlist(
        &mut self,
        base: usize,
        instr: Instruction,
        pc: usize,
        proto: &Prototype,
    ) -> Result<(), EngineError> {
        let a = instr.a();
        let table_index = base + a as usize;
        let count = if instr.b() == 0 {
            self.exec().top() - table_index - 1
        } else {
            instr.b() as usize
        };
        let block = if instr.c() == 0 {
            let extra = proto.code[pc + 1];
            self.exec_mut().frames.last_mut().unwrap().pc = pc + 2;
            extra.ax()
        } else {
            instr.c()
        };
        let table = match self.exec().get(table_index) {
            Value::Table(r) => r,
            other => {
                return Err(RuntimeErrorKind::IndexNonTable {
                    type_name: other.type_name(),
                }
                .into())
            }
        };
        let first = (block as i64 - 1) * FIELDS_PER_FLUSH as i64;
        for i in 1..=count {
            let value = self.exec().get(table_index + i);
            self.heap
                .table_mut(table)
                .raw_set(TableKey::Integer(first + i as i64), value)
                .map_err(EngineError::Policy)?;
        }
        // a multret flush consumed the open stack; restore the frame window
        if instr.b() == 0 {
            let frame_top = {
                let frame = self.exec().frames.last().unwrap();
                frame.base + proto.max_stack_size as usize
            };
            let exec = self.exec_mut();
            exec.truncate(table_index + 1);
            exec.ensure_size(frame_top);
        }
        Ok(())
    }

    fn do_vararg(&mut self, base: usize, instr: Instruction) -> Result<(), EngineError> {
        let a = instr.a();
        let (func_index, num_params, frame_top) = {
            let frame = self.exec().frames.last().unwrap();
            let proto = &self
                .heap
                .function(frame.func)
                .as_lua()
                .expect("vararg in native frame")
                .proto;
            (
                frame.func_index,
                proto.num_params as usize,
                frame.base + proto.max_stack_size as usize,
            )
        };
        let available = base - func_index - 1 - num_params;
        let wanted = instr.b() as i64 - 1;

        if wanted < 0 {
            // all varargs; leaves the stack top open for a consumer
            let values: Vec<Value> = (0..available)
                .map(|i| self.exec().get(func_index + 1 + num_params + i))
                .collect();
            let at = base + a as usize;
            let exec = self.exec_mut();
            exec.truncate(at);
            for value in values {
                exec.stack.push(value);
            }
        } else {
            for i in 0..wanted as usize {
                let value = if i < available {
                    self.exec().get(func_index + 1 + num_params + i)
                } else {
                    Value::Nil
                };
                self.set_reg(base, a + i as u32, value);
            }
            self.exec_mut().ensure_size(frame_top);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::host::InMemoryHost;
    use crate::vm::opcode::{rk_constant as k, rk_register as r, Instruction as I, OpCode as Op};
    use crate::vm::prototype::{Constant, UpvalueDescriptor};
    use std::sync::Arc;

    fn proto(
        num_params: u8,
        is_vararg: bool,
        max_stack: u8,
        code: Vec<Instruction>,
        constants: Vec<Constant>,
    ) -> Prototype {
        Prototype {
            source: "@test".to_owned(),
            line_defined: 0,
            last_line_defined: 0,
            num_params,
            is_vararg,
            max_stack_size: max_stack,
            code,
            constants,
            upvalues: vec![],
            protos: vec![],
            line_info: vec![],
            local_vars: vec![],
        }
    }

    fn closure_of(engine: &mut Engine, proto: Prototype) -> Value {
        let f = engine
            .heap
            .new_function(FunctionObject::lua(Arc::new(proto), vec![]));
        Value::Function(f)
    }

    fn run(
        engine: &mut Engine,
        proto: Prototype,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, EngineError> {
        let f = closure_of(engine, proto);
        engine.call_value(f, args)
    }

    fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> R {
        let host = InMemoryHost::new();
        let mut engine = Engine::new(&host, EngineOptions::default());
        f(&mut engine)
    }

    #[test]
    fn test_constant_arithmetic() {
        with_engine(|engine| {
            let p = proto(
                0,
                false,
                3,
                vec![
                    I::abx(Op::LoadK, 0, 0),
                    I::abx(Op::LoadK, 1, 1),
                    I::abc(Op::Add, 2, r(0), r(1)),
                    I::abc(Op::Return, 2, 2, 0),
                ],
                vec![Constant::Integer(2), Constant::Integer(3)],
            );
            assert_eq!(run(engine, p, vec![]).unwrap(), vec![Value::Integer(5)]);
        });
    }

    #[test]
    fn test_integer_overflow_traps() {
        with_engine(|engine| {
            let p = proto(
                0,
                false,
                3,
                vec![
                    I::abx(Op::LoadK, 0, 0),
                    I::abc(Op::Add, 1, r(0), k(1)),
                    I::abc(Op::Return, 1, 2, 0),
                ],
                vec![Constant::Integer(i64::MAX), Constant::Integer(1)],
            );
            let error = run(engine, p, vec![]).unwrap_err();
            match error {
                EngineError::Runtime(e) => {
                    assert_eq!(e.kind, RuntimeErrorKind::IntegerOverflow);
                    assert!(e.location.is_some());
                }
                other => panic!("expected runtime error, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_mixed_arithmetic_promotes_to_decimal() {
        with_engine(|engine| {
            let p = proto(
                0,
                false,
                3,
                vec![
                    I::abx(Op::LoadK, 0, 0),
                    I::abc(Op::Mul, 1, r(0), k(1)),
                    I::abc(Op::Return, 1, 2, 0),
                ],
                vec![
                    Constant::Number("2.5".parse().unwrap()),
                    Constant::Integer(4),
                ],
            );
            assert_eq!(
                run(engine, p, vec![]).unwrap(),
                vec![Value::Number(Decimal::from_i64(10))]
            );
        });
    }

    #[test]
    fn test_numeric_for_loop_sums() {
        with_engine(|engine| {
            let p = proto(
                0,
                false,
                5,
                vec![
                    I::abx(Op::LoadK, 0, 0),
                    I::abx(Op::LoadK, 1, 1),
                    I::abx(Op::LoadK, 2, 2),
                    I::abx(Op::LoadK, 3, 1),
                    I::asbx(Op::ForPrep, 1, 1),
                    I::abc(Op::Add, 0, r(0), r(4)),
                    I::asbx(Op::ForLoop, 1, -2),
                    I::abc(Op::Return, 0, 2, 0),
                ],
                vec![
                    Constant::Integer(0),
                    Constant::Integer(1),
                    Constant::Integer(10),
                ],
            );
            assert_eq!(run(engine, p, vec![]).unwrap(), vec![Value::Integer(55)]);
        });
    }

    #[test]
    fn test_for_loop_zero_step_raises() {
        with_engine(|engine| {
            let p = proto(
                0,
                false,
                5,
                vec![
                    I::abx(Op::LoadK, 0, 0),
                    I::abx(Op::LoadK, 1, 1),
                    I::abx(Op::LoadK, 2, 1),
                    I::abx(Op::LoadK, 3, 0),
                    I::asbx(Op::ForPrep, 1, 1),
                    I::abc(Op::Add, 0, r(0), r(4)),
                    I::asbx(Op::ForLoop, 1, -2),
                    I::abc(Op::Return, 0, 2, 0),
                ],
                vec![Constant::Integer(0), Constant::Integer(1)],
            );
            let error = run(engine, p, vec![]).unwrap_err();
            assert!(matches!(
                error,
                EngineError::Runtime(e) if e.kind == RuntimeErrorKind::ForLoopZeroStep
            ));
        });
    }

    #[test]
    fn test_closures_share_one_upvalue_cell() {
        with_engine(|engine| {
            let inc = Prototype {
                upvalues: vec![UpvalueDescriptor {
                    name: "c".to_owned(),
                    in_stack: true,
                    index: 0,
                }],
                ..proto(
                    0,
                    false,
                    2,
                    vec![
                        I::abc(Op::GetUpval, 0, 0, 0),
                        I::abc(Op::Add, 0, r(0), k(0)),
                        I::abc(Op::SetUpval, 0, 0, 0),
                        I::abc(Op::Return, 0, 2, 0),
                    ],
                    vec![Constant::Integer(1)],
                )
            };
            let get = Prototype {
                upvalues: vec![UpvalueDescriptor {
                    name: "c".to_owned(),
                    in_stack: true,
                    index: 0,
                }],
                ..proto(
                    0,
                    false,
                    2,
                    vec![I::abc(Op::GetUpval, 0, 0, 0), I::abc(Op::Return, 0, 2, 0)],
                    vec![],
                )
            };
            let outer = Prototype {
                protos: vec![Arc::new(inc), Arc::new(get)],
                ..proto(
                    0,
                    false,
                    3,
                    vec![
                        I::abx(Op::LoadK, 0, 0),
                        I::abx(Op::Closure, 1, 0),
                        I::abx(Op::Closure, 2, 1),
                        I::abc(Op::Return, 1, 3, 0),
                    ],
                    vec![Constant::Integer(0)],
                )
            };
            let results = run(engine, outer, vec![]).unwrap();
            let (inc_fn, get_fn) = (results[0], results[1]);
            // both closures captured the same local; the cell closed when
            // the enclosing frame returned, and stays shared
            assert_eq!(engine.call_value(inc_fn, vec![]).unwrap(), vec![Value::Integer(1)]);
            assert_eq!(engine.call_value(inc_fn, vec![]).unwrap(), vec![Value::Integer(2)]);
            assert_eq!(engine.call_value(get_fn, vec![]).unwrap(), vec![Value::Integer(2)]);
        });
    }

    #[test]
    fn test_tail_recursion_runs_in_constant_frames() {
        with_engine(|engine| {
            // f(n, f): if n == 0 then return 42 else return f(n-1, f)
            let p = proto(
                2,
                false,
                6,
                vec![
                    I::abc(Op::Eq, 1, r(0), k(0)),
                    I::asbx(Op::Jmp, 0, 4),
                    I::abc(Op::Move, 2, 1, 0),
                    I::abc(Op::Sub, 3, r(0), k(1)),
                    I::abc(Op::Move, 4, 1, 0),
                    I::abc(Op::TailCall, 2, 3, 0),
                    I::abx(Op::LoadK, 2, 2),
                    I::abc(Op::Return, 2, 2, 0),
                    I::abc(Op::Return, 0, 1, 0),
                ],
                vec![
                    Constant::Integer(0),
                    Constant::Integer(1),
                    Constant::Integer(42),
                ],
            );
            // far deeper than max_call_depth: only O(1) frames may be used
            let depth = engine.options().max_call_depth as i64 * 50;
            let f = closure_of(engine, p);
            let results = engine.call_value(f, vec![Value::Integer(depth), f]).unwrap();
            assert_eq!(results, vec![Value::Integer(42)]);
        });
    }

    #[test]
    fn test_plain_recursion_hits_depth_limit() {
        with_engine(|engine| {
            // f(n, f): if n == 0 then return 42 end; f(n-1, f); return 42
            let p = proto(
                2,
                false,
                6,
                vec![
                    I::abc(Op::Eq, 1, r(0), k(0)),
                    I::asbx(Op::Jmp, 0, 4),
                    I::abc(Op::Move, 2, 1, 0),
                    I::abc(Op::Sub, 3, r(0), k(1)),
                    I::abc(Op::Move, 4, 1, 0),
                    I::abc(Op::Call, 2, 3, 1),
                    I::abx(Op::LoadK, 2, 2),
                    I::abc(Op::Return, 2, 2, 0),
                ],
                vec![
                    Constant::Integer(0),
                    Constant::Integer(1),
                    Constant::Integer(42),
                ],
            );
            let f = closure_of(engine, p);
            let error = engine
                .call_value(f, vec![Value::Integer(100_000), f])
                .unwrap_err();
            assert!(matches!(error, EngineError::StackOverflow(_)));
        });
    }

    #[test]
    fn test_pcall_catches_runtime_errors() {
        with_engine(|engine| {
            let overflow = proto(
                0,
                false,
                3,
                vec![
                    I::abx(Op::LoadK, 0, 0),
                    I::abc(Op::Add, 1, r(0), k(1)),
                    I::abc(Op::Return, 1, 2, 0),
                ],
                vec![Constant::Integer(i64::MAX), Constant::Integer(1)],
            );
            let f = closure_of(engine, overflow);
            let pcall = engine.get_global("pcall");
            let results = engine.call_value(pcall, vec![f]).unwrap();
            assert_eq!(results[0], Value::Bool(false));
            let message = engine.value_to_rust_string(results[1]).unwrap();
            assert!(message.contains("integer overflow"), "got: {}", message);
        });
    }

    #[test]
    fn test_pcall_does_not_catch_interrupts() {
        let host = InMemoryHost::new();
        let mut engine = Engine::new(
            &host,
            EngineOptions {
                instruction_limit: 50,
                ..EngineOptions::default()
            },
        );
        // busy loop wrapped in pcall: the interrupt must pass through
        let looping = proto(
            0,
            false,
            5,
            vec![
                I::abx(Op::LoadK, 0, 0),
                I::abx(Op::LoadK, 1, 1),
                I::abx(Op::LoadK, 2, 2),
                I::abx(Op::LoadK, 3, 2),
                I::asbx(Op::ForPrep, 1, 0),
                I::asbx(Op::ForLoop, 1, -1),
                I::abc(Op::Return, 0, 1, 0),
            ],
            vec![
                Constant::Integer(0),
                Constant::Integer(1),
                Constant::Integer(1_000_000),
            ],
        );
        let f = closure_of(&mut engine, looping);
        let pcall = engine.get_global("pcall");
        let error = engine.call_value(pcall, vec![f]).unwrap_err();
        assert!(matches!(error, EngineError::Interrupted(_)));
    }

    #[test]
    fn test_index_metamethod_chain() {
        with_engine(|engine| {
            let t = engine.heap.new_table();
            let meta = engine.heap.new_table();
            let backing = engine.heap.new_table();
            let x = engine.heap.new_string("x");
            engine
                .heap
                .table_mut(backing)
                .raw_set_unchecked(TableKey::String(x), Value::Integer(7));
            let index_key = engine.heap.new_string("__index");
            engine
                .heap
                .table_mut(meta)
                .raw_set_unchecked(TableKey::String(index_key), Value::Table(backing));
            engine.heap.table_mut(t).set_metatable(Some(meta));

            let p = proto(
                1,
                false,
                3,
                vec![
                    I::abc(Op::GetTable, 1, 0, k(0)),
                    I::abc(Op::Return, 1, 2, 0),
                ],
                vec![Constant::String(b"x".to_vec())],
            );
            assert_eq!(
                run(engine, p, vec![Value::Table(t)]).unwrap(),
                vec![Value::Integer(7)]
            );
        });
    }

    #[test]
    fn test_read_only_table_rejects_bytecode_store() {
        with_engine(|engine| {
            let t = engine.heap.new_table();
            engine.heap.table_mut(t).set_read_only(true);
            let p = proto(
                1,
                false,
                3,
                vec![
                    I::abc(Op::SetTable, 0, k(0), k(1)),
                    I::abc(Op::Return, 0, 1, 0),
                ],
                vec![Constant::String(b"k".to_vec()), Constant::Integer(1)],
            );
            let error = run(engine, p, vec![Value::Table(t)]).unwrap_err();
            assert_eq!(
                error,
                EngineError::Policy(PolicyError::ReadOnlyTableWrite)
            );
        });
    }

    #[test]
    fn test_varargs_forward() {
        with_engine(|engine| {
            let p = proto(
                0,
                true,
                2,
                vec![I::abc(Op::Vararg, 0, 0, 0), I::abc(Op::Return, 0, 0, 0)],
                vec![],
            );
            let args = vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)];
            assert_eq!(run(engine, p, args.clone()).unwrap(), args);
        });
    }

    #[test]
    fn test_concat_folds_with_numbers() {
        with_engine(|engine| {
            let p = proto(
                0,
                false,
                5,
                vec![
                    I::abx(Op::LoadK, 0, 0),
                    I::abx(Op::LoadK, 1, 1),
                    I::abx(Op::LoadK, 2, 2),
                    I::abc(Op::Concat, 3, 0, 2),
                    I::abc(Op::Return, 3, 2, 0),
                ],
                vec![
                    Constant::String(b"a".to_vec()),
                    Constant::Integer(1),
                    Constant::String(b"b".to_vec()),
                ],
            );
            let results = run(engine, p, vec![]).unwrap();
            assert_eq!(engine.value_to_rust_string(results[0]).unwrap(), "a1b");
        });
    }

    #[test]
    fn test_coroutine_yield_and_resume() {
        with_engine(|engine| {
            // body(x): local y = coroutine.yield(x + 1); return y * 2
            let body = Prototype {
                upvalues: vec![UpvalueDescriptor {
                    name: "_ENV".to_owned(),
                    in_stack: true,
                    index: 0,
                }],
                ..proto(
                    1,
                    false,
                    4,
                    vec![
                        I::abc(Op::GetTabUp, 1, 0, k(0)),
                        I::abc(Op::GetTable, 1, 1, k(1)),
                        I::abc(Op::Add, 2, r(0), k(2)),
                        I::abc(Op::Call, 1, 2, 2),
                        I::abc(Op::Mul, 2, r(1), k(3)),
                        I::abc(Op::Return, 2, 2, 0),
                    ],
                    vec![
                        Constant::String(b"coroutine".to_vec()),
                        Constant::String(b"yield".to_vec()),
                        Constant::Integer(1),
                        Constant::Integer(2),
                    ],
                )
            };
            let env = engine
                .heap
                .new_upvalue(Upvalue::Closed(Value::Table(engine.globals())));
            let body_fn = engine
                .heap
                .new_function(FunctionObject::lua(Arc::new(body), vec![env]));

            let coroutine_table = engine.get_global("coroutine");
            let create_key = engine.new_string_value("create");
            let create = engine.table_get(coroutine_table, create_key).unwrap();
            let resume_key = engine.new_string_value("resume");
            let resume = engine.table_get(coroutine_table, resume_key).unwrap();
            let status_key = engine.new_string_value("status");
            let status = engine.table_get(coroutine_table, status_key).unwrap();

            let co = engine
                .call_value(create, vec![Value::Function(body_fn)])
                .unwrap()[0];

            let first = engine.call_value(resume, vec![co, Value::Integer(5)]).unwrap();
            assert_eq!(first, vec![Value::Bool(true), Value::Integer(6)]);

            let second = engine.call_value(resume, vec![co, Value::Integer(10)]).unwrap();
            assert_eq!(second, vec![Value::Bool(true), Value::Integer(20)]);

            let state = engine.call_value(status, vec![co]).unwrap();
            assert_eq!(engine.value_to_rust_string(state[0]).unwrap(), "dead");

            // resuming a dead coroutine reports failure instead of raising
            let third = engine.call_value(resume, vec![co]).unwrap();
            assert_eq!(third[0], Value::Bool(false));
        });
    }

    #[test]
    fn test_gc_pressure_inside_loop() {
        with_engine(|engine| {
            // for i = 1, 5000 do local _ = {} end
            let p = proto(
                0,
                false,
                6,
                vec![
                    I::abx(Op::LoadK, 1, 0),
                    I::abx(Op::LoadK, 2, 1),
                    I::abx(Op::LoadK, 3, 0),
                    I::asbx(Op::ForPrep, 1, 1),
                    I::abc(Op::NewTable, 5, 0, 0),
                    I::asbx(Op::ForLoop, 1, -2),
                    I::abc(Op::Return, 0, 1, 0),
                ],
                vec![Constant::Integer(1), Constant::Integer(5000)],
            );
            run(engine, p, vec![]).unwrap();
            engine.collect_garbage();
            // the five thousand loop-local tables must not survive
            assert!(engine.heap().live_object_count() < 200);
        });
    }

    #[test]
    fn test_generic_for_over_table() {
        with_engine(|engine| {
            // s = 0; for k, v in next, t, nil do s = s + v end; return s
            let t = engine.heap.new_table();
            for i in 1..=4 {
                engine
                    .heap
                    .table_mut(t)
                    .raw_set_unchecked(TableKey::Integer(i), Value::Integer(i * 100));
            }
            let p = Prototype {
                upvalues: vec![UpvalueDescriptor {
                    name: "_ENV".to_owned(),
                    in_stack: true,
                    index: 0,
                }],
                ..proto(
                    1,
                    false,
                    8,
                    vec![
                        I::abx(Op::LoadK, 1, 0),
                        I::abc(Op::GetTabUp, 2, 0, k(1)),
                        I::abc(Op::Move, 3, 0, 0),
                        I::abc(Op::LoadNil, 4, 0, 0),
                        I::asbx(Op::Jmp, 0, 1),
                        I::abc(Op::Add, 1, r(1), r(6)),
                        I::abc(Op::TForCall, 2, 0, 2),
                        I::asbx(Op::TForLoop, 4, -3),
                        I::abc(Op::Return, 1, 2, 0),
                    ],
                    vec![
                        Constant::Integer(0),
                        Constant::String(b"next".to_vec()),
                    ],
                )
            };
            let env = engine
                .heap
                .new_upvalue(Upvalue::Closed(Value::Table(engine.globals())));
            let f = engine
                .heap
                .new_function(FunctionObject::lua(Arc::new(p), vec![env]));
            let results = engine
                .call_value(Value::Function(f), vec![Value::Table(t)])
                .unwrap();
            assert_eq!(results, vec![Value::Integer(1000)]);
        });
    }
}
