//! Structural bytecode validation.
//!
//! Every prototype passes through here between loading and execution, so
//! the interpreter never has to re-check operand ranges on the hot path.

use crate::errors::VerifyError;
use crate::vm::opcode::{is_constant, rk_index, OpArg, OpCode, Instruction};
use crate::vm::prototype::Prototype;

/// Registers addressable by one frame. Bytecode claiming more is refused.
pub const MAX_STACK: usize = 250;

/// Validates a prototype tree before first execution.
pub fn verify_prototype(proto: &Prototype) -> Result<(), VerifyError> {
    verify_one(proto, None)?;
    Ok(())
}

fn verify_one(proto: &Prototype, parent: Option<&Prototype>) -> Result<(), VerifyError> {
    let max_stack = proto.max_stack_size as usize;
    if max_stack < 2 || max_stack > MAX_STACK {
        return Err(VerifyError::BadStackSize(max_stack));
    }
    if proto.num_params as usize > max_stack {
        return Err(VerifyError::TooManyParams(proto.num_params as usize));
    }
    if proto.code.is_empty() || !ends_with_return(&proto.code) {
        return Err(VerifyError::TruncatedCode);
    }

    verify_upvalue_descriptors(proto, parent)?;

    for (pc, instr) in proto.code.iter().enumerate() {
        verify_instruction(proto, pc, *instr, max_stack)?;
    }

    for nested in &proto.protos {
        verify_one(nested, Some(proto))?;
    }
    Ok(())
}

fn ends_with_return(code: &[Instruction]) -> bool {
    matches!(code.last().and_then(Instruction::opcode), Some(OpCode::Return))
}

/// Rule 5: each upvalue source must resolve. A stack source indexes the
/// enclosing frame's registers; a chained source indexes the enclosing
/// closure's upvalue list. The root prototype may capture at most the
/// environment.
fn verify_upvalue_descriptors(
    proto: &Prototype,
    parent: Option<&Prototype>,
) -> Result<(), VerifyError> {
    match parent {
        None => {
            if proto.upvalues.len() > 1 {
                return Err(VerifyError::BadUpvalueDescriptor { index: 1 });
            }
        }
        Some(parent) => {
            for (index, descriptor) in proto.upvalues.iter().enumerate() {
                let in_range = if descriptor.in_stack {
                    (descriptor.index as usize) < parent.max_stack_size as usize
                } else {
                    (descriptor.index as usize) < parent.upvalues.len()
                };
                if !in_range {
                    return Err(VerifyError::BadUpvalueDescriptor { index });
                }
            }
        }
    }
    Ok(())
}

fn verify_instruction(
    proto: &Prototype,
    pc: usize,
    instr: Instruction,
    max_stack: usize,
) -> Result<(), VerifyError> {
    let op = instr
        .opcode()
        .ok_or(VerifyError::UnknownOpcode {
            pc,
            opcode: instr.raw_opcode(),
        })?;
    let info = op.info();
    let (a, b, c) = (instr.a() as usize, instr.b() as usize, instr.c() as usize);

    let check_register = |register: usize| {
        if register < max_stack {
            Ok(())
        } else {
            Err(VerifyError::RegisterOutOfRange { pc, register })
        }
    };
    let check_constant = |index: usize| {
        if index < proto.constants.len() {
            Ok(())
        } else {
            Err(VerifyError::ConstantIndexOutOfRange { pc, index })
        }
    };
    let check_rk = |operand: u32| {
        if is_constant(operand) {
            check_constant(rk_index(operand))
        } else {
            check_register(operand as usize)
        }
    };
    let check_jump = |offset: i32| {
        let target = pc as isize + 1 + offset as isize;
        if target >= 0 && (target as usize) < proto.code.len() {
            Ok(())
        } else {
            Err(VerifyError::JumpOutOfRange { pc, target })
        }
    };
    let check_upvalue = |index: usize| {
        if index < proto.upvalues.len() {
            Ok(())
        } else {
            Err(VerifyError::UpvalueIndexOutOfRange { pc, index })
        }
    };
    let next_is = |expected: OpCode| {
        match proto.code.get(pc + 1).and_then(Instruction::opcode) {
            Some(op) if op == expected => Ok(()),
            _ => Err(if expected == OpCode::ExtraArg {
                VerifyError::MissingExtraArg { pc }
            } else {
                VerifyError::MissingFollowupJump { pc }
            }),
        }
    };

    if info.sets_a {
        check_register(a)?;
    }
    match info.b_arg {
        OpArg::Register => check_register(b)?,
        OpArg::ConstantOrRegister => check_rk(instr.b())?,
        OpArg::NotUsed | OpArg::Used => {}
    }
    match info.c_arg {
        OpArg::Register => check_register(c)?,
        OpArg::ConstantOrRegister => check_rk(instr.c())?,
        OpArg::NotUsed | OpArg::Used => {}
    }
    if info.test {
        next_is(OpCode::Jmp)?;
    }

    match op {
        OpCode::LoadK => check_constant(instr.bx() as usize)?,
        OpCode::LoadKx => {
            next_is(OpCode::ExtraArg)?;
            check_constant(proto.code[pc + 1].ax() as usize)?;
        }
        OpCode::LoadBool => {
            if c != 0 && pc + 2 >= proto.code.len() {
                return Err(VerifyError::JumpOutOfRange {
                    pc,
                    target: (pc + 2) as isize,
                });
            }
        }
        OpCode::LoadNil => check_register(a + b)?,
        OpCode::GetUpval | OpCode::SetUpval => check_upvalue(b)?,
        OpCode::GetTabUp => check_upvalue(b)?,
        OpCode::SetTabUp => check_upvalue(a)?,
        OpCode::Jmp => {
            check_jump(instr.sbx())?;
            if a > 0 {
                check_register(a - 1)?;
            }
        }
        OpCode::ForLoop | OpCode::ForPrep => {
            check_jump(instr.sbx())?;
            check_register(a + 3)?;
        }
        OpCode::TForLoop => {
            check_jump(instr.sbx())?;
            check_register(a + 1)?;
        }
        OpCode::TForCall => {
            if c < 1 {
                return Err(VerifyError::OperandOutOfRange { pc, operand: "C" });
            }
            check_register(a + 2 + c)?;
            next_is(OpCode::TForLoop)?;
        }
        OpCode::Call => {
            if b > 0 {
                check_register(a + b - 1)?;
            }
            if c > 1 {
                check_register(a + c - 2)?;
            }
        }
        OpCode::TailCall => {
            if b > 0 {
                check_register(a + b - 1)?;
            }
            if c != 0 {
                return Err(VerifyError::OperandOutOfRange { pc, operand: "C" });
            }
        }
        OpCode::Return => {
            if b > 1 {
                check_register(a + b - 2)?;
            }
        }
        OpCode::SetList => {
            if b > 0 {
                check_register(a + b)?;
            }
            if c == 0 {
                next_is(OpCode::ExtraArg)?;
            }
        }
        OpCode::Closure => {
            let index = instr.bx() as usize;
            if index >= proto.protos.len() {
                return Err(VerifyError::PrototypeIndexOutOfRange { pc, index });
            }
        }
        OpCode::Vararg => {
            if !proto.is_vararg {
                return Err(VerifyError::VarargInNonVarargFunction { pc });
            }
            if b > 1 {
                check_register(a + b - 2)?;
            }
        }
        _ => {}
    }
    Ok(())
}
