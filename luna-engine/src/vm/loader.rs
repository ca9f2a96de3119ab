//! Binary module loader.
//!
//! The wire format is fixed (see the header constants): any change is a
//! breaking protocol change. The loader range-checks every count against
//! the remaining buffer before allocating, verifies the prototype tree,
//! and leaves no state behind on rejection.

use crate::errors::CompileError;
use crate::vm::opcode::Instruction;
use crate::vm::prototype::{Constant, LocalVariable, Prototype, UpvalueDescriptor};
use crate::vm::verify::verify_prototype;
use luna_common::prelude::Decimal;
use std::sync::Arc;

pub const SIGNATURE: &[u8; 5] = b"\x1bLuna";
pub const VERSION: u8 = 0x01;
pub const FORMAT: u8 = 0x00;
/// Canary against text-mode translation and truncation.
pub const CHECK_DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
pub const SIZE_INSTRUCTION: u8 = 4;
pub const SIZE_INTEGER: u8 = 8;
pub const SIZE_NUMBER: u8 = 16;
/// Endianness canary.
pub const CHECK_INT: i64 = 0x5678;
/// Number-format canary: must decode to exactly 370.5.
pub const CHECK_NUMBER_MANTISSA: i128 = 370_5000_0000;

pub const TAG_NIL: u8 = 0;
pub const TAG_BOOL: u8 = 1;
pub const TAG_INTEGER: u8 = 3;
pub const TAG_NUMBER: u8 = 4;
pub const TAG_STRING: u8 = 5;

pub const MAX_PROTO_NESTING: usize = 32;
pub const MAX_STRING_LEN: usize = 1 << 20;

/// Loads and verifies a binary module, returning its root prototype.
pub fn load_module(bytes: &[u8]) -> Result<Arc<Prototype>, CompileError> {
    let mut reader = ChunkReader::new(bytes);
    reader.check_header()?;
    let root_upvalues = reader.read_u8()?;
    let proto = reader.read_prototype(0)?;
    if proto.upvalues.len() != root_upvalues as usize {
        return Err(CompileError::CountOutOfRange {
            field: "root upvalues",
            count: root_upvalues as u64,
        });
    }
    if reader.remaining() != 0 {
        return Err(CompileError::TrailingGarbage(reader.remaining()));
    }
    verify_prototype(&proto)?;
    Ok(Arc::new(proto))
}

pub struct ChunkReader<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> ChunkReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.offset
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CompileError> {
        if n > self.remaining() {
            return Err(CompileError::TruncatedChunk {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.input[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CompileError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, CompileError> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, CompileError> {
        Ok(i64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    fn read_i128(&mut self) -> Result<i128, CompileError> {
        Ok(i128::from_le_bytes(self.read_bytes(16)?.try_into().unwrap()))
    }

    /// A count of `element_size`-byte items; rejected when the declared
    /// total cannot fit in the remaining buffer.
    fn read_count(&mut self, field: &'static str, element_size: usize) -> Result<usize, CompileError> {
        let count = self.read_u32()? as u64;
        let total = count.saturating_mul(element_size as u64);
        if total > self.remaining() as u64 {
            return Err(CompileError::CountOutOfRange { field, count });
        }
        Ok(count as usize)
    }

    fn read_string(&mut self) -> Result<Vec<u8>, CompileError> {
        let len = self.read_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(CompileError::StringTooLong(len));
        }
        Ok(self.read_bytes(len)?.to_vec())
    }

    fn read_utf8_string(&mut self) -> Result<String, CompileError> {
        let bytes = self.read_string()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn check_header(&mut self) -> Result<(), CompileError> {
        if self.read_bytes(SIGNATURE.len()).map_err(|_| CompileError::BadSignature)? != SIGNATURE {
            return Err(CompileError::BadSignature);
        }
        let version = self.read_u8()?;
        if version != VERSION {
            return Err(CompileError::UnsupportedVersion(version));
        }
        let format = self.read_u8()?;
        if format != FORMAT {
            return Err(CompileError::UnsupportedFormat(format));
        }
        if self.read_bytes(CHECK_DATA.len())? != CHECK_DATA {
            return Err(CompileError::CorruptCheckData);
        }
        for (field, expected) in [
            ("instruction size", SIZE_INSTRUCTION),
            ("integer size", SIZE_INTEGER),
            ("number size", SIZE_NUMBER),
        ] {
            let actual = self.read_u8()?;
            if actual != expected {
                return Err(CompileError::SizeMismatch { field, actual });
            }
        }
        if self.read_i64()? != CHECK_INT {
            return Err(CompileError::EndiannessMismatch);
        }
        if self.read_i128()? != CHECK_NUMBER_MANTISSA {
            return Err(CompileError::NumberFormatMismatch);
        }
        Ok(())
    }

    fn read_prototype(&mut self, depth: usize) -> Result<Prototype, CompileError> {
        if depth > MAX_PROTO_NESTING {
            return Err(CompileError::PrototypeNestingTooDeep(depth));
        }
        let source = self.read_utf8_string()?;
        let line_defined = self.read_u32()?;
        let last_line_defined = self.read_u32()?;
        let num_params = self.read_u8()?;
        let is_vararg = self.read_u8()? != 0;
        let max_stack_size = self.read_u8()?;

        let code_len = self.read_count("code", 4)?;
        let mut code = Vec::with_capacity(code_len);
        for _ in 0..code_len {
            code.push(Instruction(self.read_u32()?));
        }

        let constant_count = self.read_count("constants", 1)?;
        let mut constants = Vec::with_capacity(constant_count);
        for _ in 0..constant_count {
            constants.push(self.read_constant()?);
        }

        let upvalue_count = self.read_count("upvalues", 2)?;
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let in_stack = self.read_u8()? != 0;
            let index = self.read_u8()?;
            upvalues.push(UpvalueDescriptor {
                name: String::new(),
                in_stack,
                index,
            });
        }

        let proto_count = self.read_count("prototypes", 1)?;
        let mut protos = Vec::with_capacity(proto_count);
        for _ in 0..proto_count {
            protos.push(Arc::new(self.read_prototype(depth + 1)?));
        }

        // debug info
        let line_count = self.read_count("line info", 4)?;
        let mut line_info = Vec::with_capacity(line_count);
        for _ in 0..line_count {
            line_info.push(self.read_u32()?);
        }
        let local_count = self.read_count("local variables", 12)?;
        let mut local_vars = Vec::with_capacity(local_count);
        for _ in 0..local_count {
            let name = self.read_utf8_string()?;
            let start_pc = self.read_u32()?;
            let end_pc = self.read_u32()?;
            local_vars.push(LocalVariable {
                name,
                start_pc,
                end_pc,
            });
        }
        let upvalue_name_count = self.read_count("upvalue names", 4)?;
        if upvalue_name_count > upvalues.len() {
            return Err(CompileError::CountOutOfRange {
                field: "upvalue names",
                count: upvalue_name_count as u64,
            });
        }
        for i in 0..upvalue_name_count {
            upvalues[i].name = self.read_utf8_string()?;
        }

        Ok(Prototype {
            source,
            line_defined,
            last_line_defined,
            num_params,
            is_vararg,
            max_stack_size,
            code,
            constants,
            upvalues,
            protos,
            line_info,
            local_vars,
        })
    }

    fn read_constant(&mut self) -> Result<Constant, CompileError> {
        let tag = self.read_u8()?;
        match tag {
            TAG_NIL => Ok(Constant::Nil),
            TAG_BOOL => Ok(Constant::Bool(self.read_u8()? != 0)),
            TAG_INTEGER => Ok(Constant::Integer(self.read_i64()?)),
            TAG_NUMBER => Ok(Constant::Number(Decimal::from_mantissa(self.read_i128()?))),
            TAG_STRING => Ok(Constant::String(self.read_string()?)),
            other => Err(CompileError::BadConstantTag(other)),
        }
    }
}
