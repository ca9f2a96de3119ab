//! Binary module writer: the exact inverse of the loader.
//!
//! Hosts use this to persist compiled modules; `load(dump(p)) == p` for
//! every valid prototype tree.

use crate::vm::loader::{
    CHECK_DATA, CHECK_INT, CHECK_NUMBER_MANTISSA, FORMAT, SIGNATURE, SIZE_INSTRUCTION,
    SIZE_INTEGER, SIZE_NUMBER, TAG_BOOL, TAG_INTEGER, TAG_NIL, TAG_NUMBER, TAG_STRING, VERSION,
};
use crate::vm::prototype::{Constant, Prototype};

pub fn dump_module(proto: &Prototype) -> Vec<u8> {
    let mut w = ChunkWriter::new();
    w.write_header();
    w.write_u8(proto.upvalues.len() as u8);
    w.write_prototype(proto);
    w.out
}

struct ChunkWriter {
    out: Vec<u8>,
}

impl ChunkWriter {
    fn new() -> Self {
        Self { out: Vec::new() }
    }

    fn write_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn write_u32(&mut self, v: u32) {
        self.out.extend(v.to_le_bytes());
    }

    fn write_i64(&mut self, v: i64) {
        self.out.extend(v.to_le_bytes());
    }

    fn write_i128(&mut self, v: i128) {
        self.out.extend(v.to_le_bytes());
    }

    fn write_string(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.out.extend(bytes);
    }

    fn write_header(&mut self) {
        self.out.extend(SIGNATURE);
        self.write_u8(VERSION);
        self.write_u8(FORMAT);
        self.out.extend(CHECK_DATA);
        self.write_u8(SIZE_INSTRUCTION);
        self.write_u8(SIZE_INTEGER);
        self.write_u8(SIZE_NUMBER);
        self.write_i64(CHECK_INT);
        self.write_i128(CHECK_NUMBER_MANTISSA);
    }

    fn write_prototype(&mut self, proto: &Prototype) {
        self.write_string(proto.source.as_bytes());
        self.write_u32(proto.line_defined);
        self.write_u32(proto.last_line_defined);
        self.write_u8(proto.num_params);
        self.write_u8(proto.is_vararg as u8);
        self.write_u8(proto.max_stack_size);

        self.write_u32(proto.code.len() as u32);
        for instr in &proto.code {
            self.write_u32(instr.0);
        }

        self.write_u32(proto.constants.len() as u32);
        for constant in &proto.constants {
            match constant {
                Constant::Nil => self.write_u8(TAG_NIL),
                Constant::Bool(b) => {
                    self.write_u8(TAG_BOOL);
                    self.write_u8(*b as u8);
                }
                Constant::Integer(i) => {
                    self.write_u8(TAG_INTEGER);
                    self.write_i64(*i);
                }
                Constant::Number(n) => {
                    self.write_u8(TAG_NUMBER);
                    self.write_i128(n.mantissa());
                }
                Constant::String(s) => {
                    self.write_u8(TAG_STRING);
                    self.write_string(s);
                }
            }
        }

        self.write_u32(proto.upvalues.len() as u32);
        for upvalue in &proto.upvalues {
            self.write_u8(upvalue.in_stack as u8);
            self.write_u8(upvalue.index);
        }

        self.write_u32(proto.protos.len() as u32);
        for nested in &proto.protos {
            self.write_prototype(nested);
        }

        self.write_u32(proto.line_info.len() as u32);
        for line in &proto.line_info {
            self.write_u32(*line);
        }
        self.write_u32(proto.local_vars.len() as u32);
        for var in &proto.local_vars {
            self.write_string(var.name.as_bytes());
            self.write_u32(var.start_pc);
            self.write_u32(var.end_pc);
        }
        self.write_u32(proto.upvalues.len() as u32);
        for upvalue in &proto.upvalues {
            self.write_string(upvalue.name.as_bytes());
        }
    }
}
