//! The bytecode instruction set and its disassembler
//!
//! Operand widths: `K` is a one-byte constant-pool index, jump offsets are
//! big-endian u16, `LIST`/`DICT` carry a big-endian u16 element count, and
//! `CLOSURE` is followed by one `(is_local, index)` byte pair per upvalue.

use crate::chunk::Chunk;
use crate::heap::Objects;
use crate::object::ObjKind;
use crate::value::Value;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Constant,
    Nil,
    True,
    False,
    Pop,
    Dup,
    Dup2,
    DefineGlobal,
    DefineFinalGlobal,
    GetGlobal,
    SetGlobal,
    GetLocal,
    SetLocal,
    GetUpvalue,
    SetUpvalue,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Pow,
    Negate,
    Not,
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Method,
    Inherit,
    GetSuper,
    GetProperty,
    SetProperty,
    List,
    Dict,
    Enum,
    GetIndex,
    SetIndex,
    Slice,
    Len,
    Has,
    HasNot,
    Import,
    ImportAs,
    Interpolate,
    Assert,
}

const LAST_OPCODE: u8 = OpCode::Assert as u8;

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte <= LAST_OPCODE {
            // Contiguous discriminants starting at zero
            Ok(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            Err(byte)
        }
    }
}

impl OpCode {
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Constant => "CONSTANT",
            OpCode::Nil => "NIL",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::Dup2 => "DUP2",
            OpCode::DefineGlobal => "DEFINE_GLOBAL",
            OpCode::DefineFinalGlobal => "DEFINE_FINAL_GLOBAL",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::GetUpvalue => "GET_UPVALUE",
            OpCode::SetUpvalue => "SET_UPVALUE",
            OpCode::Equal => "EQUAL",
            OpCode::NotEqual => "NOT_EQUAL",
            OpCode::Greater => "GREATER",
            OpCode::GreaterEqual => "GREATER_EQUAL",
            OpCode::Less => "LESS",
            OpCode::LessEqual => "LESS_EQUAL",
            OpCode::Add => "ADD",
            OpCode::Subtract => "SUBTRACT",
            OpCode::Multiply => "MULTIPLY",
            OpCode::Divide => "DIVIDE",
            OpCode::Modulo => "MODULO",
            OpCode::Pow => "POW",
            OpCode::Negate => "NEGATE",
            OpCode::Not => "NOT",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::JumpIfTrue => "JUMP_IF_TRUE",
            OpCode::Loop => "LOOP",
            OpCode::Call => "CALL",
            OpCode::Invoke => "INVOKE",
            OpCode::SuperInvoke => "SUPER_INVOKE",
            OpCode::Closure => "CLOSURE",
            OpCode::CloseUpvalue => "CLOSE_UPVALUE",
            OpCode::Return => "RETURN",
            OpCode::Class => "CLASS",
            OpCode::Method => "METHOD",
            OpCode::Inherit => "INHERIT",
            OpCode::GetSuper => "GET_SUPER",
            OpCode::GetProperty => "GET_PROPERTY",
            OpCode::SetProperty => "SET_PROPERTY",
            OpCode::List => "LIST",
            OpCode::Dict => "DICT",
            OpCode::Enum => "ENUM",
            OpCode::GetIndex => "GET_INDEX",
            OpCode::SetIndex => "SET_INDEX",
            OpCode::Slice => "SLICE",
            OpCode::Len => "LEN",
            OpCode::Has => "HAS",
            OpCode::HasNot => "HAS_NOT",
            OpCode::Import => "IMPORT",
            OpCode::ImportAs => "IMPORT_AS",
            OpCode::Interpolate => "INTERPOLATE",
            OpCode::Assert => "ASSERT",
        }
    }
}

/// Render a whole chunk, one instruction per line.
pub fn disassemble(chunk: &Chunk, name: &str, objects: &Objects) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, objects, &mut out);
    }
    out
}

fn constant_repr(chunk: &Chunk, index: u8, objects: &Objects) -> String {
    let value = chunk.constants[index as usize];
    match value {
        Value::Obj(r) => match &objects.get(r).kind {
            ObjKind::String(s) => format!("\"{}\"", s.chars),
            ObjKind::Function(_) => "<fn>".to_string(),
            other => format!("<{}>", other.type_name()),
        },
        other => other.to_string(),
    }
}

fn disassemble_instruction(
    chunk: &Chunk,
    offset: usize,
    objects: &Objects,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{offset:04} {:4} ", chunk.line(offset));
    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(b) => {
            let _ = writeln!(out, "UNKNOWN {b}");
            return offset + 1;
        }
    };
    match op {
        OpCode::Constant
        | OpCode::DefineGlobal
        | OpCode::DefineFinalGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::Class
        | OpCode::Method
        | OpCode::GetSuper
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::Import => {
            let k = chunk.code[offset + 1];
            let _ = writeln!(
                out,
                "{:<18} {k} ({})",
                op.name(),
                constant_repr(chunk, k, objects)
            );
            offset + 2
        }
        OpCode::ImportAs => {
            let k = chunk.code[offset + 1];
            let alias = chunk.code[offset + 2];
            let _ = writeln!(
                out,
                "{:<18} {} as {}",
                op.name(),
                constant_repr(chunk, k, objects),
                constant_repr(chunk, alias, objects)
            );
            offset + 3
        }
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue
        | OpCode::Call => {
            let slot = chunk.code[offset + 1];
            let _ = writeln!(out, "{:<18} {slot}", op.name());
            offset + 2
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
            let _ = writeln!(out, "{:<18} -> {}", op.name(), offset + 3 + jump as usize);
            offset + 3
        }
        OpCode::Loop => {
            let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
            let _ = writeln!(out, "{:<18} -> {}", op.name(), offset + 3 - jump as usize);
            offset + 3
        }
        OpCode::List | OpCode::Dict => {
            let count = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
            let _ = writeln!(out, "{:<18} {count}", op.name());
            offset + 3
        }
        OpCode::Enum => {
            let count = chunk.code[offset + 1];
            let k = chunk.code[offset + 2];
            let _ = writeln!(
                out,
                "{:<18} {count} {}",
                op.name(),
                constant_repr(chunk, k, objects)
            );
            offset + 3
        }
        OpCode::Invoke | OpCode::SuperInvoke => {
            let k = chunk.code[offset + 1];
            let argc = chunk.code[offset + 2];
            let _ = writeln!(
                out,
                "{:<18} {} ({argc} args)",
                op.name(),
                constant_repr(chunk, k, objects)
            );
            offset + 3
        }
        OpCode::Closure => {
            let k = chunk.code[offset + 1];
            let _ = writeln!(
                out,
                "{:<18} {k} ({})",
                op.name(),
                constant_repr(chunk, k, objects)
            );
            let mut next = offset + 2;
            let upvalue_count = match chunk.constants[k as usize] {
                Value::Obj(r) => match &objects.get(r).kind {
                    ObjKind::Function(f) => f.upvalue_count,
                    _ => 0,
                },
                _ => 0,
            };
            for _ in 0..upvalue_count {
                let is_local = chunk.code[next];
                let index = chunk.code[next + 1];
                let _ = writeln!(
                    out,
                    "{:04}      |                  {} {}",
                    next,
                    if is_local == 1 { "local" } else { "upvalue" },
                    index
                );
                next += 2;
            }
            next
        }
        _ => {
            let _ = writeln!(out, "{}", op.name());
            offset + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_opcodes() {
        for byte in 0..=LAST_OPCODE {
            let op = OpCode::try_from(byte).expect("contiguous opcode space");
            assert_eq!(op as u8, byte);
        }
        assert!(OpCode::try_from(LAST_OPCODE + 1).is_err());
        assert!(OpCode::try_from(u8::MAX).is_err());
    }

    #[test]
    fn test_names_are_screaming_case() {
        assert_eq!(OpCode::DefineFinalGlobal.name(), "DEFINE_FINAL_GLOBAL");
        assert_eq!(OpCode::SuperInvoke.name(), "SUPER_INVOKE");
    }
}
