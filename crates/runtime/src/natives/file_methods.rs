//! Methods on the built-in file class
//!
//! Mode and open-state checks happen here, not in the VM; violations come
//! back as IOException error values. A file object collected while open
//! closes its handle when the sweep drops it.

use super::{as_file, define_builtin, new_list, string_of, type_error};
use crate::unescape::unescape;
use slo_core::error::ExceptionKind;
use slo_core::heap::Heap;
use slo_core::object::{FileMode, NativeCtx, ObjKind};
use slo_core::table::Table;
use slo_core::value::Value;
use std::io::{Read, Write};

pub fn install(heap: &mut Heap, table: &mut Table) {
    define_builtin(heap, table, "read", (0, 0), file_read);
    define_builtin(heap, table, "readLines", (0, 0), file_read_lines);
    define_builtin(heap, table, "write", (1, 1), file_write);
    define_builtin(heap, table, "close", (0, 0), file_close);
}

fn read_all(ctx: &mut NativeCtx<'_>, args: &[Value], method: &str) -> Result<String, Value> {
    let Some(r) = as_file(ctx.heap, args[0]) else {
        return Err(type_error(
            ctx.heap,
            &format!("{method}() receiver must be a file."),
        ));
    };
    let read = match &mut ctx.heap.objects.get_mut(r).kind {
        ObjKind::File(f) => {
            if f.mode != FileMode::Read {
                Err("File not opened for reading.".to_string())
            } else {
                match f.handle.as_mut() {
                    None => Err("File is closed.".to_string()),
                    Some(handle) => {
                        let mut content = String::new();
                        handle
                            .read_to_string(&mut content)
                            .map(|_| content)
                            .map_err(|e| format!("Could not read file: {e}."))
                    }
                }
            }
        }
        _ => unreachable!("checked by as_file"),
    };
    read.map_err(|message| ctx.heap.error_value(ExceptionKind::Io, &message))
}

fn file_read(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    match read_all(ctx, args, "read") {
        Ok(content) => ctx.heap.string_value(&content),
        Err(e) => e,
    }
}

fn file_read_lines(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    match read_all(ctx, args, "readLines") {
        Ok(content) => {
            let lines: Vec<Value> = content
                .lines()
                .map(|line| ctx.heap.string_value(line))
                .collect();
            new_list(ctx.heap, lines)
        }
        Err(e) => e,
    }
}

fn file_write(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = as_file(ctx.heap, args[0]) else {
        return type_error(ctx.heap, "write() receiver must be a file.");
    };
    let Some(text) = args.get(1).copied().and_then(|v| string_of(ctx.heap, v)) else {
        return type_error(ctx.heap, "write() argument must be a string.");
    };
    let decoded = unescape(&text);
    let written = match &mut ctx.heap.objects.get_mut(r).kind {
        ObjKind::File(f) => {
            if f.mode == FileMode::Read {
                Err("File not opened for writing.".to_string())
            } else {
                match f.handle.as_mut() {
                    None => Err("File is closed.".to_string()),
                    Some(handle) => handle
                        .write_all(decoded.as_bytes())
                        .map_err(|e| format!("Could not write file: {e}.")),
                }
            }
        }
        _ => unreachable!("checked by as_file"),
    };
    match written {
        Ok(()) => Value::Nil,
        Err(message) => ctx.heap.error_value(ExceptionKind::Io, &message),
    }
}

fn file_close(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = as_file(ctx.heap, args[0]) else {
        return type_error(ctx.heap, "close() receiver must be a file.");
    };
    match &mut ctx.heap.objects.get_mut(r).kind {
        ObjKind::File(f) => f.handle = None,
        _ => unreachable!("checked by as_file"),
    }
    Value::Nil
}
