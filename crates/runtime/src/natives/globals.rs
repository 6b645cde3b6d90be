//! Global native functions: print, len, str, num, type, clock, sleep,
//! input, open

use super::{define_builtin, string_of, type_error, value_length};
use crate::unescape::unescape;
use slo_core::error::ExceptionKind;
use slo_core::heap::Heap;
use slo_core::object::{FileMode, FileObj, NativeCtx, ObjKind};
use slo_core::table::Table;
use slo_core::value::Value;
use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub fn install(heap: &mut Heap, globals: &mut Table) {
    define_builtin(heap, globals, "print", (0, u8::MAX), native_print);
    define_builtin(heap, globals, "len", (1, 1), native_len);
    define_builtin(heap, globals, "str", (1, 1), native_str);
    define_builtin(heap, globals, "num", (1, 1), native_num);
    define_builtin(heap, globals, "type", (1, 1), native_type);
    define_builtin(heap, globals, "clock", (0, 0), native_clock);
    define_builtin(heap, globals, "sleep", (1, 1), native_sleep);
    define_builtin(heap, globals, "input", (0, 1), native_input);
    define_builtin(heap, globals, "open", (2, 2), native_open);
}

fn native_print(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let line = args
        .iter()
        .map(|arg| unescape(&ctx.heap.stringify(*arg)))
        .collect::<Vec<_>>()
        .join(" ");
    if writeln!(ctx.out, "{line}").is_err() {
        return ctx
            .heap
            .error_value(ExceptionKind::Io, "Could not write to output.");
    }
    Value::Nil
}

fn native_len(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    if args.len() != 1 {
        return type_error(ctx.heap, "len() takes exactly 1 argument.");
    }
    match value_length(ctx.heap, args[0]) {
        Some(len) => Value::Number(len as f64),
        None => type_error(ctx.heap, "len() argument has no length."),
    }
}

fn native_str(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    if args.len() != 1 {
        return type_error(ctx.heap, "str() takes exactly 1 argument.");
    }
    let rendered = ctx.heap.stringify(args[0]);
    ctx.heap.string_value(&rendered)
}

fn native_num(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    if args.len() != 1 {
        return type_error(ctx.heap, "num() takes exactly 1 argument.");
    }
    match args[0] {
        Value::Number(_) => args[0],
        _ => match string_of(ctx.heap, args[0]) {
            Some(s) => match s.trim().parse::<f64>() {
                Ok(n) => Value::Number(n),
                Err(_) => type_error(ctx.heap, &format!("Cannot convert '{s}' to a number.")),
            },
            None => type_error(ctx.heap, "num() argument must be a number or a string."),
        },
    }
}

fn native_type(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    if args.len() != 1 {
        return type_error(ctx.heap, "type() takes exactly 1 argument.");
    }
    let name = ctx.heap.type_name(args[0]);
    ctx.heap.string_value(name)
}

fn native_clock(_ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Value {
    static START: OnceLock<Instant> = OnceLock::new();
    Value::Number(START.get_or_init(Instant::now).elapsed().as_secs_f64())
}

fn native_sleep(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(Value::Number(secs)) = args.first().copied() else {
        return type_error(ctx.heap, "sleep() takes a number of seconds.");
    };
    if secs < 0.0 {
        return type_error(ctx.heap, "sleep() seconds must not be negative.");
    }
    std::thread::sleep(Duration::from_secs_f64(secs));
    Value::Nil
}

fn native_input(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    if let Some(prompt) = args.first() {
        let rendered = ctx.heap.stringify(*prompt);
        let _ = write!(ctx.out, "{}", unescape(&rendered));
        let _ = ctx.out.flush();
    }
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) => Value::Nil,
        Ok(_) => {
            let trimmed = line.trim_end_matches(['\n', '\r']);
            ctx.heap.string_value(trimmed)
        }
        Err(e) => ctx
            .heap
            .error_value(ExceptionKind::Io, &format!("Could not read input: {e}.")),
    }
}

fn native_open(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    if args.len() != 2 {
        return type_error(ctx.heap, "open() takes a path and a mode.");
    }
    let (Some(path), Some(mode_str)) = (
        string_of(ctx.heap, args[0]),
        string_of(ctx.heap, args[1]),
    ) else {
        return type_error(ctx.heap, "open() path and mode must be strings.");
    };
    let Some(mode) = FileMode::parse(&mode_str) else {
        return type_error(ctx.heap, &format!("Invalid file mode '{mode_str}'."));
    };
    let opened = match mode {
        FileMode::Read => OpenOptions::new().read(true).open(&path),
        FileMode::Write => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path),
        FileMode::Append => OpenOptions::new().append(true).create(true).open(&path),
    };
    match opened {
        Ok(handle) => {
            let path_ref = ctx.heap.intern(&path);
            Value::Obj(ctx.heap.alloc(ObjKind::File(FileObj {
                path: path_ref,
                mode,
                handle: Some(handle),
            })))
        }
        Err(e) => ctx
            .heap
            .error_value(ExceptionKind::Io, &format!("Could not open '{path}': {e}.")),
    }
}
