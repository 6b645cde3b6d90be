//! The os built-in module

use super::make_module;
use crate::natives::{define_builtin, string_of, type_error};
use slo_core::error::ExceptionKind;
use slo_core::heap::Heap;
use slo_core::object::{NativeCtx, ObjRef};
use slo_core::value::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn create(heap: &mut Heap) -> ObjRef {
    make_module(heap, "os", |heap, members| {
        define_builtin(heap, members, "getenv", (1, 1), os_getenv);
        define_builtin(heap, members, "setenv", (2, 2), os_setenv);
        define_builtin(heap, members, "time", (0, 0), os_time);
        define_builtin(heap, members, "exit", (0, 1), os_exit);
        define_builtin(heap, members, "remove", (1, 1), os_remove);
        define_builtin(heap, members, "name", (0, 0), os_name);
    })
}

fn os_getenv(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(name) = args.first().copied().and_then(|v| string_of(ctx.heap, v)) else {
        return type_error(ctx.heap, "getenv() takes a string name.");
    };
    match std::env::var(&name) {
        Ok(value) => ctx.heap.string_value(&value),
        Err(_) => Value::Nil,
    }
}

fn os_setenv(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let (Some(name), Some(value)) = (
        args.first().copied().and_then(|v| string_of(ctx.heap, v)),
        args.get(1).copied().and_then(|v| string_of(ctx.heap, v)),
    ) else {
        return type_error(ctx.heap, "setenv() takes two strings.");
    };
    // Safety: the interpreter is strictly single-threaded; nothing reads the
    // environment concurrently.
    unsafe {
        std::env::set_var(&name, &value);
    }
    Value::Nil
}

fn os_time(_ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Value {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(secs)
}

fn os_exit(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let code = match args.first().copied() {
        None => 0,
        Some(Value::Number(n)) => n as i32,
        Some(_) => return type_error(ctx.heap, "exit() code must be a number."),
    };
    std::process::exit(code);
}

fn os_remove(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(path) = args.first().copied().and_then(|v| string_of(ctx.heap, v)) else {
        return type_error(ctx.heap, "remove() takes a string path.");
    };
    match std::fs::remove_file(&path) {
        Ok(()) => Value::Nil,
        Err(e) => ctx
            .heap
            .error_value(ExceptionKind::Io, &format!("Could not remove '{path}': {e}.")),
    }
}

fn os_name(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Value {
    ctx.heap.string_value(std::env::consts::OS)
}
