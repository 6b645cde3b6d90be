//! Methods on the built-in string class

use super::{define_builtin, string_of, type_error};
use slo_core::error::ExceptionKind;
use slo_core::heap::Heap;
use slo_core::object::NativeCtx;
use slo_core::table::Table;
use slo_core::value::Value;

pub fn install(heap: &mut Heap, table: &mut Table) {
    define_builtin(heap, table, "upper", (0, 0), string_upper);
    define_builtin(heap, table, "lower", (0, 0), string_lower);
    define_builtin(heap, table, "strip", (0, 0), string_strip);
    define_builtin(heap, table, "split", (1, 1), string_split);
    define_builtin(heap, table, "replace", (2, 2), string_replace);
    define_builtin(heap, table, "find", (1, 1), string_find);
    define_builtin(heap, table, "startsWith", (1, 1), string_starts_with);
    define_builtin(heap, table, "endsWith", (1, 1), string_ends_with);
    define_builtin(heap, table, "__index__", (1, 1), string_nth);
}

fn receiver(ctx: &mut NativeCtx<'_>, args: &[Value], method: &str) -> Result<String, Value> {
    string_of(ctx.heap, args[0])
        .ok_or_else(|| type_error(ctx.heap, &format!("{method}() receiver must be a string.")))
}

fn string_upper(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    match receiver(ctx, args, "upper") {
        Ok(s) => ctx.heap.string_value(&s.to_uppercase()),
        Err(e) => e,
    }
}

fn string_lower(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    match receiver(ctx, args, "lower") {
        Ok(s) => ctx.heap.string_value(&s.to_lowercase()),
        Err(e) => e,
    }
}

fn string_strip(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    match receiver(ctx, args, "strip") {
        Ok(s) => ctx.heap.string_value(s.trim()),
        Err(e) => e,
    }
}

fn string_split(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let s = match receiver(ctx, args, "split") {
        Ok(s) => s,
        Err(e) => return e,
    };
    let Some(separator) = args.get(1).copied().and_then(|v| string_of(ctx.heap, v)) else {
        return type_error(ctx.heap, "split() separator must be a string.");
    };
    let pieces: Vec<String> = if separator.is_empty() {
        s.chars().map(|c| c.to_string()).collect()
    } else {
        s.split(&separator).map(str::to_string).collect()
    };
    let items: Vec<Value> = pieces
        .iter()
        .map(|piece| ctx.heap.string_value(piece))
        .collect();
    super::new_list(ctx.heap, items)
}

fn string_replace(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let s = match receiver(ctx, args, "replace") {
        Ok(s) => s,
        Err(e) => return e,
    };
    let (Some(from), Some(to)) = (
        args.get(1).copied().and_then(|v| string_of(ctx.heap, v)),
        args.get(2).copied().and_then(|v| string_of(ctx.heap, v)),
    ) else {
        return type_error(ctx.heap, "replace() takes two string arguments.");
    };
    ctx.heap.string_value(&s.replace(&from, &to))
}

fn string_find(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let s = match receiver(ctx, args, "find") {
        Ok(s) => s,
        Err(e) => return e,
    };
    let Some(needle) = args.get(1).copied().and_then(|v| string_of(ctx.heap, v)) else {
        return type_error(ctx.heap, "find() argument must be a string.");
    };
    match s.find(&needle) {
        // Report a character index, consistent with indexing and slicing.
        Some(byte_index) => Value::Number(s[..byte_index].chars().count() as f64),
        None => Value::Number(-1.0),
    }
}

fn string_starts_with(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let s = match receiver(ctx, args, "startsWith") {
        Ok(s) => s,
        Err(e) => return e,
    };
    match args.get(1).copied().and_then(|v| string_of(ctx.heap, v)) {
        Some(prefix) => Value::Bool(s.starts_with(&prefix)),
        None => type_error(ctx.heap, "startsWith() argument must be a string."),
    }
}

fn string_ends_with(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let s = match receiver(ctx, args, "endsWith") {
        Ok(s) => s,
        Err(e) => return e,
    };
    match args.get(1).copied().and_then(|v| string_of(ctx.heap, v)) {
        Some(suffix) => Value::Bool(s.ends_with(&suffix)),
        None => type_error(ctx.heap, "endsWith() argument must be a string."),
    }
}

/// The for-in protocol: character at a running index.
fn string_nth(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let s = match receiver(ctx, args, "__index__") {
        Ok(s) => s,
        Err(e) => return e,
    };
    let Some(Value::Number(raw)) = args.get(1).copied() else {
        return type_error(ctx.heap, "__index__() takes a numeric index.");
    };
    let chars: Vec<char> = s.chars().collect();
    let index = if raw < 0.0 { raw + chars.len() as f64 } else { raw };
    if index < 0.0 || index >= chars.len() as f64 {
        return ctx
            .heap
            .error_value(ExceptionKind::Index, "String index out of range.");
    }
    ctx.heap.string_value(&chars[index as usize].to_string())
}
