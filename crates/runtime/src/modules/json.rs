//! The json built-in module
//!
//! `parse` and `stringify` convert between interpreter values and
//! `serde_json::Value`: objects become dicts, arrays become lists, every
//! JSON number becomes a double. Values with no JSON form (functions,
//! classes, files) make `stringify` fail with a type error.

use super::make_module;
use crate::natives::{define_builtin, new_dict, new_list, string_of, type_error};
use slo_core::error::ExceptionKind;
use slo_core::heap::Heap;
use slo_core::object::{NativeCtx, ObjKind, ObjRef};
use slo_core::table::Table;
use slo_core::value::Value;

pub fn create(heap: &mut Heap) -> ObjRef {
    make_module(heap, "json", |heap, members| {
        define_builtin(heap, members, "parse", (1, 1), json_parse);
        define_builtin(heap, members, "stringify", (1, 1), json_stringify);
    })
}

fn json_parse(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(text) = args.first().copied().and_then(|v| string_of(ctx.heap, v)) else {
        return type_error(ctx.heap, "parse() takes a string.");
    };
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(parsed) => decode(ctx.heap, &parsed),
        Err(e) => ctx
            .heap
            .error_value(ExceptionKind::Runtime, &format!("Invalid JSON: {e}.")),
    }
}

fn decode(heap: &mut Heap, json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => heap.string_value(s),
        serde_json::Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(|item| decode(heap, item)).collect();
            new_list(heap, values)
        }
        serde_json::Value::Object(map) => {
            let mut entries = Table::new();
            for (key, value) in map {
                let key = heap.string_value(key);
                let value = decode(heap, value);
                entries.set(&heap.objects, key, value);
            }
            new_dict(heap, entries)
        }
    }
}

fn json_stringify(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(value) = args.first().copied() else {
        return type_error(ctx.heap, "stringify() takes exactly 1 argument.");
    };
    match encode(ctx.heap, value) {
        Ok(json) => ctx.heap.string_value(&json.to_string()),
        Err(kind) => type_error(ctx.heap, &format!("Cannot serialise {kind} to JSON.")),
    }
}

fn encode(heap: &Heap, value: Value) -> Result<serde_json::Value, &'static str> {
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(b)),
        Value::Number(n) => {
            if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
                Ok(serde_json::Value::from(n as i64))
            } else {
                serde_json::Number::from_f64(n)
                    .map(serde_json::Value::Number)
                    .ok_or("number")
            }
        }
        Value::Obj(r) => match &heap.objects.get(r).kind {
            ObjKind::String(s) => Ok(serde_json::Value::String(s.chars.to_string())),
            ObjKind::List(l) => {
                let items: Result<Vec<_>, _> =
                    l.items.iter().map(|item| encode(heap, *item)).collect();
                Ok(serde_json::Value::Array(items?))
            }
            ObjKind::Dict(d) => {
                let mut map = serde_json::Map::new();
                for (key, entry) in d.entries.iter() {
                    map.insert(heap.stringify(key), encode(heap, entry)?);
                }
                Ok(serde_json::Value::Object(map))
            }
            kind => Err(kind.type_name()),
        },
        Value::Empty | Value::Error(_) => Err("value"),
    }
}
