//! Methods on the built-in dict class

use super::{as_dict, define_builtin, new_list, type_error};
use slo_core::error::ExceptionKind;
use slo_core::heap::{Heap, TableSlot};
use slo_core::object::{NativeCtx, ObjKind};
use slo_core::table::Table;
use slo_core::value::Value;

pub fn install(heap: &mut Heap, table: &mut Table) {
    define_builtin(heap, table, "get", (1, 2), dict_get);
    define_builtin(heap, table, "keys", (0, 0), dict_keys);
    define_builtin(heap, table, "values", (0, 0), dict_values);
    define_builtin(heap, table, "remove", (1, 1), dict_remove);
    define_builtin(heap, table, "__index__", (1, 1), dict_nth_key);
}

fn dict_get(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let (Some(r), Some(key)) = (as_dict(ctx.heap, args[0]), args.get(1).copied()) else {
        return type_error(ctx.heap, "get() takes a key and an optional default.");
    };
    let fallback = args.get(2).copied().unwrap_or(Value::Nil);
    ctx.heap
        .table_get(r, TableSlot::Entries, key)
        .unwrap_or(fallback)
}

fn dict_keys(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = as_dict(ctx.heap, args[0]) else {
        return type_error(ctx.heap, "keys() receiver must be a dict.");
    };
    let keys: Vec<Value> = match &ctx.heap.objects.get(r).kind {
        ObjKind::Dict(d) => d.entries.iter().map(|(k, _)| k).collect(),
        _ => unreachable!("checked by as_dict"),
    };
    new_list(ctx.heap, keys)
}

fn dict_values(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = as_dict(ctx.heap, args[0]) else {
        return type_error(ctx.heap, "values() receiver must be a dict.");
    };
    let values: Vec<Value> = match &ctx.heap.objects.get(r).kind {
        ObjKind::Dict(d) => d.entries.iter().map(|(_, v)| v).collect(),
        _ => unreachable!("checked by as_dict"),
    };
    new_list(ctx.heap, values)
}

fn dict_remove(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let (Some(r), Some(key)) = (as_dict(ctx.heap, args[0]), args.get(1).copied()) else {
        return type_error(ctx.heap, "remove() takes exactly 1 argument.");
    };
    Value::Bool(ctx.heap.table_remove(r, TableSlot::Entries, key))
}

/// The for-in protocol: the i-th live key in table slot order. Visitation
/// order is deliberately unspecified to the language.
fn dict_nth_key(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let (Some(r), Some(Value::Number(index))) = (as_dict(ctx.heap, args[0]), args.get(1).copied())
    else {
        return type_error(ctx.heap, "__index__() takes a numeric index.");
    };
    let key = match &ctx.heap.objects.get(r).kind {
        ObjKind::Dict(d) => {
            if index < 0.0 {
                None
            } else {
                d.entries.iter().nth(index as usize).map(|(k, _)| k)
            }
        }
        _ => unreachable!("checked by as_dict"),
    };
    match key {
        Some(k) => k,
        None => ctx
            .heap
            .error_value(ExceptionKind::Index, "Dict index out of range."),
    }
}
