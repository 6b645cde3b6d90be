//! Methods on the built-in list class

use super::{as_list, define_builtin, string_of, type_error};
use slo_core::error::ExceptionKind;
use slo_core::heap::Heap;
use slo_core::object::{NativeCtx, ObjKind};
use slo_core::table::Table;
use slo_core::value::Value;

pub fn install(heap: &mut Heap, table: &mut Table) {
    define_builtin(heap, table, "append", (1, 1), list_append);
    define_builtin(heap, table, "pop", (0, 0), list_pop);
    define_builtin(heap, table, "insert", (2, 2), list_insert);
    define_builtin(heap, table, "remove", (1, 1), list_remove);
    define_builtin(heap, table, "indexOf", (1, 1), list_index_of);
    define_builtin(heap, table, "reverse", (0, 0), list_reverse);
    define_builtin(heap, table, "join", (1, 1), list_join);
    define_builtin(heap, table, "__index__", (1, 1), list_nth);
}

fn list_append(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let (Some(r), Some(item)) = (as_list(ctx.heap, args[0]), args.get(1).copied()) else {
        return type_error(ctx.heap, "append() takes exactly 1 argument.");
    };
    match &mut ctx.heap.objects.get_mut(r).kind {
        ObjKind::List(l) => l.items.push(item),
        _ => unreachable!("checked by as_list"),
    }
    Value::Nil
}

fn list_pop(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = as_list(ctx.heap, args[0]) else {
        return type_error(ctx.heap, "pop() receiver must be a list.");
    };
    let popped = match &mut ctx.heap.objects.get_mut(r).kind {
        ObjKind::List(l) => l.items.pop(),
        _ => unreachable!("checked by as_list"),
    };
    match popped {
        Some(value) => value,
        None => ctx
            .heap
            .error_value(ExceptionKind::Index, "pop() from an empty list."),
    }
}

fn list_insert(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = as_list(ctx.heap, args[0]) else {
        return type_error(ctx.heap, "insert() receiver must be a list.");
    };
    let (Some(Value::Number(index)), Some(item)) = (args.get(1).copied(), args.get(2).copied())
    else {
        return type_error(ctx.heap, "insert() takes an index and a value.");
    };
    let out_of_range = match &mut ctx.heap.objects.get_mut(r).kind {
        ObjKind::List(l) => {
            if index < 0.0 || index > l.items.len() as f64 {
                true
            } else {
                l.items.insert(index as usize, item);
                false
            }
        }
        _ => unreachable!("checked by as_list"),
    };
    if out_of_range {
        return ctx
            .heap
            .error_value(ExceptionKind::Index, "insert() index out of range.");
    }
    Value::Nil
}

fn list_remove(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let (Some(r), Some(needle)) = (as_list(ctx.heap, args[0]), args.get(1).copied()) else {
        return type_error(ctx.heap, "remove() takes exactly 1 argument.");
    };
    let position = match &ctx.heap.objects.get(r).kind {
        ObjKind::List(l) => l
            .items
            .iter()
            .position(|item| ctx.heap.values_equal(*item, needle)),
        _ => unreachable!("checked by as_list"),
    };
    match position {
        Some(i) => {
            match &mut ctx.heap.objects.get_mut(r).kind {
                ObjKind::List(l) => l.items.remove(i),
                _ => unreachable!("checked by as_list"),
            };
            Value::Bool(true)
        }
        None => Value::Bool(false),
    }
}

fn list_index_of(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let (Some(r), Some(needle)) = (as_list(ctx.heap, args[0]), args.get(1).copied()) else {
        return type_error(ctx.heap, "indexOf() takes exactly 1 argument.");
    };
    let position = match &ctx.heap.objects.get(r).kind {
        ObjKind::List(l) => l
            .items
            .iter()
            .position(|item| ctx.heap.values_equal(*item, needle)),
        _ => unreachable!("checked by as_list"),
    };
    Value::Number(position.map(|i| i as f64).unwrap_or(-1.0))
}

fn list_reverse(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = as_list(ctx.heap, args[0]) else {
        return type_error(ctx.heap, "reverse() receiver must be a list.");
    };
    match &mut ctx.heap.objects.get_mut(r).kind {
        ObjKind::List(l) => l.items.reverse(),
        _ => unreachable!("checked by as_list"),
    }
    Value::Nil
}

fn list_join(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = as_list(ctx.heap, args[0]) else {
        return type_error(ctx.heap, "join() receiver must be a list.");
    };
    let Some(separator) = args.get(1).copied().and_then(|v| string_of(ctx.heap, v)) else {
        return type_error(ctx.heap, "join() separator must be a string.");
    };
    let items = match &ctx.heap.objects.get(r).kind {
        ObjKind::List(l) => l.items.clone(),
        _ => unreachable!("checked by as_list"),
    };
    let joined = items
        .iter()
        .map(|item| ctx.heap.stringify(*item))
        .collect::<Vec<_>>()
        .join(&separator);
    ctx.heap.string_value(&joined)
}

/// The for-in protocol: element at a running index.
fn list_nth(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let (Some(r), Some(Value::Number(raw))) = (as_list(ctx.heap, args[0]), args.get(1).copied())
    else {
        return type_error(ctx.heap, "__index__() takes a numeric index.");
    };
    let item = match &ctx.heap.objects.get(r).kind {
        ObjKind::List(l) => {
            let index = if raw < 0.0 { raw + l.items.len() as f64 } else { raw };
            if index < 0.0 || index >= l.items.len() as f64 {
                None
            } else {
                Some(l.items[index as usize])
            }
        }
        _ => unreachable!("checked by as_list"),
    };
    match item {
        Some(value) => value,
        None => ctx
            .heap
            .error_value(ExceptionKind::Index, "List index out of range."),
    }
}
