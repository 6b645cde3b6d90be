//! The math built-in module

use super::make_module;
use crate::natives::{define_builtin, type_error};
use slo_core::heap::Heap;
use slo_core::object::{NativeCtx, ObjRef};
use slo_core::value::Value;

pub fn create(heap: &mut Heap) -> ObjRef {
    make_module(heap, "math", |heap, members| {
        define_builtin(heap, members, "floor", (1, 1), math_floor);
        define_builtin(heap, members, "ceil", (1, 1), math_ceil);
        define_builtin(heap, members, "round", (1, 1), math_round);
        define_builtin(heap, members, "sqrt", (1, 1), math_sqrt);
        define_builtin(heap, members, "abs", (1, 1), math_abs);
        define_builtin(heap, members, "sin", (1, 1), math_sin);
        define_builtin(heap, members, "cos", (1, 1), math_cos);
        define_builtin(heap, members, "tan", (1, 1), math_tan);
        define_builtin(heap, members, "log", (1, 1), math_log);
        define_builtin(heap, members, "exp", (1, 1), math_exp);
        define_builtin(heap, members, "pow", (2, 2), math_pow);
        define_builtin(heap, members, "min", (2, 2), math_min);
        define_builtin(heap, members, "max", (2, 2), math_max);
        let pi = heap.string_value("pi");
        members.set(&heap.objects, pi, Value::Number(std::f64::consts::PI));
        let e = heap.string_value("e");
        members.set(&heap.objects, e, Value::Number(std::f64::consts::E));
    })
}

fn unary(ctx: &mut NativeCtx<'_>, args: &[Value], name: &str, f: fn(f64) -> f64) -> Value {
    match args.first().copied() {
        Some(Value::Number(n)) if args.len() == 1 => Value::Number(f(n)),
        _ => type_error(ctx.heap, &format!("{name}() takes exactly 1 number.")),
    }
}

fn binary(ctx: &mut NativeCtx<'_>, args: &[Value], name: &str, f: fn(f64, f64) -> f64) -> Value {
    match (args.first().copied(), args.get(1).copied()) {
        (Some(Value::Number(a)), Some(Value::Number(b))) if args.len() == 2 => {
            Value::Number(f(a, b))
        }
        _ => type_error(ctx.heap, &format!("{name}() takes exactly 2 numbers.")),
    }
}

fn math_floor(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    unary(ctx, args, "floor", f64::floor)
}

fn math_ceil(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    unary(ctx, args, "ceil", f64::ceil)
}

fn math_round(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    unary(ctx, args, "round", f64::round)
}

fn math_sqrt(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    unary(ctx, args, "sqrt", f64::sqrt)
}

fn math_abs(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    unary(ctx, args, "abs", f64::abs)
}

fn math_sin(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    unary(ctx, args, "sin", f64::sin)
}

fn math_cos(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    unary(ctx, args, "cos", f64::cos)
}

fn math_tan(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    unary(ctx, args, "tan", f64::tan)
}

fn math_log(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    unary(ctx, args, "log", f64::ln)
}

fn math_exp(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    unary(ctx, args, "exp", f64::exp)
}

fn math_pow(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    binary(ctx, args, "pow", f64::powf)
}

fn math_min(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    binary(ctx, args, "min", f64::min)
}

fn math_max(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    binary(ctx, args, "max", f64::max)
}
