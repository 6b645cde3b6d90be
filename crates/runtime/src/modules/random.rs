//! The random built-in module
//!
//! One thread-local StdRng backs every function; `seed` replaces it so runs
//! are reproducible on demand.

use super::make_module;
use crate::natives::{as_list, define_builtin, type_error};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slo_core::error::ExceptionKind;
use slo_core::heap::Heap;
use slo_core::object::{NativeCtx, ObjKind, ObjRef};
use slo_core::value::Value;
use std::cell::RefCell;

thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::from_entropy());
}

pub fn create(heap: &mut Heap) -> ObjRef {
    make_module(heap, "random", |heap, members| {
        define_builtin(heap, members, "random", (0, 0), random_random);
        define_builtin(heap, members, "range", (2, 2), random_range);
        define_builtin(heap, members, "choice", (1, 1), random_choice);
        define_builtin(heap, members, "seed", (1, 1), random_seed);
    })
}

fn random_random(_ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Value {
    Value::Number(RNG.with(|rng| rng.borrow_mut().gen_range(0.0..1.0)))
}

/// Integer-valued uniform pick from `lo..=hi`.
fn random_range(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let (Some(Value::Number(lo)), Some(Value::Number(hi))) =
        (args.first().copied(), args.get(1).copied())
    else {
        return type_error(ctx.heap, "range() takes two numbers.");
    };
    let (lo, hi) = (lo.floor() as i64, hi.floor() as i64);
    if lo > hi {
        return type_error(ctx.heap, "range() lower bound exceeds upper bound.");
    }
    Value::Number(RNG.with(|rng| rng.borrow_mut().gen_range(lo..=hi)) as f64)
}

fn random_choice(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = args.first().copied().and_then(|v| as_list(ctx.heap, v)) else {
        return type_error(ctx.heap, "choice() takes a list.");
    };
    let items = match &ctx.heap.objects.get(r).kind {
        ObjKind::List(l) => l.items.clone(),
        _ => unreachable!("checked by as_list"),
    };
    if items.is_empty() {
        return ctx
            .heap
            .error_value(ExceptionKind::Index, "choice() from an empty list.");
    }
    items[RNG.with(|rng| rng.borrow_mut().gen_range(0..items.len()))]
}

fn random_seed(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(Value::Number(seed)) = args.first().copied() else {
        return type_error(ctx.heap, "seed() takes a number.");
    };
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed as u64));
    Value::Nil
}
