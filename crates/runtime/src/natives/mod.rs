//! Native-function bridge and the built-in classes
//!
//! `define_builtin` installs a host function under a name in any method or
//! member table; `add_native_property` installs a zero-argument getter
//! reachable through `GET_PROPERTY`. Natives self-validate their arguments
//! and report failures by returning an error value built with
//! [`Heap::error_value`], never by panicking across the bridge.
//!
//! Five classes are created at VM startup and pinned as GC roots: `string`,
//! `list`, `dict`, `file`, and the shared `container` class whose methods
//! are copied down into both container classes, the same copy-down INHERIT
//! uses.

pub mod dict_methods;
pub mod file_methods;
pub mod globals;
pub mod list_methods;
pub mod string_methods;

use slo_core::error::ExceptionKind;
use slo_core::heap::Heap;
use slo_core::object::{
    ClassObj, DictObj, ListObj, NativeCtx, NativeFn, NativeObj, NativePropertyObj, ObjKind, ObjRef,
};
use slo_core::table::Table;
use slo_core::value::Value;

/// Register a native function in a table under `name`.
pub fn define_builtin(
    heap: &mut Heap,
    table: &mut Table,
    name: &'static str,
    arity: (u8, u8),
    function: NativeFn,
) {
    let name_ref = heap.intern(name);
    let native = heap.alloc(ObjKind::Native(NativeObj {
        name,
        function,
        arity_min: arity.0,
        arity_max: arity.1,
    }));
    table.set(&heap.objects, Value::Obj(name_ref), Value::Obj(native));
}

/// Register a zero-argument host getter in a native-property table.
pub fn add_native_property(
    heap: &mut Heap,
    table: &mut Table,
    name: &'static str,
    getter: NativeFn,
) {
    let name_ref = heap.intern(name);
    let property = heap.alloc(ObjKind::NativeProperty(NativePropertyObj { name, getter }));
    table.set(&heap.objects, Value::Obj(name_ref), Value::Obj(property));
}

/// Install every global native plus the built-in classes.
pub fn install(heap: &mut Heap, globals: &mut Table) {
    install_classes(heap);
    globals::install(heap, globals);
}

fn class_with(
    heap: &mut Heap,
    name: &'static str,
    methods: Table,
    properties: Table,
    superclass: Option<ObjRef>,
) -> ObjRef {
    let name_ref = heap.intern(name);
    heap.alloc(ObjKind::Class(ClassObj {
        name: name_ref,
        superclass,
        methods,
        properties,
    }))
}

fn install_classes(heap: &mut Heap) {
    let mut container_methods = Table::new();
    define_builtin(heap, &mut container_methods, "isEmpty", (0, 0), container_is_empty);
    define_builtin(heap, &mut container_methods, "clear", (0, 0), container_clear);
    define_builtin(heap, &mut container_methods, "copy", (0, 0), container_copy);
    let container_class =
        class_with(heap, "container", container_methods.clone(), Table::new(), None);

    let mut list_table = container_methods.clone();
    list_methods::install(heap, &mut list_table);
    let mut list_props = Table::new();
    add_native_property(heap, &mut list_props, "length", length_getter);
    let list_class = class_with(heap, "list", list_table, list_props, Some(container_class));

    let mut dict_table = container_methods;
    dict_methods::install(heap, &mut dict_table);
    let mut dict_props = Table::new();
    add_native_property(heap, &mut dict_props, "length", length_getter);
    let dict_class = class_with(heap, "dict", dict_table, dict_props, Some(container_class));

    let mut string_table = Table::new();
    string_methods::install(heap, &mut string_table);
    let mut string_props = Table::new();
    add_native_property(heap, &mut string_props, "length", length_getter);
    let string_class = class_with(heap, "string", string_table, string_props, None);

    let mut file_table = Table::new();
    file_methods::install(heap, &mut file_table);
    let file_class = class_with(heap, "file", file_table, Table::new(), None);

    heap.builtins.container_class = Some(container_class);
    heap.builtins.list_class = Some(list_class);
    heap.builtins.dict_class = Some(dict_class);
    heap.builtins.string_class = Some(string_class);
    heap.builtins.file_class = Some(file_class);
    heap.builtins.init_string = Some(heap.intern("__init__"));
}

// --- helpers shared across native modules --------------------------------

/// Length of a string (characters), list, or dict.
pub fn value_length(heap: &Heap, value: Value) -> Option<usize> {
    let r = value.as_obj()?;
    match &heap.objects.get(r).kind {
        ObjKind::String(s) => Some(s.chars.chars().count()),
        ObjKind::List(l) => Some(l.items.len()),
        ObjKind::Dict(d) => Some(d.entries.len()),
        _ => None,
    }
}

pub(crate) fn string_of(heap: &Heap, value: Value) -> Option<String> {
    let r = value.as_obj()?;
    match &heap.objects.get(r).kind {
        ObjKind::String(s) => Some(s.chars.to_string()),
        _ => None,
    }
}

pub(crate) fn as_list(heap: &Heap, value: Value) -> Option<ObjRef> {
    let r = value.as_obj()?;
    matches!(heap.objects.get(r).kind, ObjKind::List(_)).then_some(r)
}

pub(crate) fn as_dict(heap: &Heap, value: Value) -> Option<ObjRef> {
    let r = value.as_obj()?;
    matches!(heap.objects.get(r).kind, ObjKind::Dict(_)).then_some(r)
}

pub(crate) fn as_file(heap: &Heap, value: Value) -> Option<ObjRef> {
    let r = value.as_obj()?;
    matches!(heap.objects.get(r).kind, ObjKind::File(_)).then_some(r)
}

pub(crate) fn type_error(heap: &mut Heap, message: &str) -> Value {
    heap.error_value(ExceptionKind::Type, message)
}

pub(crate) fn new_list(heap: &mut Heap, items: Vec<Value>) -> Value {
    let class = heap
        .builtins
        .list_class
        .expect("list class installed at startup");
    Value::Obj(heap.alloc(ObjKind::List(ListObj { class, items })))
}

pub(crate) fn new_dict(heap: &mut Heap, entries: Table) -> Value {
    let class = heap
        .builtins
        .dict_class
        .expect("dict class installed at startup");
    Value::Obj(heap.alloc(ObjKind::Dict(DictObj { class, entries })))
}

// --- container class (shared by list and dict) ----------------------------

fn container_is_empty(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    match value_length(ctx.heap, args[0]) {
        Some(len) => Value::Bool(len == 0),
        None => type_error(ctx.heap, "isEmpty() receiver has no length."),
    }
}

fn container_clear(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = args[0].as_obj() else {
        return type_error(ctx.heap, "clear() receiver must be a container.");
    };
    match &mut ctx.heap.objects.get_mut(r).kind {
        ObjKind::List(l) => l.items.clear(),
        ObjKind::Dict(d) => d.entries.clear(),
        _ => return type_error(ctx.heap, "clear() receiver must be a container."),
    }
    Value::Nil
}

fn container_copy(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    let Some(r) = args[0].as_obj() else {
        return type_error(ctx.heap, "copy() receiver must be a container.");
    };
    enum Shallow {
        List(Vec<Value>),
        Dict(Table),
    }
    let copy = match &ctx.heap.objects.get(r).kind {
        ObjKind::List(l) => Shallow::List(l.items.clone()),
        ObjKind::Dict(d) => Shallow::Dict(d.entries.clone()),
        _ => return type_error(ctx.heap, "copy() receiver must be a container."),
    };
    match copy {
        Shallow::List(items) => new_list(ctx.heap, items),
        Shallow::Dict(entries) => new_dict(ctx.heap, entries),
    }
}

fn length_getter(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Value {
    match value_length(ctx.heap, args[0]) {
        Some(len) => Value::Number(len as f64),
        None => type_error(ctx.heap, "Receiver has no length."),
    }
}
