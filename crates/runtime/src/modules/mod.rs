//! Built-in modules resolved by the loader's hard-coded switch
//!
//! Each module is a named table of members: natives for the functions,
//! plain values for constants. Loading is idempotent; the VM binds both the
//! canonical name and any alias to the same module object.

pub mod json;
pub mod math;
pub mod os;
pub mod random;

use slo_core::heap::Heap;
use slo_core::object::{ModuleObj, ObjKind, ObjRef};
use slo_core::table::Table;

pub(crate) fn make_module(
    heap: &mut Heap,
    name: &'static str,
    build: impl FnOnce(&mut Heap, &mut Table),
) -> ObjRef {
    let mut members = Table::new();
    build(heap, &mut members);
    let name_ref = heap.intern(name);
    heap.alloc(ObjKind::Module(ModuleObj {
        name: name_ref,
        members,
    }))
}
