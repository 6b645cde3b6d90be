//! The object heap and its flip-bit mark-sweep collector
//!
//! Objects live in a slot arena addressed by `ObjRef` handles; a free list
//! recycles swept slots. "Marked" means the object's colour equals the
//! heap's current polarity, which flips after every collection, so survivors
//! need no reset pass. Allocation never collects on its own: callers check
//! [`Heap::should_collect`] at safe points and pass their roots in through
//! [`GcRoots`], because only the VM (stack, frames, globals, open upvalues)
//! and the compiler chain (functions under construction) know what is live.

use crate::object::{Obj, ObjKind, ObjRef, StringObj};
use crate::table::{Table, hash_str};
use crate::value::{Value, format_number};
use crate::error::ExceptionKind;
use tracing::debug;

/// Heap growth factor applied after each collection.
const GC_HEAP_GROW_FACTOR: usize = 2;
/// First collection threshold.
const GC_FIRST_THRESHOLD: usize = 1024 * 1024;

/// Root providers: the VM during execution, the compiler chain during
/// compilation, `()` when nothing outside the heap holds references.
pub trait GcRoots {
    fn mark(&self, heap: &mut Heap);
}

impl GcRoots for () {
    fn mark(&self, _heap: &mut Heap) {}
}

/// The slot arena. Split out of `Heap` so tables (which need object access
/// for hashing and key comparison) can borrow it while their owner borrows
/// the rest of the heap.
#[derive(Debug, Default)]
pub struct Objects {
    slots: Vec<Option<Obj>>,
}

impl Objects {
    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slots[r.index()].as_ref().expect("stale object handle")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.index()].as_mut().expect("stale object handle")
    }

    pub fn contains(&self, r: ObjRef) -> bool {
        self.slots
            .get(r.index())
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Content of a string object. Panics on a non-string handle; callers
    /// hold kind invariants from the allocation site.
    pub fn as_string(&self, r: ObjRef) -> &str {
        match &self.get(r).kind {
            ObjKind::String(s) => &s.chars,
            _ => unreachable!("handle is not a string"),
        }
    }
}

/// VM-wide pinned handles: the built-in classes methods dispatch through,
/// and the interned `__init__` name. Populated once at VM startup.
#[derive(Debug, Default)]
pub struct Builtins {
    pub string_class: Option<ObjRef>,
    pub list_class: Option<ObjRef>,
    pub dict_class: Option<ObjRef>,
    pub file_class: Option<ObjRef>,
    pub container_class: Option<ObjRef>,
    pub init_string: Option<ObjRef>,
}

impl Builtins {
    fn refs(&self) -> impl Iterator<Item = ObjRef> {
        [
            self.string_class,
            self.list_class,
            self.dict_class,
            self.file_class,
            self.container_class,
            self.init_string,
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug)]
pub struct Heap {
    pub objects: Objects,
    free: Vec<u32>,
    /// Intern set: every live string, keyed by content hash. The entries
    /// are weak: unmarked strings are cleared between trace and sweep.
    pub strings: Table,
    pub builtins: Builtins,
    bytes_allocated: usize,
    next_gc: usize,
    /// Current live colour; flips after every sweep
    mark: bool,
    gray: Vec<ObjRef>,
    /// Collect at every safe point (test/diagnostic mode)
    pub stress: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Objects::default(),
            free: Vec::new(),
            strings: Table::new(),
            builtins: Builtins::default(),
            bytes_allocated: 0,
            next_gc: GC_FIRST_THRESHOLD,
            mark: true,
            gray: Vec::new(),
            stress: false,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// True when the next safe point should run a collection.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        let obj = Obj {
            // New objects start white for the current cycle.
            marked: !self.mark,
            kind,
        };
        self.bytes_allocated += size_hint(&obj);
        match self.free.pop() {
            Some(index) => {
                self.objects.slots[index as usize] = Some(obj);
                ObjRef(index)
            }
            None => {
                self.objects.slots.push(Some(obj));
                ObjRef((self.objects.slots.len() - 1) as u32)
            }
        }
    }

    /// Intern a string: equal content always yields the same handle, so
    /// string equality reduces to handle identity.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_str(chars);
        if let Some(existing) = self.strings.find_string(&self.objects, chars, hash) {
            return existing;
        }
        let r = self.alloc(ObjKind::String(StringObj {
            chars: chars.into(),
            hash,
        }));
        let Heap {
            strings, objects, ..
        } = self;
        strings.set(objects, Value::Obj(r), Value::Nil);
        r
    }

    pub fn take_string(&mut self, chars: String) -> ObjRef {
        self.intern(&chars)
    }

    pub fn string_value(&mut self, chars: &str) -> Value {
        Value::Obj(self.intern(chars))
    }

    /// Build the sentinel failure value natives return.
    pub fn error_value(&mut self, kind: ExceptionKind, message: &str) -> Value {
        let message = self.intern(message);
        let r = self.alloc(ObjKind::Error(crate::object::ErrorObj { kind, message }));
        Value::Error(r)
    }

    // --- marking ---------------------------------------------------------

    pub fn mark_ref(&mut self, r: ObjRef) {
        let mark = self.mark;
        let Some(slot) = self.objects.slots.get_mut(r.index()) else {
            return;
        };
        let Some(obj) = slot.as_mut() else { return };
        if obj.marked == mark {
            return;
        }
        obj.marked = mark;
        // Strings and natives have no outgoing references; skip the worklist.
        match obj.kind {
            ObjKind::String(_) | ObjKind::Native(_) | ObjKind::NativeProperty(_) => {}
            _ => self.gray.push(r),
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Some(r) = value.obj_ref() {
            self.mark_ref(r);
        }
    }

    /// Mark every key and value of a table held outside the heap (globals).
    pub fn mark_table(&mut self, table: &Table) {
        let pairs: Vec<(Value, Value)> = table.iter().collect();
        for (k, v) in pairs {
            self.mark_value(k);
            self.mark_value(v);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        let mut refs: Vec<ObjRef> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        match &self.objects.get(r).kind {
            // Leaves never reach the worklist.
            ObjKind::String(_) | ObjKind::Native(_) | ObjKind::NativeProperty(_) => {}
            ObjKind::Function(f) => {
                refs.extend(f.name);
                refs.extend(f.file);
                values.extend_from_slice(&f.chunk.constants);
            }
            ObjKind::Closure(c) => {
                refs.push(c.function);
                refs.extend_from_slice(&c.upvalues);
            }
            ObjKind::Upvalue(u) => {
                if let crate::object::UpvalueState::Closed(v) = u.state {
                    values.push(v);
                }
            }
            ObjKind::Class(c) => {
                refs.push(c.name);
                refs.extend(c.superclass);
                for (k, v) in c.methods.iter().chain(c.properties.iter()) {
                    values.push(k);
                    values.push(v);
                }
            }
            ObjKind::Instance(i) => {
                refs.push(i.class);
                for (k, v) in i.fields.iter() {
                    values.push(k);
                    values.push(v);
                }
            }
            ObjKind::BoundMethod(b) => {
                values.push(b.receiver);
                refs.push(b.method);
            }
            ObjKind::List(l) => {
                refs.push(l.class);
                values.extend_from_slice(&l.items);
            }
            ObjKind::Dict(d) => {
                refs.push(d.class);
                for (k, v) in d.entries.iter() {
                    values.push(k);
                    values.push(v);
                }
            }
            ObjKind::Enum(e) => {
                refs.push(e.name);
                for (k, v) in e.members.iter() {
                    values.push(k);
                    values.push(v);
                }
            }
            ObjKind::File(f) => refs.push(f.path),
            ObjKind::Module(m) => {
                refs.push(m.name);
                for (k, v) in m.members.iter() {
                    values.push(k);
                    values.push(v);
                }
            }
            ObjKind::Error(e) => refs.push(e.message),
        }
        for child in refs {
            self.mark_ref(child);
        }
        for value in values {
            self.mark_value(value);
        }
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn sweep(&mut self) {
        let mark = self.mark;
        let mut freed = 0usize;
        for (index, slot) in self.objects.slots.iter_mut().enumerate() {
            let Some(obj) = slot.as_ref() else { continue };
            if obj.marked == mark {
                continue;
            }
            // Natives are pinned statics; sweep skips them.
            if matches!(obj.kind, ObjKind::Native(_) | ObjKind::NativeProperty(_)) {
                continue;
            }
            freed += size_hint(obj);
            *slot = None;
            self.free.push(index as u32);
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
    }

    /// Run a full collection: mark builtins and caller roots, trace, clear
    /// dead interned strings, sweep, rescale the threshold, flip polarity.
    pub fn collect(&mut self, roots: &dyn GcRoots) {
        let before = self.bytes_allocated;
        for r in self.builtins.refs().collect::<Vec<_>>() {
            self.mark_ref(r);
        }
        roots.mark(self);
        self.trace_references();
        let Heap {
            strings,
            objects,
            mark,
            ..
        } = self;
        strings.remove_white(objects, *mark);
        self.sweep();
        self.next_gc = self.bytes_allocated.max(1) * GC_HEAP_GROW_FACTOR;
        self.mark = !self.mark;
        debug!(
            before,
            after = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc cycle"
        );
    }

    pub fn collect_if_needed(&mut self, roots: &dyn GcRoots) {
        if self.should_collect() {
            self.collect(roots);
        }
    }

    // --- tables owned by heap objects ------------------------------------

    /// Read from a table living inside a heap object.
    pub fn table_get(&self, owner: ObjRef, slot: TableSlot, key: Value) -> Option<Value> {
        table_slot_ref(&self.objects.get(owner).kind, slot).get(&self.objects, key)
    }

    /// Insert into a table living inside a heap object. The table is moved
    /// out for the duration of the insert because hashing its key needs the
    /// arena; nothing in `Table::set` can allocate, so no collection can
    /// observe the gap.
    pub fn table_insert(&mut self, owner: ObjRef, slot: TableSlot, key: Value, value: Value) -> bool {
        let mut table = std::mem::take(table_slot_mut(&mut self.objects.get_mut(owner).kind, slot));
        let is_new = table.set(&self.objects, key, value);
        *table_slot_mut(&mut self.objects.get_mut(owner).kind, slot) = table;
        is_new
    }

    pub fn table_remove(&mut self, owner: ObjRef, slot: TableSlot, key: Value) -> bool {
        let mut table = std::mem::take(table_slot_mut(&mut self.objects.get_mut(owner).kind, slot));
        let removed = table.delete(&self.objects, key);
        *table_slot_mut(&mut self.objects.get_mut(owner).kind, slot) = table;
        removed
    }

    // --- semantics shared by the VM and natives --------------------------

    /// Falsiness: nil, false, 0, empty string, empty list, empty dict.
    pub fn is_falsey(&self, value: Value) -> bool {
        match value {
            Value::Nil | Value::Bool(false) | Value::Empty => true,
            Value::Number(n) => n == 0.0,
            Value::Bool(true) | Value::Error(_) => false,
            Value::Obj(r) => match &self.objects.get(r).kind {
                ObjKind::String(s) => s.chars.is_empty(),
                ObjKind::List(l) => l.items.is_empty(),
                ObjKind::Dict(d) => d.entries.is_empty(),
                _ => false,
            },
        }
    }

    /// Structural equality: recursive for lists, identity for strings (they
    /// are interned) and every other object kind.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Obj(ra), Value::Obj(rb)) => {
                if ra == rb {
                    return true;
                }
                match (&self.objects.get(ra).kind, &self.objects.get(rb).kind) {
                    (ObjKind::List(la), ObjKind::List(lb)) => {
                        la.items.len() == lb.items.len()
                            && la
                                .items
                                .iter()
                                .zip(lb.items.iter())
                                .all(|(x, y)| self.values_equal(*x, *y))
                    }
                    _ => false,
                }
            }
            _ => a == b,
        }
    }

    pub fn type_name(&self, value: Value) -> &'static str {
        match value {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Empty => "empty",
            Value::Error(_) => "error",
            Value::Obj(r) => self.objects.get(r).kind.type_name(),
        }
    }

    /// User-visible rendering, the canonical `str()` rule.
    pub fn stringify(&self, value: Value) -> String {
        let mut seen = Vec::new();
        self.stringify_inner(value, false, &mut seen)
    }

    fn stringify_inner(&self, value: Value, quoted: bool, seen: &mut Vec<ObjRef>) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Empty => "<empty>".to_string(),
            Value::Error(r) => match &self.objects.get(r).kind {
                ObjKind::Error(e) => format!("<error: {}>", self.objects.as_string(e.message)),
                _ => "<error>".to_string(),
            },
            Value::Obj(r) => {
                if seen.contains(&r) {
                    return "...".to_string();
                }
                match &self.objects.get(r).kind {
                    ObjKind::String(s) => {
                        if quoted {
                            format!("\"{}\"", s.chars)
                        } else {
                            s.chars.to_string()
                        }
                    }
                    ObjKind::Function(f) => match f.name {
                        Some(name) => format!("<fn {}>", self.objects.as_string(name)),
                        None => "<script>".to_string(),
                    },
                    ObjKind::Closure(c) => {
                        self.stringify_inner(Value::Obj(c.function), quoted, seen)
                    }
                    ObjKind::Upvalue(_) => "<upvalue>".to_string(),
                    ObjKind::Class(c) => {
                        format!("<class {}>", self.objects.as_string(c.name))
                    }
                    ObjKind::Instance(i) => match &self.objects.get(i.class).kind {
                        ObjKind::Class(c) => {
                            format!("<{} instance>", self.objects.as_string(c.name))
                        }
                        _ => "<instance>".to_string(),
                    },
                    ObjKind::BoundMethod(b) => {
                        self.stringify_inner(Value::Obj(b.method), quoted, seen)
                    }
                    ObjKind::List(l) => {
                        seen.push(r);
                        let body = l
                            .items
                            .iter()
                            .map(|v| self.stringify_inner(*v, true, seen))
                            .collect::<Vec<_>>()
                            .join(", ");
                        seen.pop();
                        format!("[{body}]")
                    }
                    ObjKind::Dict(d) => {
                        seen.push(r);
                        let body = d
                            .entries
                            .iter()
                            .map(|(k, v)| {
                                format!(
                                    "{}: {}",
                                    self.stringify_inner(k, true, seen),
                                    self.stringify_inner(v, true, seen)
                                )
                            })
                            .collect::<Vec<_>>()
                            .join(", ");
                        seen.pop();
                        format!("{{{body}}}")
                    }
                    ObjKind::Enum(e) => format!("<enum {}>", self.objects.as_string(e.name)),
                    ObjKind::File(f) => format!("<file {}>", self.objects.as_string(f.path)),
                    ObjKind::Module(m) => {
                        format!("<module {}>", self.objects.as_string(m.name))
                    }
                    ObjKind::Native(n) => format!("<native fn {}>", n.name),
                    ObjKind::NativeProperty(p) => format!("<native property {}>", p.name),
                    ObjKind::Error(e) => {
                        format!("<error: {}>", self.objects.as_string(e.message))
                    }
                }
            }
        }
    }
}

/// Selects which table of a heap object `Heap::table_*` operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSlot {
    /// Class method table
    Methods,
    /// Class native-property table
    Properties,
    /// Instance fields
    Fields,
    /// Dict entries
    Entries,
    /// Enum or module members
    Members,
}

fn table_slot_ref(kind: &ObjKind, slot: TableSlot) -> &Table {
    match (kind, slot) {
        (ObjKind::Class(c), TableSlot::Methods) => &c.methods,
        (ObjKind::Class(c), TableSlot::Properties) => &c.properties,
        (ObjKind::Instance(i), TableSlot::Fields) => &i.fields,
        (ObjKind::Dict(d), TableSlot::Entries) => &d.entries,
        (ObjKind::Enum(e), TableSlot::Members) => &e.members,
        (ObjKind::Module(m), TableSlot::Members) => &m.members,
        _ => unreachable!("table slot does not match object kind"),
    }
}

fn table_slot_mut(kind: &mut ObjKind, slot: TableSlot) -> &mut Table {
    match (kind, slot) {
        (ObjKind::Class(c), TableSlot::Methods) => &mut c.methods,
        (ObjKind::Class(c), TableSlot::Properties) => &mut c.properties,
        (ObjKind::Instance(i), TableSlot::Fields) => &mut i.fields,
        (ObjKind::Dict(d), TableSlot::Entries) => &mut d.entries,
        (ObjKind::Enum(e), TableSlot::Members) => &mut e.members,
        (ObjKind::Module(m), TableSlot::Members) => &mut m.members,
        _ => unreachable!("table slot does not match object kind"),
    }
}

fn size_hint(obj: &Obj) -> usize {
    let base = std::mem::size_of::<Obj>();
    let value = std::mem::size_of::<Value>();
    base + match &obj.kind {
        ObjKind::String(s) => s.chars.len(),
        ObjKind::Function(f) => {
            f.chunk.code.capacity() + f.chunk.constants.capacity() * value
        }
        ObjKind::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
        ObjKind::List(l) => l.items.capacity() * value,
        ObjKind::Dict(d) => d.entries.len() * value * 2,
        ObjKind::Class(c) => (c.methods.len() + c.properties.len()) * value * 2,
        ObjKind::Instance(i) => i.fields.len() * value * 2,
        ObjKind::Enum(e) => e.members.len() * value * 2,
        ObjKind::Module(m) => m.members.len() * value * 2,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ListObj, UpvalueObj, UpvalueState};

    struct ValueRoots(Vec<Value>);

    impl GcRoots for ValueRoots {
        fn mark(&self, heap: &mut Heap) {
            for v in &self.0 {
                heap.mark_value(*v);
            }
        }
    }

    #[test]
    fn test_interning_dedupes() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new();
        let list_class = heap.intern("list");
        let live = heap.alloc(ObjKind::List(ListObj {
            class: list_class,
            items: vec![Value::Number(1.0)],
        }));
        let dead = heap.alloc(ObjKind::List(ListObj {
            class: list_class,
            items: Vec::new(),
        }));
        heap.collect(&ValueRoots(vec![Value::Obj(live)]));
        assert!(heap.objects.contains(live));
        assert!(!heap.objects.contains(dead));
    }

    #[test]
    fn test_roots_keep_transitive_references() {
        let mut heap = Heap::new();
        let s = heap.intern("payload");
        let list_class = heap.intern("list");
        let inner = heap.alloc(ObjKind::List(ListObj {
            class: list_class,
            items: vec![Value::Obj(s)],
        }));
        let outer = heap.alloc(ObjKind::List(ListObj {
            class: list_class,
            items: vec![Value::Obj(inner)],
        }));
        for _ in 0..3 {
            heap.collect(&ValueRoots(vec![Value::Obj(outer)]));
        }
        assert!(heap.objects.contains(inner));
        assert_eq!(heap.objects.as_string(s), "payload");
    }

    #[test]
    fn test_dead_strings_leave_intern_set() {
        let mut heap = Heap::new();
        heap.intern("transient");
        heap.collect(&ValueRoots(vec![]));
        let hash = hash_str("transient");
        assert!(
            heap.strings
                .find_string(&heap.objects, "transient", hash)
                .is_none()
        );
        // Re-interning after the sweep builds a fresh object.
        let again = heap.intern("transient");
        assert!(heap.objects.contains(again));
    }

    #[test]
    fn test_closed_upvalue_keeps_value_alive() {
        let mut heap = Heap::new();
        let s = heap.intern("captured");
        let upvalue = heap.alloc(ObjKind::Upvalue(UpvalueObj {
            state: UpvalueState::Closed(Value::Obj(s)),
        }));
        heap.collect(&ValueRoots(vec![Value::Obj(upvalue)]));
        assert_eq!(heap.objects.as_string(s), "captured");
    }

    #[test]
    fn test_mark_polarity_flips_between_cycles() {
        let mut heap = Heap::new();
        let live = heap.intern("still-here");
        let roots = ValueRoots(vec![Value::Obj(live)]);
        heap.collect(&roots);
        heap.collect(&roots);
        heap.collect(&roots);
        assert!(heap.objects.contains(live));
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = Heap::new();
        let list_class = heap.intern("list");
        let a = heap.alloc(ObjKind::List(ListObj {
            class: list_class,
            items: Vec::new(),
        }));
        let b = heap.alloc(ObjKind::List(ListObj {
            class: list_class,
            items: vec![Value::Obj(a)],
        }));
        match &mut heap.objects.get_mut(a).kind {
            ObjKind::List(l) => l.items.push(Value::Obj(b)),
            _ => unreachable!(),
        }
        heap.collect(&ValueRoots(vec![]));
        assert!(!heap.objects.contains(a));
        assert!(!heap.objects.contains(b));
    }

    #[test]
    fn test_structural_list_equality() {
        let mut heap = Heap::new();
        let list_class = heap.intern("list");
        let one = heap.string_value("one");
        let a = heap.alloc(ObjKind::List(ListObj {
            class: list_class,
            items: vec![Value::Number(1.0), one],
        }));
        let one_again = heap.string_value("one");
        let b = heap.alloc(ObjKind::List(ListObj {
            class: list_class,
            items: vec![Value::Number(1.0), one_again],
        }));
        assert!(heap.values_equal(Value::Obj(a), Value::Obj(b)));
    }

    #[test]
    fn test_falsiness_table() {
        let mut heap = Heap::new();
        let empty_s = heap.string_value("");
        let full_s = heap.string_value("x");
        assert!(heap.is_falsey(Value::Nil));
        assert!(heap.is_falsey(Value::Bool(false)));
        assert!(heap.is_falsey(Value::Number(0.0)));
        assert!(heap.is_falsey(empty_s));
        assert!(!heap.is_falsey(full_s));
        assert!(!heap.is_falsey(Value::Number(0.5)));
    }
}
