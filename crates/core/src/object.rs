//! Heap object payloads
//!
//! Every heap object is an `Obj`: a header (mark state) plus an `ObjKind`
//! payload. Objects reference each other through `ObjRef` handles into the
//! arena owned by [`crate::heap::Heap`]; the collector, not ownership, decides
//! lifetimes, so cyclic graphs (class -> method -> upvalue -> instance ->
//! class) are fine.

use crate::chunk::Chunk;
use crate::error::ExceptionKind;
use crate::heap::Heap;
use crate::table::Table;
use crate::value::Value;
use std::fmt;
use std::fs;
use std::io::Write;

/// Handle to a heap object: an index into the heap's slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Context handed to native functions: the heap for allocation and the
/// interpreter's output sink (so `print` is capturable in tests).
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub out: &'a mut dyn Write,
}

/// Host function signature: `(ctx, argv) -> Value`. Method natives receive
/// the receiver as `argv[0]`. Failures are reported by returning a
/// `Value::Error` built with [`Heap::error_value`], never by panicking.
pub type NativeFn = fn(&mut NativeCtx<'_>, &[Value]) -> Value;

#[derive(Debug)]
pub struct Obj {
    /// Mark colour; "live" means equal to the heap's current mark polarity.
    pub(crate) marked: bool,
    pub kind: ObjKind,
}

#[derive(Debug)]
pub enum ObjKind {
    String(StringObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    List(ListObj),
    Dict(DictObj),
    Enum(EnumObj),
    File(FileObj),
    Module(ModuleObj),
    Native(NativeObj),
    NativeProperty(NativePropertyObj),
    Error(ErrorObj),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::String(_) => "string",
            ObjKind::Function(_) | ObjKind::Closure(_) => "function",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "method",
            ObjKind::List(_) => "list",
            ObjKind::Dict(_) => "dict",
            ObjKind::Enum(_) => "enum",
            ObjKind::File(_) => "file",
            ObjKind::Module(_) => "module",
            ObjKind::Native(_) | ObjKind::NativeProperty(_) => "native",
            ObjKind::Error(_) => "error",
        }
    }
}

/// Immutable interned string: byte content plus its precomputed FNV-1a hash.
#[derive(Debug)]
pub struct StringObj {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function: arity, upvalue count, owned chunk, and the
/// interned name/file strings used in stack traces.
#[derive(Debug)]
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: usize,
    /// None for the top-level script function
    pub name: Option<ObjRef>,
    pub file: Option<ObjRef>,
    pub chunk: Chunk,
}

impl FunctionObj {
    pub fn new(name: Option<ObjRef>, file: Option<ObjRef>) -> Self {
        FunctionObj {
            arity: 0,
            upvalue_count: 0,
            name,
            file,
            chunk: Chunk::new(),
        }
    }
}

/// The only callable runtime form of a function: the function plus its
/// captured upvalues (length equals the function's upvalue count).
#[derive(Debug)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable. Open while the referenced stack slot is live, closed
/// (owning its value inline) afterwards. The open->closed transition happens
/// exactly once, when the slot leaves scope.
#[derive(Debug)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Index into the VM operand stack
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ClassObj {
    pub name: ObjRef,
    pub superclass: Option<ObjRef>,
    /// name -> closure or native
    pub methods: Table,
    /// name -> host getter
    pub properties: Table,
}

impl ClassObj {
    pub fn new(name: ObjRef) -> Self {
        ClassObj {
            name,
            superclass: None,
            methods: Table::new(),
            properties: Table::new(),
        }
    }
}

#[derive(Debug)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Table,
}

/// A class method closed over a specific receiver for deferred invocation.
#[derive(Debug)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

/// Growable sequence. Carries its class handle so method dispatch on list
/// receivers goes through the ordinary method-table path.
#[derive(Debug)]
pub struct ListObj {
    pub class: ObjRef,
    pub items: Vec<Value>,
}

#[derive(Debug)]
pub struct DictObj {
    pub class: ObjRef,
    pub entries: Table,
}

/// Symbolic name -> numeric ordinal.
#[derive(Debug)]
pub struct EnumObj {
    pub name: ObjRef,
    pub members: Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

impl FileMode {
    pub fn parse(mode: &str) -> Option<FileMode> {
        match mode {
            "r" => Some(FileMode::Read),
            "w" => Some(FileMode::Write),
            "a" => Some(FileMode::Append),
            _ => None,
        }
    }
}

/// Platform file handle. `handle == None` means closed; dropping the object
/// at sweep time closes any still-open handle.
#[derive(Debug)]
pub struct FileObj {
    pub path: ObjRef,
    pub mode: FileMode,
    pub handle: Option<fs::File>,
}

impl FileObj {
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

/// A named table of exported members resolved by `import`.
#[derive(Debug)]
pub struct ModuleObj {
    pub name: ObjRef,
    pub members: Table,
}

/// Host-implemented function. Arity metadata is kept for mismatch messages;
/// natives self-validate rather than relying on the VM.
pub struct NativeObj {
    pub name: &'static str,
    pub function: NativeFn,
    pub arity_min: u8,
    pub arity_max: u8,
}

impl fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

/// Zero-argument host getter invoked through `GET_PROPERTY`.
pub struct NativePropertyObj {
    pub name: &'static str,
    pub getter: NativeFn,
}

impl fmt::Debug for NativePropertyObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native property {}>", self.name)
    }
}

/// Payload of a `Value::Error`: the exception kind the VM should surface
/// plus the interned message string.
#[derive(Debug)]
pub struct ErrorObj {
    pub kind: ExceptionKind,
    pub message: ObjRef,
}
