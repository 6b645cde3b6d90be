//! slo core: the value model, heap, and bytecode containers
//!
//! Key design principles:
//! - `Value`: what the language talks about (nil, bool, number, object ref)
//! - `Obj`: heap payloads behind `ObjRef` handles owned by the `Heap`
//! - `Chunk`: bytecode plus constants plus a run-length line map
//! - The collector is an explicit flip-bit mark-sweep over the object arena;
//!   reachability is decided by root walks, never by reference counts

pub mod chunk;
pub mod error;
pub mod heap;
pub mod object;
pub mod opcode;
pub mod table;
pub mod value;

pub use chunk::Chunk;
pub use error::{ExceptionKind, SloError, TraceFrame};
pub use heap::{GcRoots, Heap, Objects, TableSlot};
pub use object::{
    BoundMethodObj, ClassObj, ClosureObj, DictObj, EnumObj, ErrorObj, FileMode, FileObj,
    FunctionObj, InstanceObj, ListObj, ModuleObj, NativeCtx, NativeFn, NativeObj,
    NativePropertyObj, Obj, ObjKind, ObjRef, StringObj, UpvalueObj, UpvalueState,
};
pub use opcode::OpCode;
pub use table::Table;
pub use value::Value;
