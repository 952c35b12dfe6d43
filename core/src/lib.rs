//! `lanes-core`: the value model, per-VM heap, unique-key registry, the
//! function lookup database, and the allocator shim shared by every other
//! crate in the workspace (C1, C2, C3).

pub mod allocator;
pub mod cancel;
pub mod deep;
pub mod function;
pub mod handoff;
pub mod lookup;
pub mod table;
pub mod unique_key;
pub mod value;
pub mod vm;

pub use allocator::{AllocatorConfig, AllocatorDefinition, ProtectedAllocator};
pub use cancel::CancelRequest;
pub use deep::{DeepFactory, DeepPrelude, LookupMode};
pub use function::{BytecodeFunction, Chunk, FunctionRef, NativeFn, NativeFunction};
pub use handoff::Handoff;
pub use lookup::LookupDb;
pub use table::{Table, ValueKey};
pub use unique_key::{keys, UniqueKey};
pub use value::{ClonableUserdata, Value};
pub use vm::{Vm, VmHandoff};
