//! The allocator shim (C3): how a new VM's memory allocator is derived
//! from its creator (spec.md §4.3, grounded on
//! `original_source/src/allocator.h`'s `AllocatorDefinition` and
//! `original_source/src/universe.h`'s `ProtectedAllocator_s`).

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// An explicit allocator record: the `allocF`/`allocUD` pair spec.md §4.3
/// describes, collapsed into one Rust closure since this runtime has no
/// `void*` userdata to thread through separately.
#[derive(Clone)]
pub struct AllocatorDefinition {
    alloc: Arc<dyn Fn(usize) -> Vec<u8> + Send + Sync>,
    free: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
}

impl AllocatorDefinition {
    pub fn new(
        alloc: impl Fn(usize) -> Vec<u8> + Send + Sync + 'static,
        free: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> Self {
        Self { alloc: Arc::new(alloc), free: Arc::new(free) }
    }

    pub fn alloc(&self, size: usize) -> Vec<u8> {
        (self.alloc)(size)
    }

    pub fn free(&self, buf: Vec<u8>) {
        (self.free)(buf)
    }
}

impl fmt::Debug for AllocatorDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AllocatorDefinition")
    }
}

/// Wraps an [`AllocatorDefinition`] so every allocation call, across every
/// VM sharing this wrapper, is serialized through one mutex (spec.md §4.3
/// "protected allocator"; grounded on `original_source/src/universe.h`'s
/// `ProtectedAllocator_s`, which pairs a `MUTEX_T` with the definition it
/// protects). There is no byte quota here: the original's protected
/// allocator exists purely for allocators that are not themselves
/// thread-safe, not to enforce a memory ceiling.
#[derive(Clone)]
pub struct ProtectedAllocator {
    inner: Arc<Mutex<AllocatorDefinition>>,
}

impl ProtectedAllocator {
    pub fn new(definition: AllocatorDefinition) -> Self {
        Self { inner: Arc::new(Mutex::new(definition)) }
    }

    pub fn alloc(&self, size: usize) -> Vec<u8> {
        self.inner.lock().alloc(size)
    }

    pub fn free(&self, buf: Vec<u8>) {
        self.inner.lock().free(buf)
    }
}

/// Selects where a new VM's allocator comes from.
#[derive(Clone, Default)]
pub enum AllocatorConfig {
    /// Use the host's default allocator unmodified (spec.md default).
    #[default]
    Inherit,
    /// Calls `factory` once per VM created to obtain an explicit
    /// allocator record (spec.md §4.3: "Configuration may alternatively
    /// supply a factory callback returning an explicit allocator
    /// record"). A plain function pointer rather than a closure: the
    /// original requires "this callback must have no upvalues", since
    /// it runs before the destination VM exists to own any captured
    /// state.
    Factory(fn() -> AllocatorDefinition),
    /// Serializes every allocation call through a single mutex shared by
    /// every VM given the same [`ProtectedAllocator`] (spec.md §4.3
    /// "protected allocator"; §6 `shallocator`).
    Protected(ProtectedAllocator),
}
