//! The per-lane VM heap: globals, registry, lookup database and deep-proxy
//! cache, plus the one-time ownership handoff from the constructing
//! thread to the worker thread that actually runs it (spec.md §4.8.2).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::deep::DeepPrelude;
use crate::lookup::LookupDb;
use crate::table::Table;
use crate::value::Value;

/// A single VM heap. Every field here is `Rc`-based and therefore `!Send`:
/// this mirrors a bare interpreter state, which is safe to use from
/// exactly one OS thread at a time but carries no thread affinity of its
/// own (SPEC_FULL.md §B).
pub struct Vm {
    pub globals: Table,
    /// The registry: process-local key/value storage addressed by
    /// [`crate::unique_key::UniqueKey`] (C1), not reachable from script
    /// code directly.
    registry: HashMap<u64, Value>,
    pub lookup_db: LookupDb,
    /// Deep object identity -> existing proxy, so that copying the same
    /// deep object into this VM twice yields the same `Value::Deep` proxy
    /// rather than two independent ones (spec.md §4.4 "proxy caching").
    proxy_cache: HashMap<usize, Weak<DeepPrelude>>,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            globals: Table::new(),
            registry: HashMap::new(),
            lookup_db: LookupDb::new(),
            proxy_cache: HashMap::new(),
        }
    }

    pub fn registry_get(&self, key: &crate::unique_key::UniqueKey) -> Option<&Value> {
        self.registry.get(&key.id())
    }

    pub fn registry_set(&mut self, key: &crate::unique_key::UniqueKey, value: Value) {
        self.registry.insert(key.id(), value);
    }

    /// Returns a cached proxy for `prelude` if one is already live in this
    /// VM, cloning the `Arc` (and so bumping the cross-VM refcount).
    pub fn cached_proxy(&mut self, identity: usize) -> Option<Arc<DeepPrelude>> {
        match self.proxy_cache.get(&identity).and_then(Weak::upgrade) {
            Some(p) => Some(p),
            None => {
                self.proxy_cache.remove(&identity);
                None
            }
        }
    }

    pub fn cache_proxy(&mut self, identity: usize, proxy: &Arc<DeepPrelude>) {
        self.proxy_cache.insert(identity, Arc::downgrade(proxy));
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// A one-shot wrapper allowing a freshly built [`Vm`] to move from the
/// thread that constructed it onto the OS thread that will exclusively
/// own and run it (spec.md §4.8.2 step 1: "the VM is built on the calling
/// thread, then handed to the new thread before the lane body starts").
///
/// # Safety
/// Sound only because the lane construction protocol guarantees the
/// constructing thread drops every reference to the `Vm` before the
/// worker thread's first access; no two threads ever touch it
/// concurrently. This is the same contract the original C implementation
/// relies on when it builds `lua_State*` on one thread and resumes it on
/// another (`original_source/src/threading.h`).
pub struct VmHandoff(pub Vm);

unsafe impl Send for VmHandoff {}

impl VmHandoff {
    pub fn new(vm: Vm) -> Self {
        Self(vm)
    }

    pub fn into_inner(self) -> Vm {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unique_key::keys;

    #[test]
    fn registry_round_trips() {
        let mut vm = Vm::new();
        vm.registry_set(&keys::NIL_SENTINEL, Value::Boolean(true));
        assert_eq!(vm.registry_get(&keys::NIL_SENTINEL), Some(&Value::Boolean(true)));
    }

    #[test]
    fn handoff_moves_across_threads() {
        let vm = Vm::new();
        let handoff = VmHandoff::new(vm);
        let joined = std::thread::spawn(move || {
            let vm = handoff.into_inner();
            vm.globals.len()
        })
        .join()
        .unwrap();
        assert_eq!(joined, 0);
    }
}
