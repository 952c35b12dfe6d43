//! Deep userdata operations (C4): construction, proxy caching per VM, and
//! typed access back to the payload, grounded on
//! `original_source/src/deep.c`'s `luaG_newdeepuserdata` /
//! `push_deep_proxy` / `luaG_todeep` trio.

use std::any::Any;
use std::sync::Arc;

use lanes_core::{DeepFactory, DeepPrelude, Table, Value, Vm};
use lanes_error::Error;

/// Builds a brand-new deep object and returns the proxy [`Value`] for it.
/// The caller's VM becomes the first holder of the shared prelude; no
/// proxy caching is needed yet since there is exactly one reference.
pub fn new_deep_userdata<T>(factory: &'static dyn DeepFactory, payload: T) -> Value
where
    T: Any + Send + Sync,
{
    let prelude = Arc::new(DeepPrelude::new(factory, Box::new(payload)));
    Value::Deep(prelude)
}

/// Produces the proxy for `prelude` inside `vm`, reusing a cached one if
/// this VM has already seen this exact deep object (spec.md §4.4: "a
/// second copy of the same deep object into one VM yields the same proxy
/// identity as the first").
pub fn push_deep_proxy(vm: &mut Vm, prelude: &Arc<DeepPrelude>) -> Value {
    let identity = Arc::as_ptr(prelude) as usize;
    if let Some(existing) = vm.cached_proxy(identity) {
        return Value::Deep(existing);
    }
    let owned = Arc::clone(prelude);
    vm.cache_proxy(identity, &owned);
    Value::Deep(owned)
}

/// Recovers a typed reference to a deep object's payload. Fails if
/// `value` is not a deep proxy at all, or if it was produced by a
/// different factory/type than `T` (spec.md §4.4 edge case: "passing a
/// deep proxy to a method that expects a different factory's object is a
/// type error, not a panic").
pub fn to_deep<T: Any>(value: &Value) -> Result<&T, Error> {
    match value {
        Value::Deep(prelude) => prelude
            .downcast_ref::<T>()
            .ok_or_else(|| Error::other("deep userdata type mismatch")),
        other => Err(Error::other(format!(
            "expected a deep userdata, got {}",
            other.type_name()
        ))),
    }
}

/// Builds the metatable a proxy should carry, by resolving every name the
/// factory advertises to its native implementation and installing it as a
/// table entry (spec.md §4.4: "the proxy's metatable is built fresh in
/// each VM from the factory's method table, never copied").
pub fn build_proxy_metatable(factory: &'static dyn DeepFactory) -> Table {
    let mt = Table::new();
    for name in factory.method_names() {
        if let Some(native) = factory.method(name) {
            mt.set(Value::str(*name), Value::Function(lanes_core::FunctionRef::Native(native)));
        }
    }
    mt
}
