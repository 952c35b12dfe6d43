//! The inter-state copier (C5): deep, cycle-safe translation of values
//! from one VM's heap into another's, grounded on
//! `original_source/src/intercopycontext.h`'s `InterCopyContext`.

use std::collections::HashMap;

use lanes_core::{BytecodeFunction, Chunk, ClonableUserdata, FunctionRef, Table, Value, Vm};
use lanes_deep::push_deep_proxy;
use lanes_error::{CopyError, Error};
use std::rc::Rc;

/// Distinguishes a copy that crosses a keeper boundary from a plain
/// lane-to-lane copy; only the former may legally resolve a proxy through
/// a different `LookupMode` on the way back out (spec.md §4.5, grounded
/// on `intercopycontext.h`'s `LookupMode`).
pub use lanes_core::LookupMode;

/// One copy call's context: which two VMs are involved, the direction,
/// and the per-call cache that makes the copy cycle-safe (spec.md
/// §4.5.3 "inter_copy establishes one cache table per top-level call").
pub struct CopyContext<'a> {
    mode: LookupMode,
    dest: &'a mut Vm,
    src: &'a Vm,
    /// Source identity (table/function/deep/clonable address) -> value
    /// already materialized on the destination side. Consulted before
    /// copying a reference value, and populated *before* recursing into
    /// it, which is what breaks cycles.
    cache: HashMap<usize, Value>,
}

impl<'a> CopyContext<'a> {
    pub fn new(mode: LookupMode, src: &'a Vm, dest: &'a mut Vm) -> Self {
        Self { mode, dest, src, cache: HashMap::new() }
    }

    /// Copies a single value across. Scalars are copied by value;
    /// references are copied structurally (or, for deep/clonable
    /// userdata, by proxy/clone) with cycles broken via the call cache.
    pub fn copy_one(&mut self, value: &Value) -> Result<Value, Error> {
        log::trace!("copying {} value under mode {:?}", value.type_name(), self.mode);
        match value {
            Value::Nil
            | Value::Boolean(_)
            | Value::Number(_)
            | Value::Integer(_)
            | Value::Str(_)
            | Value::LightUserdata(_) => Ok(value.clone()),

            Value::Table(t) => self.copy_table(t),
            Value::Function(f) => self.copy_function(f),
            Value::Deep(prelude) => {
                let identity = std::sync::Arc::as_ptr(prelude) as usize;
                if let Some(cached) = self.cache.get(&identity) {
                    return Ok(cached.clone());
                }
                let proxy = push_deep_proxy(self.dest, prelude);
                self.cache.insert(identity, proxy.clone());
                Ok(proxy)
            }
            Value::Clonable(c) => self.copy_clonable(c),
        }
    }

    /// Copies every value in `values`, in order, within the same call
    /// cache, so that shared references across the list stay shared on
    /// the destination side too (spec.md §4.5.3 "a single cache per
    /// inter_copy call, not per value").
    pub fn copy_many(&mut self, values: &[Value]) -> Result<Vec<Value>, Error> {
        values.iter().map(|v| self.copy_one(v)).collect()
    }

    fn copy_clonable(&mut self, c: &Rc<ClonableUserdata>) -> Result<Value, Error> {
        let identity = Rc::as_ptr(c) as usize;
        if let Some(cached) = self.cache.get(&identity) {
            return Ok(cached.clone());
        }
        let bytes = (c.clone_op)(&c.bytes);
        let copy = Value::Clonable(Rc::new(ClonableUserdata {
            metatable_name: c.metatable_name.clone(),
            bytes,
            clone_op: c.clone_op,
        }));
        self.cache.insert(identity, copy.clone());
        Ok(copy)
    }

    fn copy_table(&mut self, table: &Table) -> Result<Value, Error> {
        if table.lanes_ignore() {
            return Ok(Value::Nil);
        }
        let identity = table.identity();
        if let Some(cached) = self.cache.get(&identity) {
            return Ok(cached.clone());
        }

        let dest_table = Table::new();
        let dest_value = Value::Table(dest_table.clone());
        // Insert before recursing: a cycle back to this table resolves to
        // the (possibly still partially empty) destination table instead
        // of looping forever (spec.md §4.5.3).
        self.cache.insert(identity, dest_value.clone());

        for (key, value) in table.snapshot() {
            // A key that fails to copy (in VT_KEY context) drops the whole
            // pair silently rather than aborting the table; only a failed
            // value copy propagates (spec.md §4.5.3).
            let dest_key = match self.copy_one(&key) {
                Ok(k) => k,
                Err(_) => continue,
            };
            let dest_val = self.copy_one(&value)?;
            dest_table.set(dest_key, dest_val);
        }

        if let Some(mt) = table.metatable() {
            if let Value::Table(dest_mt) = self.copy_table(&mt)? {
                dest_table.set_metatable(Some(dest_mt));
            }
        }

        Ok(dest_value)
    }

    fn copy_function(&mut self, f: &FunctionRef) -> Result<Value, Error> {
        match f {
            FunctionRef::Native(_) => self.copy_native_function(f),
            FunctionRef::Bytecode(bf) => self.copy_bytecode_function(bf),
        }
    }

    fn copy_native_function(&mut self, f: &FunctionRef) -> Result<Value, Error> {
        let name = self
            .src
            .lookup_db
            .name_of(f)
            .ok_or_else(|| CopyError::FunctionLookupFailed("<unregistered>".to_string()))?
            .to_string();
        let dest_fn = self
            .dest
            .lookup_db
            .lookup(&name)
            .ok_or(CopyError::FunctionLookupFailed(name))?;
        Ok(Value::Function(dest_fn))
    }

    fn copy_bytecode_function(&mut self, bf: &Rc<BytecodeFunction>) -> Result<Value, Error> {
        let identity = Rc::as_ptr(bf) as usize;
        if let Some(cached) = self.cache.get(&identity) {
            return Ok(cached.clone());
        }

        let chunk: Chunk = bf.dump();
        let dest_bf = BytecodeFunction::load(&chunk);
        let dest_value = Value::Function(FunctionRef::Bytecode(dest_bf.clone()));
        // Inserted before the upvalues are filled in, so a closure that
        // captures itself (or a sibling that captures it back) resolves
        // through the cache rather than recursing forever (spec.md
        // §4.5.4 "upvalue cycles").
        self.cache.insert(identity, dest_value.clone());

        let src_upvalues = bf.upvalues.borrow().clone();
        let mut dest_upvalues = Vec::with_capacity(src_upvalues.len());
        for upvalue in &src_upvalues {
            if let Value::Table(t) = upvalue {
                if t.identity() == self.src.globals.identity() {
                    // A function's own defining globals table is
                    // substituted for the destination's globals, never
                    // copied structurally (spec.md §4.5.4).
                    dest_upvalues.push(Value::Table(self.dest.globals.clone()));
                    continue;
                }
            }
            dest_upvalues.push(self.copy_one(upvalue)?);
        }
        *dest_bf.upvalues.borrow_mut() = dest_upvalues;

        Ok(dest_value)
    }
}

/// Copies the named module table from `src`'s globals into `dest`'s
/// globals under the same name, if present, so that a lane body which
/// `require`s a module can find it pre-populated on the other side
/// (spec.md §4.5.7 "package propagation"; supplemental relative to the
/// distilled spec, grounded on `intercopycontext.h`'s `interCopyPackage`).
pub fn copy_package(ctx: &mut CopyContext<'_>, name: &str) -> Result<(), Error> {
    let module = ctx.src.globals.get(&Value::str(name));
    if module.is_nil() {
        return Ok(());
    }
    let copied = ctx.copy_one(&module)?;
    ctx.dest.globals.set(Value::str(name), copied);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanes_core::{NativeFn, NativeFunction};

    fn noop(_vm: &mut Vm, _args: &[Value]) -> Result<Vec<Value>, Error> {
        Ok(vec![])
    }
    static NOOP: NativeFunction = NativeFunction { f: noop as NativeFn, default_name: Some("noop") };

    #[test]
    fn scalars_copy_by_value() {
        let src = Vm::new();
        let mut dest = Vm::new();
        let mut ctx = CopyContext::new(LookupMode::LaneBody, &src, &mut dest);
        assert_eq!(ctx.copy_one(&Value::Integer(42)).unwrap(), Value::Integer(42));
    }

    #[test]
    fn nested_tables_copy_structurally_as_distinct_references() {
        let src = Vm::new();
        let mut dest = Vm::new();
        let outer = Table::new();
        let inner = Table::new();
        inner.set(Value::str("x"), Value::Integer(1));
        outer.set(Value::str("inner"), Value::Table(inner.clone()));

        let mut ctx = CopyContext::new(LookupMode::LaneBody, &src, &mut dest);
        let copied = ctx.copy_one(&Value::Table(outer.clone())).unwrap();
        let Value::Table(copied_outer) = copied else { panic!("expected table") };
        assert_ne!(copied_outer.identity(), outer.identity());

        let Value::Table(copied_inner) = copied_outer.get(&Value::str("inner")) else {
            panic!("expected table")
        };
        assert_ne!(copied_inner.identity(), inner.identity());
        assert_eq!(copied_inner.get(&Value::str("x")), Value::Integer(1));
    }

    #[test]
    fn self_referential_table_copies_without_looping() {
        let src = Vm::new();
        let mut dest = Vm::new();
        let t = Table::new();
        t.set(Value::str("self"), Value::Table(t.clone()));

        let mut ctx = CopyContext::new(LookupMode::LaneBody, &src, &mut dest);
        let copied = ctx.copy_one(&Value::Table(t)).unwrap();
        let Value::Table(copied_table) = copied.clone() else { panic!("expected table") };
        let Value::Table(looped_back) = copied_table.get(&Value::str("self")) else {
            panic!("expected table")
        };
        assert_eq!(looped_back.identity(), copied_table.identity());
    }

    #[test]
    fn table_with_lanesignore_metatable_copies_as_nil() {
        let src = Vm::new();
        let mut dest = Vm::new();
        let t = Table::new();
        let mt = Table::new();
        mt.set(Value::str("lanesignore"), Value::Boolean(true));
        t.set_metatable(Some(mt));

        let mut ctx = CopyContext::new(LookupMode::LaneBody, &src, &mut dest);
        assert_eq!(ctx.copy_one(&Value::Table(t)).unwrap(), Value::Nil);
    }

    #[test]
    fn native_function_translates_through_lookup_db() {
        let mut src = Vm::new();
        let mut dest = Vm::new();
        let src_root = Table::new();
        src_root.set(Value::str("noop"), Value::Function(FunctionRef::Native(&NOOP)));
        src.lookup_db.register_module("m", &src_root);
        let dest_root = Table::new();
        dest_root.set(Value::str("noop"), Value::Function(FunctionRef::Native(&NOOP)));
        dest.lookup_db.register_module("m", &dest_root);

        let mut ctx = CopyContext::new(LookupMode::LaneBody, &src, &mut dest);
        let copied = ctx.copy_one(&Value::Function(FunctionRef::Native(&NOOP))).unwrap();
        assert!(matches!(copied, Value::Function(FunctionRef::Native(_))));
    }

    #[test]
    fn unregistered_native_function_fails_to_copy() {
        let src = Vm::new();
        let mut dest = Vm::new();
        let mut ctx = CopyContext::new(LookupMode::LaneBody, &src, &mut dest);
        let err = ctx.copy_one(&Value::Function(FunctionRef::Native(&NOOP))).unwrap_err();
        assert!(matches!(err, Error::Copy(CopyError::FunctionLookupFailed(_))));
    }

    #[test]
    fn pair_with_an_uncopyable_key_is_dropped_rather_than_aborting_the_table() {
        let src = Vm::new();
        let mut dest = Vm::new();
        let t = Table::new();
        // An unregistered native function has no translation in `dest`;
        // its pair should vanish rather than fail the whole table copy.
        t.set(Value::Function(FunctionRef::Native(&NOOP)), Value::Integer(1));
        t.set(Value::str("kept"), Value::Integer(2));

        let mut ctx = CopyContext::new(LookupMode::LaneBody, &src, &mut dest);
        let Value::Table(copied) = ctx.copy_one(&Value::Table(t)).unwrap() else {
            panic!("expected table")
        };
        assert_eq!(copied.get(&Value::str("kept")), Value::Integer(2));
        assert_eq!(copied.snapshot().len(), 1);
    }
}
