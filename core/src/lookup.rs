//! The function lookup database (C2): a forward/reverse map between
//! native and bytecode functions and the `/`-joined path names under
//! which they were registered via
//! [`register_module`](LookupDb::register_module), letting the copier
//! translate a function identity across a keeper boundary instead of
//! copying its code (spec.md §4.2).

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::function::FunctionRef;
use crate::table::Table;
use crate::value::Value;

#[derive(Default)]
pub struct LookupDb {
    forward: HashMap<usize, Rc<str>>,
    reverse: HashMap<Rc<str>, FunctionRef>,
}

impl LookupDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks `root` breadth-first, assigning every function it finds the
    /// shortest path from `root_name` to reach it, joined with `/`
    /// (spec.md §4.2: "a name is synthesized by joining the path with
    /// `/`"). Ties at equal depth are broken by processing each table's
    /// string keys in lexicographic order, so the first path discovered
    /// is deterministic (spec.md §4.2: "the shortest, lexicographically-
    /// first path wins"). A function already registered under a shorter
    /// or equal path is left alone; modules may alias each other's
    /// functions without churn.
    pub fn register_module(&mut self, root_name: &str, root: &Table) {
        let mut queue: VecDeque<(String, Table)> = VecDeque::new();
        queue.push_back((root_name.to_string(), root.clone()));

        while let Some((prefix, table)) = queue.pop_front() {
            let mut entries: Vec<(String, Value)> = table
                .snapshot()
                .into_iter()
                .filter_map(|(k, v)| match k {
                    Value::Str(s) => Some((s.to_string(), v)),
                    _ => None,
                })
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            for (key, value) in entries {
                let joined = format!("{prefix}/{key}");
                match value {
                    Value::Function(f) => {
                        self.register_one(joined, f);
                    }
                    Value::Table(t) => {
                        queue.push_back((joined, t));
                    }
                    _ => {}
                }
            }
        }
    }

    fn register_one(&mut self, name: String, f: FunctionRef) {
        let identity = Value::Function(f.clone()).identity().expect("functions have identity");
        if self.forward.contains_key(&identity) {
            return;
        }
        let name: Rc<str> = name.into();
        self.forward.insert(identity, Rc::clone(&name));
        self.reverse.insert(name, f);
    }

    pub fn name_of(&self, f: &FunctionRef) -> Option<&str> {
        let identity = Value::Function(f.clone()).identity()?;
        self.forward.get(&identity).map(|s| s.as_ref())
    }

    pub fn lookup(&self, name: &str) -> Option<FunctionRef> {
        self.reverse.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{NativeFunction, NativeFn};

    fn dummy(_vm: &mut crate::vm::Vm, _args: &[Value]) -> Result<Vec<Value>, lanes_error::Error> {
        Ok(vec![])
    }
    static DUMMY_FN: NativeFunction = NativeFunction { f: dummy as NativeFn, default_name: None };
    static OTHER_FN: NativeFunction = NativeFunction { f: dummy as NativeFn, default_name: None };

    #[test]
    fn registers_nested_function_under_shortest_path() {
        let mut db = LookupDb::new();
        let root = Table::new();
        let sub = Table::new();
        sub.set(Value::str("go"), Value::Function(FunctionRef::Native(&DUMMY_FN)));
        root.set(Value::str("sub"), Value::Table(sub));
        db.register_module("mymod", &root);

        let f = FunctionRef::Native(&DUMMY_FN);
        assert_eq!(db.name_of(&f), Some("mymod/sub/go"));
        assert!(matches!(db.lookup("mymod/sub/go"), Some(FunctionRef::Native(_))));
    }

    #[test]
    fn first_registration_wins_on_alias() {
        let mut db = LookupDb::new();
        let root = Table::new();
        root.set(Value::str("a"), Value::Function(FunctionRef::Native(&DUMMY_FN)));
        root.set(Value::str("b"), Value::Function(FunctionRef::Native(&DUMMY_FN)));
        db.register_module("m", &root);
        assert_eq!(db.name_of(&FunctionRef::Native(&DUMMY_FN)), Some("m/a"));
    }

    #[test]
    fn unregistered_function_has_no_name() {
        let db = LookupDb::new();
        assert_eq!(db.name_of(&FunctionRef::Native(&OTHER_FN)), None);
    }
}
