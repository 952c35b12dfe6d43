//! The keeper pool (C6): a fixed set of dedicated storage VMs that hold
//! every Linda's key/value FIFOs, so a value send/receive never touches
//! the sending or receiving lane's own heap. Grounded on
//! `original_source/src/keeper.cpp`'s `keepercall_*` family.

use std::collections::{HashMap, VecDeque};

use lanes_core::{Value, ValueKey};
use lanes_error::{Error, KeeperError};
use parking_lot::Mutex;

/// One key's queue inside a keeper. `limit = None` means unbounded;
/// `Some(0)` is a valid, permanently-full limit (spec.md §4.7 "a zero
/// limit blocks every send until the limit is raised").
struct Fifo {
    queue: VecDeque<Value>,
    limit: Option<usize>,
}

impl Fifo {
    fn new() -> Self {
        Self { queue: VecDeque::new(), limit: None }
    }

    fn is_full_for(&self, incoming: usize) -> bool {
        matches!(self.limit, Some(limit) if self.queue.len() + incoming > limit)
    }
}

/// Per-linda storage: every key this linda has ever been sent a value
/// under, each with its own FIFO (original keeper.cpp's per-linda "fifos"
/// table, keyed by arbitrary Lua value).
#[derive(Default)]
struct LindaStorage {
    fifos: HashMap<ValueKey, Fifo>,
}

impl LindaStorage {
    fn fifo_mut(&mut self, key: &Value) -> &mut Fifo {
        self.fifos.entry(ValueKey(key.clone())).or_insert_with(Fifo::new)
    }

    fn fifo(&self, key: &Value) -> Option<&Fifo> {
        self.fifos.get(&ValueKey(key.clone()))
    }
}

/// Either a single count (one key asked for) or a list of (key, count)
/// pairs (no key, or several keys, asked for), matching the three return
/// shapes of `keepercall_count` (spec.md §4.6, §6 `linda:count`).
#[derive(Debug, PartialEq)]
pub enum CountResult {
    Single(Option<usize>),
    Many(Vec<(Value, usize)>),
}

#[derive(Default)]
struct KeeperState {
    lindas: HashMap<usize, LindaStorage>,
}

/// One dedicated storage VM. Every operation takes the calling linda's
/// identity as the first argument so that one keeper can back many
/// lindas (spec.md §4.6: "keepers are a pool much smaller than the
/// number of lindas in flight").
pub struct Keeper {
    state: Mutex<KeeperState>,
}

// Safety: `Value` carries `Rc`-based variants and so is `!Send`/`!Sync` on
// its own, but every access to a keeper's stored values goes through
// `state`'s mutex, and values only ever move (never get cloned and used
// concurrently) across that boundary — exactly one thread touches a given
// `Rc`'s refcount at a time. This is the same raw-pointer-behind-a-mutex
// trick the original keeper state relies on (`original_source/src/keeper.h`'s
// `Keeper::mutex` guarding a bare `lua_State*`).
unsafe impl Send for Keeper {}
unsafe impl Sync for Keeper {}

impl Keeper {
    pub fn new() -> Self {
        Self { state: Mutex::new(KeeperState::default()) }
    }

    /// Appends `values` to `linda`'s `key` fifo unless doing so would
    /// exceed its limit, in which case nothing is stored and `false` is
    /// returned (spec.md §4.7.1 "send").
    pub fn send(&self, linda: usize, key: &Value, values: Vec<Value>) -> bool {
        let mut state = self.state.lock();
        let fifo = state.lindas.entry(linda).or_default().fifo_mut(key);
        if fifo.is_full_for(values.len()) {
            return false;
        }
        fifo.queue.extend(values);
        true
    }

    /// Tries each key in order, returning the first popped `(key, value)`
    /// pair from a non-empty fifo, or `None` if every listed key is empty
    /// (spec.md §4.7.2 "receive", multi-key form).
    pub fn receive(&self, linda: usize, keys: &[Value]) -> Option<(Value, Value)> {
        let mut state = self.state.lock();
        let storage = state.lindas.entry(linda).or_default();
        for key in keys {
            if let Some(fifo) = storage.fifos.get_mut(&ValueKey(key.clone())) {
                if let Some(value) = fifo.queue.pop_front() {
                    return Some((key.clone(), value));
                }
            }
        }
        None
    }

    /// Pops between `min_count` and `max_count` values from `key`'s fifo
    /// as a single batch, or nothing at all if fewer than `min_count` are
    /// available (spec.md §4.7.2 "batched receive", all-or-nothing).
    pub fn receive_batched(&self, linda: usize, key: &Value, min_count: usize, max_count: usize) -> Vec<Value> {
        if min_count == 0 {
            return Vec::new();
        }
        let mut state = self.state.lock();
        let storage = state.lindas.entry(linda).or_default();
        let Some(fifo) = storage.fifos.get_mut(&ValueKey(key.clone())) else {
            return Vec::new();
        };
        if fifo.queue.len() < min_count {
            return Vec::new();
        }
        let take = max_count.min(fifo.queue.len());
        fifo.queue.drain(..take).collect()
    }

    /// Sets `key`'s limit, returning `true` if blocked writers should be
    /// woken because the key was full under the old limit but is not
    /// under the new one (spec.md §4.7.3 "limit").
    pub fn limit(&self, linda: usize, key: &Value, new_limit: Option<usize>) -> bool {
        let mut state = self.state.lock();
        let fifo = state.lindas.entry(linda).or_default().fifo_mut(key);
        let was_full = matches!(fifo.limit, Some(l) if fifo.queue.len() >= l);
        let now_full = matches!(new_limit, Some(l) if fifo.queue.len() >= l);
        fifo.limit = new_limit;
        was_full && !now_full
    }

    /// Replaces `key`'s stored values wholesale (or clears them, if
    /// `values` is `None`), returning `true` if this freed room for
    /// blocked writers (spec.md §4.7.3 "set").
    pub fn set(&self, linda: usize, key: &Value, values: Option<Vec<Value>>) -> bool {
        let mut state = self.state.lock();
        let storage = state.lindas.entry(linda).or_default();
        let fifo = storage.fifo_mut(key);
        let was_full = matches!(fifo.limit, Some(l) if fifo.queue.len() >= l);
        fifo.queue.clear();
        let mut should_wake = false;
        if let Some(values) = values {
            let now_full = matches!(fifo.limit, Some(l) if values.len() >= l);
            should_wake = was_full && !now_full;
            fifo.queue.extend(values);
        } else if fifo.limit.is_none() {
            storage.fifos.remove(&ValueKey(key.clone()));
        }
        should_wake
    }

    /// Reads up to `count` values from `key` without removing them
    /// (spec.md §4.7.3 "get").
    pub fn get(&self, linda: usize, key: &Value, count: usize) -> Vec<Value> {
        let mut state = self.state.lock();
        let storage = state.lindas.entry(linda).or_default();
        match storage.fifo(key) {
            Some(fifo) => fifo.queue.iter().take(count).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Reports fifo depth: for one key, its count (or `None` if unknown);
    /// for zero or several keys, every matching `(key, count)` pair
    /// (spec.md §4.7.3 "count").
    pub fn count(&self, linda: usize, keys: &[Value]) -> CountResult {
        let mut state = self.state.lock();
        let storage = state.lindas.entry(linda).or_default();
        match keys.len() {
            1 => CountResult::Single(storage.fifo(&keys[0]).map(|f| f.queue.len())),
            0 => CountResult::Many(
                storage
                    .fifos
                    .iter()
                    .map(|(k, f)| (k.0.clone(), f.queue.len()))
                    .collect(),
            ),
            _ => CountResult::Many(
                keys.iter()
                    .filter_map(|k| storage.fifo(k).map(|f| (k.clone(), f.queue.len())))
                    .collect(),
            ),
        }
    }

    /// Snapshots every key's full queue for `linda` without removing
    /// anything, for the `towatch`/`dump` introspection helper
    /// (SPEC_FULL.md §D, grounded on `original_source/src/linda.cpp`'s
    /// `linda_dump`).
    pub fn dump(&self, linda: usize) -> Vec<(Value, Vec<Value>)> {
        let mut state = self.state.lock();
        let storage = state.lindas.entry(linda).or_default();
        storage
            .fifos
            .iter()
            .map(|(k, fifo)| (k.0.clone(), fifo.queue.iter().cloned().collect()))
            .collect()
    }

    /// Discards every fifo belonging to `linda`, called once as the
    /// linda itself is destroyed (spec.md §4.7.5, `keepercall_destruct`).
    pub fn forget_linda(&self, linda: usize) {
        self.state.lock().lindas.remove(&linda);
    }
}

impl Default for Keeper {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-size pool of keepers, each independently lockable, so that
/// traffic on unrelated lindas never contends on the same mutex
/// (spec.md §4.6 "keeper count is a startup configuration knob, not a
/// per-linda choice").
pub struct KeeperPool {
    keepers: Vec<Keeper>,
    gc_threshold: usize,
}

impl KeeperPool {
    pub fn new(count: usize, gc_threshold: usize) -> Result<Self, Error> {
        if count == 0 {
            return Err(Error::Keeper(KeeperError::EmptyPool));
        }
        Ok(Self {
            keepers: (0..count).map(|_| Keeper::new()).collect(),
            gc_threshold,
        })
    }

    pub fn len(&self) -> usize {
        self.keepers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keepers.is_empty()
    }

    pub fn gc_threshold(&self) -> usize {
        self.gc_threshold
    }

    /// Selects the keeper for a linda, by explicit group if one was given
    /// at construction time, otherwise by hashing the linda's identity
    /// (spec.md §4.6: "named lindas in the same group always land on the
    /// same keeper").
    pub fn select(&self, linda_identity: usize, group: Option<u32>) -> &Keeper {
        let index = match group {
            Some(g) => g as usize % self.keepers.len(),
            None => {
                let hash = xxhash_rust::xxh3::xxh3_64(&linda_identity.to_ne_bytes());
                (hash as usize) % self.keepers.len()
            }
        };
        &self.keepers[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_respects_limit() {
        let k = Keeper::new();
        assert!(k.limit(1, &Value::str("k"), Some(1)) == false);
        assert!(k.send(1, &Value::str("k"), vec![Value::Integer(1)]));
        assert!(!k.send(1, &Value::str("k"), vec![Value::Integer(2)]));
    }

    #[test]
    fn receive_tries_keys_in_order() {
        let k = Keeper::new();
        k.send(1, &Value::str("b"), vec![Value::Integer(9)]);
        let (key, value) = k.receive(1, &[Value::str("a"), Value::str("b")]).unwrap();
        assert_eq!(key, Value::str("b"));
        assert_eq!(value, Value::Integer(9));
    }

    #[test]
    fn receive_batched_is_all_or_nothing() {
        let k = Keeper::new();
        k.send(1, &Value::str("k"), vec![Value::Integer(1), Value::Integer(2)]);
        assert!(k.receive_batched(1, &Value::str("k"), 3, 3).is_empty());
        let batch = k.receive_batched(1, &Value::str("k"), 2, 5);
        assert_eq!(batch, vec![Value::Integer(1), Value::Integer(2)]);
    }

    #[test]
    fn limit_reports_wakeup_when_room_is_freed() {
        let k = Keeper::new();
        k.send(1, &Value::str("k"), vec![Value::Integer(1)]);
        assert!(k.limit(1, &Value::str("k"), Some(1)) == false);
        let woke = k.limit(1, &Value::str("k"), Some(2));
        assert!(woke);
    }

    #[test]
    fn dump_snapshots_without_removing() {
        let k = Keeper::new();
        k.send(1, &Value::str("a"), vec![Value::Integer(1), Value::Integer(2)]);
        k.send(1, &Value::str("b"), vec![Value::Integer(3)]);
        let mut snapshot = k.dump(1);
        snapshot.sort_by_key(|(key, _)| format!("{key:?}"));
        assert_eq!(
            snapshot,
            vec![
                (Value::str("a"), vec![Value::Integer(1), Value::Integer(2)]),
                (Value::str("b"), vec![Value::Integer(3)]),
            ]
        );
        // still present afterwards
        assert_eq!(k.get(1, &Value::str("a"), 2).len(), 2);
    }

    #[test]
    fn forget_linda_drops_its_storage() {
        let k = Keeper::new();
        k.send(1, &Value::str("k"), vec![Value::Integer(1)]);
        k.forget_linda(1);
        assert_eq!(k.get(1, &Value::str("k"), 1), Vec::<Value>::new());
    }

    #[test]
    fn pool_routes_same_group_to_same_keeper() {
        let pool = KeeperPool::new(4, 100).unwrap();
        let a = pool.select(111, Some(2)) as *const Keeper;
        let b = pool.select(222, Some(2)) as *const Keeper;
        assert_eq!(a, b);
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(KeeperPool::new(0, 0).is_err());
    }
}
