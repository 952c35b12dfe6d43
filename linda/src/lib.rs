//! Linda (C7): a multi-key bounded channel, deep-shared across every lane
//! and the host, backed by a keeper from the shared pool. Grounded on
//! `original_source/src/linda.h`/`linda.cpp`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lanes_core::{CancelRequest, DeepFactory, DeepPrelude, NativeFunction, Value};
use lanes_deep::new_deep_userdata;
use lanes_error::{Error, LindaError};
use lanes_keeper::{CountResult, KeeperPool};
use parking_lot::{Condvar, Mutex};

/// The result of a blocking linda call (spec.md §6: send/receive/etc.
/// return `true | false | cancel_sentinel`, or `nothing` on certain
/// non-blocking ops). `Timeout` and `Cancelled` are both "no error"
/// outcomes; only a *hard* cancel unwinds via `Err` (spec.md §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LindaOutcome<T> {
    /// The call completed normally, carrying whatever it would have
    /// returned to the caller.
    Ready(T),
    /// The deadline passed before the call could complete.
    Timeout,
    /// A soft cancel was observed; the spec's `cancel_error` sentinel is
    /// what an embedder surfaces to script code for this variant.
    Cancelled,
}

impl<T> LindaOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, LindaOutcome::Ready(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LindaOutcome::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LindaOutcome::Timeout)
    }

    /// The ready value, if any; `None` for `Timeout`/`Cancelled`.
    pub fn ready(self) -> Option<T> {
        match self {
            LindaOutcome::Ready(v) => Some(v),
            _ => None,
        }
    }
}

struct LindaData {
    name: Option<String>,
    group: Option<u32>,
    cancel: Mutex<CancelRequest>,
    /// Paired with `cancel`/wakeup checks; the keeper's own mutex is what
    /// actually guards the fifo contents (`original_source/src/linda.h`
    /// keeps `readHappened`/`writeHappened` as bare condition variables
    /// separate from the keeper's data lock, which this mirrors).
    wait_lock: Mutex<()>,
    /// Notified after a send succeeds: wakes blocked receivers.
    write_happened: Condvar,
    /// Notified after a receive, limit raise, or set frees room: wakes
    /// blocked senders.
    read_happened: Condvar,
}

struct LindaFactory;

impl DeepFactory for LindaFactory {
    fn name(&self) -> &'static str {
        "linda"
    }
    fn method_names(&self) -> &'static [&'static str] {
        &[]
    }
    fn method(&self, _name: &str) -> Option<&'static NativeFunction> {
        None
    }
}
static LINDA_FACTORY: LindaFactory = LindaFactory;

/// A handle to a linda: the shared deep payload plus the keeper pool it
/// routes through. Cheap to clone; every clone refers to the same
/// underlying storage (spec.md §3 Linda: "a deep userdata, shared by
/// reference like any other").
#[derive(Clone)]
pub struct Linda {
    prelude: Arc<DeepPrelude>,
    keepers: Arc<KeeperPool>,
}

impl Linda {
    pub fn new(keepers: Arc<KeeperPool>, name: Option<String>, group: Option<u32>) -> Self {
        let value = new_deep_userdata(
            &LINDA_FACTORY,
            LindaData {
                name,
                group,
                cancel: Mutex::new(CancelRequest::None),
                wait_lock: Mutex::new(()),
                write_happened: Condvar::new(),
                read_happened: Condvar::new(),
            },
        );
        let prelude = match value {
            Value::Deep(p) => p,
            _ => unreachable!("new_deep_userdata always returns Value::Deep"),
        };
        Self { prelude, keepers }
    }

    /// Reconstructs a handle from a deep prelude already produced by
    /// [`Self::new`] elsewhere (for instance, one received as a copied
    /// `Value::Deep` argument) plus the keeper pool it routes through.
    /// Mirrors how the original rebuilds a linda proxy from a looked-up
    /// factory on the receiving side of a copy rather than constructing a
    /// fresh one (`original_source/src/deep.cpp`'s proxy creation).
    pub fn from_parts(prelude: Arc<DeepPrelude>, keepers: Arc<KeeperPool>) -> Self {
        Self { prelude, keepers }
    }

    fn data(&self) -> &LindaData {
        self.prelude
            .downcast_ref::<LindaData>()
            .expect("Linda always wraps LindaData")
    }

    pub fn name(&self) -> Option<&str> {
        self.data().name.as_deref()
    }

    /// Identity used both for keeper routing and for deep-proxy equality
    /// across VMs.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.prelude) as usize
    }

    pub fn prelude(&self) -> &Arc<DeepPrelude> {
        &self.prelude
    }

    fn keeper(&self) -> &lanes_keeper::Keeper {
        self.keepers.select(self.identity(), self.data().group)
    }

    /// Requests cancellation at the given level; a `Soft` request only
    /// takes effect the next time cooperative code checks, a `Hard`
    /// request wakes any lane blocked inside this linda right away
    /// (spec.md §4.7.4).
    pub fn cancel(&self, request: CancelRequest) {
        *self.data().cancel.lock() = request;
        if request.is_cancelled() {
            self.data().write_happened.notify_all();
            self.data().read_happened.notify_all();
        }
    }

    pub fn cancel_state(&self) -> CancelRequest {
        *self.data().cancel.lock()
    }

    /// Checks this linda's own simulate-cancel flag together with the
    /// calling lane's cancel request (spec.md §4.7.1 step 1: "read the
    /// caller lane's cancel request; OR with the linda's simulate-cancel").
    /// `caller` is called fresh on every loop iteration rather than
    /// snapshotted once, so it must read the live state (e.g.
    /// `lanes_lane::cancel_test`), matching
    /// `original_source/src/linda.cpp`'s blocking loops, which re-read
    /// `lane->cancel_request` each time around. A `Hard` level on either
    /// side unwinds the call immediately by raising; a `Soft` level
    /// returns [`LindaOutcome::Cancelled`] instead of blocking further,
    /// without raising (spec.md §7 "Cancel (soft)").
    fn check_cancel(&self, caller: impl Fn() -> CancelRequest) -> Result<bool, Error> {
        let level = match (self.cancel_state(), caller()) {
            (CancelRequest::Hard, _) | (_, CancelRequest::Hard) => CancelRequest::Hard,
            (CancelRequest::Soft, _) | (_, CancelRequest::Soft) => CancelRequest::Soft,
            _ => CancelRequest::None,
        };
        match level {
            CancelRequest::Hard => Err(Error::Linda(LindaError::CancelledHard)),
            CancelRequest::Soft => Ok(true),
            CancelRequest::None => Ok(false),
        }
    }

    /// Blocks until `key`'s fifo has room for `values`, a cancel is
    /// observed, or `timeout` elapses (spec.md §4.7.1). Not itself aware
    /// of any lane's cancel request; use [`Self::send_cancellable`] from
    /// inside a lane body to have this call wake on that lane's hard
    /// cancel.
    pub fn send(&self, key: Value, values: Vec<Value>, timeout: Option<Duration>) -> Result<LindaOutcome<bool>, Error> {
        self.send_cancellable(key, values, timeout, || CancelRequest::None)
    }

    /// Same as [`Self::send`], additionally OR-ing in `caller_cancel()`'s
    /// result at each loop iteration, per spec.md §4.7.1 step 1. Pass
    /// `lanes_lane::cancel_test` bound to the calling lane's `Vm` to let a
    /// hard cancel of that lane wake this call.
    pub fn send_cancellable(
        &self,
        key: Value,
        values: Vec<Value>,
        timeout: Option<Duration>,
        caller_cancel: impl Fn() -> CancelRequest,
    ) -> Result<LindaOutcome<bool>, Error> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if self.check_cancel(&caller_cancel)? {
                return Ok(LindaOutcome::Cancelled);
            }
            if self.keeper().send(self.identity(), &key, values.clone()) {
                self.data().write_happened.notify_all();
                return Ok(LindaOutcome::Ready(true));
            }
            if !self.wait(&self.data().read_happened, deadline) {
                return Ok(LindaOutcome::Timeout);
            }
        }
    }

    /// Blocks until one of `keys` has a value, a cancel is observed, or
    /// `timeout` elapses (spec.md §4.7.2). Not itself aware of any lane's
    /// cancel request; use [`Self::receive_cancellable`] from inside a
    /// lane body to have this call wake on that lane's hard cancel.
    pub fn receive(&self, keys: &[Value], timeout: Option<Duration>) -> Result<LindaOutcome<(Value, Value)>, Error> {
        self.receive_cancellable(keys, timeout, || CancelRequest::None)
    }

    /// Same as [`Self::receive`], additionally OR-ing in `caller_cancel()`'s
    /// result at each loop iteration (spec.md §4.7.1 step 1 / §4.7.2). Pass
    /// `lanes_lane::cancel_test` bound to the calling lane's `Vm` to let a
    /// hard cancel of that lane wake this call.
    pub fn receive_cancellable(
        &self,
        keys: &[Value],
        timeout: Option<Duration>,
        caller_cancel: impl Fn() -> CancelRequest,
    ) -> Result<LindaOutcome<(Value, Value)>, Error> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if self.check_cancel(&caller_cancel)? {
                return Ok(LindaOutcome::Cancelled);
            }
            if let Some(found) = self.keeper().receive(self.identity(), keys) {
                self.data().read_happened.notify_all();
                return Ok(LindaOutcome::Ready(found));
            }
            if !self.wait(&self.data().write_happened, deadline) {
                return Ok(LindaOutcome::Timeout);
            }
        }
    }

    /// Blocks until at least `min_count` values are available for `key`,
    /// then pops between `min_count` and `max_count` of them as one batch
    /// (spec.md §4.7.2 "batched receive").
    pub fn receive_batched(
        &self,
        key: Value,
        min_count: usize,
        max_count: usize,
        timeout: Option<Duration>,
    ) -> Result<LindaOutcome<Vec<Value>>, Error> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if self.check_cancel(|| CancelRequest::None)? {
                return Ok(LindaOutcome::Cancelled);
            }
            let batch = self.keeper().receive_batched(self.identity(), &key, min_count, max_count);
            if !batch.is_empty() {
                self.data().read_happened.notify_all();
                return Ok(LindaOutcome::Ready(batch));
            }
            if !self.wait(&self.data().write_happened, deadline) {
                return Ok(LindaOutcome::Timeout);
            }
        }
    }

    /// Sets `key`'s limit; never blocks (spec.md §4.7.3 "limit").
    pub fn limit(&self, key: &Value, new_limit: Option<usize>) {
        if self.keeper().limit(self.identity(), key, new_limit) {
            self.data().read_happened.notify_all();
        }
    }

    /// Replaces or clears `key`'s stored values; never blocks (spec.md
    /// §4.7.3 "set").
    pub fn set(&self, key: &Value, values: Option<Vec<Value>>) {
        if self.keeper().set(self.identity(), key, values) {
            self.data().read_happened.notify_all();
        }
    }

    /// Peeks at up to `count` stored values without removing them
    /// (spec.md §4.7.3 "get").
    pub fn get(&self, key: &Value, count: usize) -> Vec<Value> {
        self.keeper().get(self.identity(), key, count)
    }

    pub fn count(&self, keys: &[Value]) -> CountResult {
        self.keeper().count(self.identity(), keys)
    }

    /// Snapshots every key this linda currently holds values under,
    /// without removing anything: a debugging/introspection helper
    /// (`towatch`), grounded in `original_source/src/linda.cpp`'s
    /// `linda_dump`.
    pub fn dump(&self) -> Vec<(Value, Vec<Value>)> {
        self.keeper().dump(self.identity())
    }

    /// Waits for `condvar` (or a bounded slice of it), reporting `false`
    /// only once `deadline` has actually passed. The notifying side
    /// mutates keeper state under a *different* mutex than `wait_lock`,
    /// so a plain "check, then wait forever" has a lost-wakeup window;
    /// capping every wait at `POLL_SLICE` bounds the staleness instead
    /// of chasing a cross-mutex happens-before relationship.
    fn wait(&self, condvar: &Condvar, deadline: Option<Instant>) -> bool {
        const POLL_SLICE: Duration = Duration::from_millis(20);
        let mut guard = self.data().wait_lock.lock();
        match deadline {
            None => {
                condvar.wait_for(&mut guard, POLL_SLICE);
                true
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                condvar.wait_for(&mut guard, POLL_SLICE.min(deadline - now));
                true
            }
        }
    }
}

impl Drop for Linda {
    fn drop(&mut self) {
        // Only the last handle's drop matters; forgetting storage early
        // while other clones are alive would lose in-flight data.
        if Arc::strong_count(&self.prelude) == 1 {
            self.keeper().forget_linda(self.identity());
        }
    }
}
