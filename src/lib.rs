//! `lanes`: the public facade over the Lanes concurrency runtime.
//!
//! Re-exports the per-crate building blocks (`lanes-core`, `lanes-deep`,
//! `lanes-copier`, `lanes-keeper`, `lanes-linda`, `lanes-lane`,
//! `lanes-universe`) and adds the handful of free functions and constants
//! that make up the module surface described in spec.md §6.

pub use lanes_copier::{copy_package, CopyContext, LookupMode};
pub use lanes_core::{
    keys, AllocatorConfig, AllocatorDefinition, BytecodeFunction, CancelRequest, Chunk,
    ClonableUserdata, DeepFactory, DeepPrelude, FunctionRef, Handoff, LookupDb, NativeFn,
    NativeFunction, ProtectedAllocator, Table, UniqueKey, Value, ValueKey, Vm, VmHandoff,
};
pub use lanes_deep::{build_proxy_metatable, new_deep_userdata, push_deep_proxy, to_deep};
pub use lanes_error::{
    CopyError, DeepError, Error, KeeperError, LaneError, LindaError, Result, UniverseError,
};
pub use lanes_keeper::{CountResult, Keeper, KeeperPool};
pub use lanes_lane::{cancel_test, Lane, LaneOptions, LaneStatus};
pub use lanes_linda::{Linda, LindaOutcome};
pub use lanes_universe::{Config, ShutdownMode, Universe};

use std::time::{SystemTime, UNIX_EPOCH};

/// The crate's own version string, exposed the way `lane_new`'s embedder
/// expects to read a `version` field off the module table (spec.md §6).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The inclusive range a lane priority or `set_thread_priority` argument
/// must fall within (spec.md §6 `p ∈ [-3,3]`).
pub const MAX_PRIO: i32 = 3;

/// Published as the `cancel_error`/`null` sentinels on the module surface
/// (spec.md §6): scripts compare against these by identity, never by
/// value.
pub const CANCEL_ERROR: UniqueKey = keys::CANCEL_ERROR;
pub const NULL: UniqueKey = keys::NULL;
pub const BATCHED: UniqueKey = keys::BATCHED;

/// Creates a linda routed through `universe`'s keeper pool (spec.md §6
/// `linda(name?, group?)`).
pub fn linda(universe: &Universe, name: Option<String>, group: Option<u32>) -> Linda {
    Linda::new(universe.keepers().clone(), name, group)
}

/// Seconds since the Unix epoch, at whatever resolution the platform
/// clock provides (spec.md §6 `now_secs()`, grounded on
/// `original_source/src/lanes.cpp`'s `now_secs`, which uses
/// `system_clock` rather than a monotonic clock so it shares a baseline
/// with `wakeup_conv`).
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A broken-down calendar time, standing in for the `date_tbl` argument
/// to `wakeup_conv` (spec.md §6). `isdst` is accepted for source fidelity
/// but has no effect: this implementation always resolves in UTC rather
/// than the host's local timezone, a deliberate simplification recorded
/// in DESIGN.md.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateSpec {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub min: u32,
    pub sec: u32,
    pub isdst: Option<bool>,
}

/// Converts a [`DateSpec`] to seconds since the Unix epoch (spec.md §6
/// `wakeup_conv(date_table)`), using the same civil-calendar algorithm
/// `std::mktime` implements, but fixed to UTC so the result is
/// reproducible across hosts.
pub fn wakeup_conv(date: DateSpec) -> f64 {
    let days = days_from_civil(date.year, date.month, date.day);
    let day_seconds = date.hour as i64 * 3600 + date.min as i64 * 60 + date.sec as i64;
    (days * 86_400 + day_seconds) as f64
}

/// Howard Hinnant's days-from-civil algorithm: the number of days since
/// 1970-01-01 for a proleptic-Gregorian `(year, month, day)`, valid for
/// every representable date including before the epoch.
fn days_from_civil(year: i32, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year as i64 - 1 } else { year as i64 };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (month as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Restricts the process to a single CPU core, for performance testing
/// (spec.md §6 `set_singlethreaded(n)`). Thread/CPU affinity is
/// explicitly out of scope of this runtime (spec.md "OUT OF SCOPE":
/// "platform-specific thread priority/affinity knobs"), so only the
/// trivial `n == 1` case succeeds; anything else reports that the
/// platform hook isn't available here, matching the original's own
/// `"not implemented"` on platforms without `_UTILBINDTHREADTOCPU`.
pub fn set_singlethreaded(cores: u32) -> Result<()> {
    if cores <= 1 {
        Ok(())
    } else {
        Err(Error::other("limiting to more than one core is not implemented"))
    }
}

/// Requests a priority for the calling OS thread (spec.md §6
/// `set_thread_priority(p)`). A stub: actual OS thread priorities are
/// out of scope (see [`set_singlethreaded`]'s doc comment); this only
/// validates the range every embedder is expected to honor.
pub fn set_thread_priority(p: i32) -> Result<()> {
    if (-MAX_PRIO..=MAX_PRIO).contains(&p) {
        log::debug!("set_thread_priority({p}) requested (no-op: platform priorities are out of scope)");
        Ok(())
    } else {
        Err(Error::other(format!("priority {p} is out of range [-{MAX_PRIO}, {MAX_PRIO}]")))
    }
}

/// Requests a CPU affinity mask for the calling OS thread (spec.md §6
/// `set_thread_affinity(mask)`). Like [`set_thread_priority`], affinity
/// enforcement itself is out of scope; this only records the request.
pub fn set_thread_affinity(mask: u64) -> Result<()> {
    log::debug!("set_thread_affinity({mask:#x}) requested (no-op: platform affinity is out of scope)");
    Ok(())
}

/// Looks up the `/`-joined path a function was registered under in
/// `vm`'s lookup database, if any (spec.md §6 `nameof(v)`; SPEC_FULL.md
/// §D).
pub fn nameof(vm: &Vm, value: &Value) -> Option<String> {
    match value {
        Value::Function(f) => vm.lookup_db.name_of(f).map(|s| s.to_string()),
        _ => None,
    }
}

/// Registers `module`'s contents under `name` in `vm`'s lookup database,
/// so functions inside it can be translated between VMs by name (spec.md
/// §6 `register(name, module)`; SPEC_FULL.md §D).
pub fn register(vm: &mut Vm, name: &str, module: &Table) {
    vm.lookup_db.register_module(name, module);
}
