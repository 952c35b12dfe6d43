//! Universe (C9): the process-wide root. Owns the keeper pool, tracks
//! lanes that asked to be tracked, and runs the ordered shutdown sequence
//! when the embedding application is done with it. Grounded on
//! `original_source/src/universe.h`/`universe.cpp`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanes_core::{AllocatorConfig, CancelRequest};
use lanes_error::{Error, UniverseError};
use lanes_keeper::KeeperPool;
use lanes_lane::{Lane, LaneStatus};
use lanes_linda::Linda;
use parking_lot::Mutex;

/// The cancel op applied to every lane still free-running at shutdown
/// (spec.md §6 `shutdown_mode`). The original exposes finer-grained hook
/// variants ("call"/"ret"/"line"/"count"); this runtime's cancellation
/// model only distinguishes soft and hard, so every hook variant maps to
/// `Hard` (documented simplification, see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Soft,
    Hard,
    Call,
    Ret,
    Line,
    Count,
}

impl ShutdownMode {
    fn to_cancel_request(self) -> CancelRequest {
        match self {
            ShutdownMode::Soft => CancelRequest::Soft,
            _ => CancelRequest::Hard,
        }
    }
}

/// The configuration table consumed at universe creation (spec.md §6).
#[derive(Clone)]
pub struct Config {
    pub nb_user_keepers: usize,
    pub keepers_gc_threshold: usize,
    pub shutdown_timeout: Duration,
    pub shutdown_mode: ShutdownMode,
    pub verbose_errors: bool,
    pub demote_full_userdata: bool,
    pub track_lanes: bool,
    pub with_timers: bool,
    pub allocator: AllocatorConfig,
    pub strip_functions: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nb_user_keepers: 1,
            keepers_gc_threshold: usize::MAX,
            shutdown_timeout: Duration::from_secs(1),
            shutdown_mode: ShutdownMode::Soft,
            verbose_errors: false,
            demote_full_userdata: false,
            track_lanes: false,
            with_timers: true,
            allocator: AllocatorConfig::default(),
            strip_functions: false,
        }
    }
}

/// The process-wide root object. One per embedding application; every
/// lane and linda it creates routes through its keeper pool (spec.md §3
/// "Universe").
pub struct Universe {
    config: Config,
    keepers: Arc<KeeperPool>,
    timer_linda: Mutex<Option<Linda>>,
    /// All lanes created with tracking on, for `threads()` enumeration
    /// (spec.md §6 `track_lanes`).
    tracking: Mutex<Vec<Arc<Lane>>>,
    /// Lanes whose handle was dropped by the embedder while still
    /// running; `shutdown` cancels and waits for these (spec.md §4.9
    /// "self-destruct chain").
    selfdestruct: Mutex<Vec<Arc<Lane>>>,
    selfdestructing_count: AtomicUsize,
}

impl Universe {
    pub fn new(config: Config) -> Result<Arc<Self>, Error> {
        let keeper_count = 1 + config.nb_user_keepers;
        let keepers = Arc::new(KeeperPool::new(keeper_count, config.keepers_gc_threshold)?);

        let timer_linda = if config.with_timers {
            Some(Linda::new(Arc::clone(&keepers), Some("lanes-timer".to_string()), None))
        } else {
            None
        };

        Ok(Arc::new(Self {
            config,
            keepers,
            timer_linda: Mutex::new(timer_linda),
            tracking: Mutex::new(Vec::new()),
            selfdestruct: Mutex::new(Vec::new()),
            selfdestructing_count: AtomicUsize::new(0),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn keepers(&self) -> &Arc<KeeperPool> {
        &self.keepers
    }

    /// The bootstrap timer linda, if `with_timers` was set (spec.md §3
    /// "a timer linda (bootstrap deep object)").
    pub fn timer_linda(&self) -> Option<Linda> {
        self.timer_linda.lock().clone()
    }

    /// Registers `lane` for `threads()` enumeration. Only meaningful when
    /// `track_lanes` is set; otherwise a no-op.
    pub fn track(&self, lane: Arc<Lane>) {
        if self.config.track_lanes {
            self.tracking.lock().push(lane);
        }
    }

    /// Every tracked lane still known to the universe, in registration
    /// order (spec.md §6 `threads()`).
    pub fn threads(&self) -> Vec<Arc<Lane>> {
        self.tracking.lock().clone()
    }

    /// Moves a lane onto the self-destruct chain: the embedder plays the
    /// role of the original's `__gc` by calling this instead of simply
    /// dropping the `Arc<Lane>`, since Rust has no finalizers that could
    /// intercept "handle went out of scope while the lane kept running"
    /// (spec.md §4.9 "self-destruct chain").
    pub fn orphan(&self, lane: Arc<Lane>) {
        if matches!(lane.status(), LaneStatus::Pending | LaneStatus::Running) {
            self.selfdestruct.lock().push(lane);
        }
    }

    /// Runs the 8-step universe shutdown sequence (spec.md §4.9).
    /// Cancels every self-destructing lane, waits up to
    /// `shutdown_timeout` for them to finish, releases the timer linda,
    /// and drops the keeper pool. Fails with
    /// [`UniverseError::ZombieLanes`] if any lane refuses to terminate in
    /// time, leaving the universe's resources intact so a still-running
    /// lane never dereferences freed state.
    pub fn shutdown(self: &Arc<Self>) -> Result<(), Error> {
        let op = self.config.shutdown_mode.to_cancel_request();

        // 1. request cancellation on every free-running lane.
        {
            let chain = self.selfdestruct.lock();
            for lane in chain.iter() {
                lane.cancel(op);
            }
        }

        // 2/3. poll the chain until every self-destructing lane has fully
        // finished (its OS thread actually exited, not merely its body
        // returning) or the grace period elapses. The original tracks
        // "body returned" and "lua_close done" as two separate counters
        // because a forced kill can make the latter wait unbounded; this
        // runtime has no forced-kill fallback for an uncooperative lane,
        // so both are folded into one bounded poll on `Lane::is_finished`
        // and `selfdestructing_count` simply mirrors what remains
        // in-flight (see DESIGN.md).
        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            let remaining = {
                let mut chain = self.selfdestruct.lock();
                chain.retain(|lane| !lane.is_finished());
                chain.len()
            };
            self.selfdestructing_count.store(remaining, Ordering::Release);
            if remaining == 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::yield_now();
        }

        // 4. a lane that refused to die is a user error; the universe's
        // resources are left intact rather than torn down underneath it.
        let zombies = self.selfdestructing_count.load(Ordering::Acquire);
        if zombies > 0 {
            return Err(Error::Universe(UniverseError::ZombieLanes { count: zombies }));
        }

        // 5. release the bootstrap timer linda.
        self.timer_linda.lock().take();

        // 6. the keeper pool has no OS resources beyond its mutexes;
        // dropping the last `Arc` (by the caller, once this returns) is
        // sufficient to "close" it.
        log::debug!("universe shutdown: {} keeper(s) releasing", self.keepers.len());

        // 7. restoring a non-protected allocator is a no-op in this
        // harness; `AllocatorConfig` carries no OS-level installation to
        // undo.

        // 8. the universe itself is destructed by the caller dropping
        // this `Arc` once `shutdown` returns `Ok`.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanes_core::{FunctionRef, NativeFn, NativeFunction, Value, Vm};
    use lanes_lane::LaneOptions;

    fn sleepy(_vm: &mut Vm, _args: &[Value]) -> Result<Vec<Value>, Error> {
        std::thread::sleep(Duration::from_millis(5));
        Ok(vec![])
    }
    static SLEEPY: NativeFunction = NativeFunction { f: sleepy as NativeFn, default_name: Some("sleepy") };

    #[test]
    fn shutdown_with_no_lanes_succeeds() {
        let universe = Universe::new(Config::default()).unwrap();
        universe.shutdown().unwrap();
    }

    #[test]
    fn shutdown_waits_out_and_reaps_a_cooperative_lane() {
        let universe = Universe::new(Config { shutdown_timeout: Duration::from_millis(200), ..Config::default() }).unwrap();
        let creator = Vm::new();
        let function = Value::Function(FunctionRef::Native(&SLEEPY));
        let lane = Arc::new(Lane::spawn(&creator, &function, &[], LaneOptions::default()).unwrap());
        universe.orphan(Arc::clone(&lane));
        universe.shutdown().unwrap();
    }

    #[test]
    fn shutdown_reports_a_zombie_lane() {
        let universe = Universe::new(Config { shutdown_timeout: Duration::from_millis(10), ..Config::default() }).unwrap();
        let creator = Vm::new();
        fn ignores_cancel(_vm: &mut Vm, _args: &[Value]) -> Result<Vec<Value>, Error> {
            std::thread::sleep(Duration::from_millis(150));
            Ok(vec![])
        }
        static IGNORES: NativeFunction = NativeFunction { f: ignores_cancel as NativeFn, default_name: None };
        let function = Value::Function(FunctionRef::Native(&IGNORES));
        let lane = Arc::new(Lane::spawn(&creator, &function, &[], LaneOptions::default()).unwrap());
        universe.orphan(Arc::clone(&lane));
        let err = universe.shutdown().unwrap_err();
        assert!(matches!(err, Error::Universe(UniverseError::ZombieLanes { .. })));
    }

    #[test]
    fn tracking_enumerates_lanes_only_when_enabled() {
        let universe = Universe::new(Config { track_lanes: true, ..Config::default() }).unwrap();
        let creator = Vm::new();
        let function = Value::Function(FunctionRef::Native(&SLEEPY));
        let lane = Arc::new(Lane::spawn(&creator, &function, &[], LaneOptions::default()).unwrap());
        universe.track(Arc::clone(&lane));
        assert_eq!(universe.threads().len(), 1);
        lane.join(Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn with_timers_creates_a_bootstrap_linda() {
        let universe = Universe::new(Config { with_timers: true, ..Config::default() }).unwrap();
        assert!(universe.timer_linda().is_some());
        let universe_no_timer = Universe::new(Config { with_timers: false, ..Config::default() }).unwrap();
        assert!(universe_no_timer.timer_linda().is_none());
    }
}
