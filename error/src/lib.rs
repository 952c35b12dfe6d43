//! Error domains for the lanes runtime.
//!
//! Each subsystem crate defines its own narrow [`thiserror::Error`] enum;
//! this crate aggregates them into a single [`Error`] so callers at the
//! API boundary (lane join results, linda call results) can propagate one
//! type regardless of which subsystem raised it.

use thiserror::Error;

/// A copy performed by the inter-state copier could not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CopyError {
    /// The source value's type has no translation to the destination VM.
    #[error("unsupported value type at {0}")]
    UnsupportedType(String),

    /// A native function has no entry in the destination's lookup database.
    #[error("native function '{0}' not found in destination lookup database")]
    FunctionLookupFailed(String),

    /// A table or metatable could not be found in a keeper-side lookup DB.
    #[error("table '{0}' not found in destination lookup database")]
    TableLookupFailed(String),

    /// Fewer values were available on the source stack than requested.
    #[error("not enough values: wanted {wanted}, found {found}")]
    NotEnoughValues { wanted: usize, found: usize },

    /// A full userdata was neither deep nor clonable, and demotion is disabled.
    #[error("full userdata at {0} cannot cross VM boundaries")]
    UndemotableUserdata(String),

    /// A thread or foreign cdata value was encountered.
    #[error("value of kind '{0}' cannot cross VM boundaries")]
    NonPortableValue(&'static str),
}

/// Deep userdata (C4) construction or lookup failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeepError {
    #[error("deep factory's new_internal left the stack unbalanced")]
    UnbalancedStack,

    #[error("deep prelude magic stamp mismatch")]
    BadMagic,

    #[error("value is not a deep userdata produced by the expected factory")]
    NotDeep,

    #[error("required module '{0}' failed to load in destination VM: {1}")]
    ModuleLoadFailed(String, String),
}

/// Keeper pool / FIFO (C6) failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeeperError {
    #[error("copy into keeper failed: {0}")]
    Copy(#[from] CopyError),

    #[error("keeper GC usage ({used} KB) exceeds threshold ({threshold} KB) even after collection")]
    GcThresholdTooLow { used: usize, threshold: usize },

    #[error("no such linda key")]
    NoSuchKey,

    #[error("a keeper pool must contain at least one keeper")]
    EmptyPool,
}

/// Linda (C7) call failure, distinct from the cancellation non-error path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LindaError {
    #[error(transparent)]
    Keeper(#[from] KeeperError),

    #[error("operation timed out")]
    Timeout,

    #[error("linda cancelled: hard")]
    CancelledHard,
}

/// Lane (C8) lifecycle failure.
#[derive(Error, Debug, Clone)]
pub enum LaneError {
    #[error("lane body raised an error: {message}")]
    Body { message: String, traceback: Option<String> },

    #[error("lane construction failed before the worker thread could start: {0}")]
    ConstructionFailed(String),

    #[error("finalizer raised an error: {0}")]
    Finalizer(String),

    #[error(transparent)]
    Copy(#[from] CopyError),
}

/// Universe (C9) / shutdown failure.
#[derive(Error, Debug, Clone)]
pub enum UniverseError {
    #[error("{count} lane(s) refused to terminate within the shutdown grace period")]
    ZombieLanes { count: usize },
}

/// The aggregate error type used at crate-public boundaries.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error(transparent)]
    Deep(#[from] DeepError),

    #[error(transparent)]
    Keeper(#[from] KeeperError),

    #[error(transparent)]
    Linda(#[from] LindaError),

    #[error(transparent)]
    Lane(#[from] LaneError),

    #[error(transparent)]
    Universe(#[from] UniverseError),

    /// A plain string error, used when re-raising a message copied across a
    /// VM boundary (§7: "non-string errors are tostring'd ... to survive
    /// the transfer").
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(message: impl Into<String>) -> Self {
        Error::Other(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
