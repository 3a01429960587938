//! Error handling for the scheduling core.
//!
//! The error surface is deliberately small and fatal-biased: resource
//! exhaustion is reported to the caller, while precondition violations
//! (blocking from interrupt context, releasing a lock that is not held)
//! are kernel bugs and panic at the call site instead of producing a value
//! of one of these types.

use core::fmt;

/// Result type for scheduling operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Top-level error type for all scheduling operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Kernel initialization errors
    Init(InitError),
    /// Thread spawning errors
    Spawn(SpawnError),
}

/// Errors that can occur during kernel bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// `init` was called a second time
    AlreadyInitialized,
    /// `start` was called before `init`
    NotInitialized,
    /// `start` was called a second time
    AlreadyStarted,
}

/// Errors that can occur during thread creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Kernel is not initialized
    NotInitialized,
    /// Out of memory for the thread's stack page
    OutOfMemory,
    /// Thread identifier space exhausted
    TooManyThreads,
    /// Priority outside `[PRI_MIN, PRI_MAX]`
    InvalidPriority(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Init(e) => write!(f, "init error: {e}"),
            SchedError::Spawn(e) => write!(f, "spawn error: {e}"),
        }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::AlreadyInitialized => write!(f, "kernel already initialized"),
            InitError::NotInitialized => write!(f, "kernel not initialized"),
            InitError::AlreadyStarted => write!(f, "kernel already started"),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::NotInitialized => write!(f, "scheduling core not initialized"),
            SpawnError::OutOfMemory => write!(f, "out of memory for thread stack"),
            SpawnError::TooManyThreads => write!(f, "thread identifier space exhausted"),
            SpawnError::InvalidPriority(p) => write!(f, "invalid priority: {p}"),
        }
    }
}

impl From<InitError> for SchedError {
    fn from(error: InitError) -> Self {
        SchedError::Init(error)
    }
}

impl From<SpawnError> for SchedError {
    fn from(error: SpawnError) -> Self {
        SchedError::Spawn(error)
    }
}
