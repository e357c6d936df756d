//! Scheduler configuration

use reactor_core::env::{env_get, env_get_bool};
use reactor_core::error::{SchedError, SchedResult};
use std::fmt;
use std::str::FromStr;

/// What the scheduler does when a fiber body panics or returns an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the round and return `SchedError::Fatal` from `run()`
    Return,

    /// Report the fiber and abort the process
    Abort,

    /// Record the failure on the fiber and keep scheduling the others
    Isolate,
}

impl FromStr for FailurePolicy {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "return" => Ok(FailurePolicy::Return),
            "abort" => Ok(FailurePolicy::Abort),
            "isolate" => Ok(FailurePolicy::Isolate),
            _ => Err(SchedError::InvalidConfig("unknown failure policy")),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Return => write!(f, "return"),
            FailurePolicy::Abort => write!(f, "abort"),
            FailurePolicy::Isolate => write!(f, "isolate"),
        }
    }
}

/// Which event loop adapter `Scheduler::new` builds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopBackend {
    /// Best adapter for this platform (eventfd on Linux)
    Platform,

    /// Portable Mutex + Condvar adapter
    Fallback,
}

impl FromStr for LoopBackend {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "platform" | "default" => Ok(LoopBackend::Platform),
            "fallback" | "condvar" => Ok(LoopBackend::Fallback),
            _ => Err(SchedError::InvalidConfig("unknown event loop backend")),
        }
    }
}

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Failure handling for fiber bodies (default: Return)
    pub failure_policy: FailurePolicy,

    /// Event loop adapter used by `Scheduler::new`
    pub loop_backend: LoopBackend,

    /// Treat a blocking wait that processed nothing as fatal (default: true)
    pub stall_is_fatal: bool,

    /// Enable debug logging of rounds, registrations and cleanups
    pub debug_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Return,
            loop_backend: LoopBackend::Platform,
            stall_is_fatal: true,
            debug_logging: cfg!(feature = "debug-logging"),
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by environment variables
    ///
    /// - `REACTOR_FAILURE_POLICY` = return | abort | isolate
    /// - `REACTOR_EVENT_LOOP` = platform | fallback
    /// - `REACTOR_STALL_FATAL` = bool
    /// - `REACTOR_DEBUG` = bool
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            failure_policy: env_get("REACTOR_FAILURE_POLICY", defaults.failure_policy),
            loop_backend: env_get("REACTOR_EVENT_LOOP", defaults.loop_backend),
            stall_is_fatal: env_get_bool("REACTOR_STALL_FATAL", defaults.stall_is_fatal),
            debug_logging: env_get_bool("REACTOR_DEBUG", defaults.debug_logging),
        }
    }

    /// Set the failure policy
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the event loop backend
    pub fn loop_backend(mut self, backend: LoopBackend) -> Self {
        self.loop_backend = backend;
        self
    }

    /// Choose whether a zero-progress blocking wait is fatal
    pub fn stall_is_fatal(mut self, fatal: bool) -> Self {
        self.stall_is_fatal = fatal;
        self
    }

    /// Enable debug logging
    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> SchedResult<()> {
        if self.failure_policy == FailurePolicy::Abort && !self.stall_is_fatal {
            return Err(SchedError::InvalidConfig(
                "abort policy requires stall_is_fatal",
            ));
        }
        Ok(())
    }
}
