//! # reactor-core
//!
//! Core types for the reactor cooperative fiber scheduler.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The event loop adapters, fibers and the scheduler itself live in
//! `reactor-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber lifecycle state machine
//! - `error` - Error types
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use error::{
    EventLoopError, FailureKind, FatalError, FiberError, FiberResult, SchedError, SchedResult,
};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};
