//! # strand-core
//!
//! Shared plain-data types for the strand fiber runtime: identifiers,
//! fiber states, the control-block layout consumed by the architecture
//! switchers, the error taxonomy, and the env/log utilities every layer
//! uses.
//!
//! Nothing here touches the OS; the machinery lives in `strand-runtime`.

pub mod env;
pub mod error;
pub mod fiber;
pub mod id;
pub mod klog;
pub mod state;

pub use error::{RtError, RtResult};
pub use fiber::{Context, FiberBlock, BLOCK_SIZE, FIBER_NONE, GUARD_SIZE, MIN_STACK_SIZE, PAGE_SIZE};
pub use id::{ChanId, FiberId, Handle};
pub use klog::LogLevel;
pub use state::FiberState;

pub use env::{env_get, env_get_bool};
