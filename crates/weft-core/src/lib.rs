//! # weft-core
//!
//! Dependency-light types shared across the weft runtime crates:
//!
//! - Fiber ids and the fiber state machine
//! - Error types
//! - Low-level synchronization (spin lock, counting semaphore)

pub mod error;
pub mod id;
pub mod state;
pub mod sync;

pub use error::{RuntimeError, RuntimeResult};
pub use id::FiberId;
pub use state::FiberState;
