//! Architecture-specific context switching
//!
//! Each architecture module provides:
//!
//! - `SavedContext`: the callee-saved register file of a suspended fiber
//! - `init_context`: prime a context so the first switch lands in the
//!   entry trampoline with the entry function and its argument staged
//!   in callee-saved registers
//! - `context_switch`: save the current register file into `old`, load
//!   `new`, and continue there

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{context_switch, init_context, SavedContext};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{context_switch, init_context, SavedContext};
    } else {
        compile_error!("unsupported architecture (x86_64 and aarch64 only)");
    }
}
