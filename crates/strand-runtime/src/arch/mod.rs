//! Architecture-specific context switching
//!
//! Each backend provides two operations over `strand_core::Context`:
//! `init_context` (build a launch frame so the first switch-in runs the
//! entry trampoline) and `switch` (save the callee-saved set of the
//! current fiber, restore another's).

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{init_context, switch};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{init_context, switch};
    } else {
        compile_error!("Unsupported architecture");
    }
}
