// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point. Re-exports everything for both `main.rs` and
// integration tests.

pub mod macros;
pub mod config;
pub mod fs;
pub mod handle;
pub mod kevent;
pub mod kstream;
pub mod logging;
pub mod ps;
pub mod stats;
