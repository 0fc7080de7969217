//! # TuskDB Configuration Module
//!
//! Centralizes the layout and sizing constants the engine is built around.
//! Interdependent values live next to each other and are checked with
//! compile-time assertions so a change to one cannot silently invalidate
//! another.

pub mod constants;
pub use constants::*;
