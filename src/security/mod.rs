//! Centralized security primitives for credproxy.
//!
//! See [`credproxy`] for the module overview and public API.

mod audit;
mod credproxy;
mod lease;
mod scrub;

// The credproxy.rs facade controls the entire public API surface.
pub use self::credproxy::*;
