//! Hop-by-hop route discovery on top of a TTL-limited prober.

pub mod engine;
pub mod worker;

pub use engine::*;
pub use worker::*;
