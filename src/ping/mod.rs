//! Periodic ping engine: target registry, transmitter, reply matcher.

pub mod engine;
pub mod matcher;
pub mod pending;
pub mod registry;
pub mod scheduler;

pub use engine::*;
pub use matcher::*;
pub use pending::*;
pub use registry::*;
pub use scheduler::*;
