//! netbridle governs per-process network bandwidth: it intercepts IPv4
//! TCP/UDP packets at a divert-style kernel hook, attributes each packet to
//! the owning local process, accounts the bytes, and forwards, drops or
//! rate-limits according to per-process and global rules.

pub mod adaptive;
pub mod backends;
pub mod bucket;
pub mod counters;
pub mod engine;
pub mod packet;
pub mod resolver;
pub mod rules;
pub mod sampler;

pub use engine::Engine;
pub use rules::{Direction, Rule};
