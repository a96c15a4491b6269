//! Probabilistic sketch primitives: the rolling multi-hash bank and the
//! per-window Bloom bitsets it feeds.

pub mod bloom;
pub mod rolling;

pub use bloom::BloomSet;
pub use rolling::{build_hash_tables, HashTables, RollingHashBank};
