//! Degraded-mode storage used when no primary engine can be opened.
//!
//! Every store is one JSON list under one key of a flat string medium. There
//! are no secondary indexes, uniqueness is only enforced on the primary key,
//! and concurrent writers to the same store can lose updates.

pub mod fallback;
pub mod medium;

pub use fallback::FallbackStorage;
pub use medium::{FileMedium, KvMedium, MemoryMedium};
