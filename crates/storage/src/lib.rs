//! Storage backends for Corvid.
//!
//! - [`InMemoryStorage`]: ephemeral, for tests and `--storage memory` runs
//! - [`FileStorage`]: one JSON file per key path under a root directory

pub mod file_backend;
pub mod in_memory;

pub use file_backend::FileStorage;
pub use in_memory::InMemoryStorage;
