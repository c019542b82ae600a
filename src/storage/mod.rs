//! Durable log and metadata storage.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use traits::{LogPosition, PersistentStore, StoreError};
