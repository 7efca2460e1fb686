//! In-memory backends for testing and development.

mod repository;
mod store;

pub use repository::{MemoryBlobRepository, MemoryDeviceLogsRepository};
pub use store::MemoryContentStore;
