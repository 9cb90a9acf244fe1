//! Infrastructure adapters for the store, blob storage, and job scheduler.

pub mod blob;
pub mod scheduler;
pub mod store;

pub use blob::{BlobEvent, BlobStore, InMemoryBlobStore};
pub use scheduler::{InMemoryJobScheduler, JobScheduler};
pub use store::{EntityStore, InMemoryStore};
