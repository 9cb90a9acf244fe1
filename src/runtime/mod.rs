//! Event entry point, spawner, and request/response surface.

pub mod api;
pub mod dispatcher;
pub mod tokio_spawner;

pub use api::{health, ApiError, Health};
pub use dispatcher::{ActionDispatcher, DispatchOutcome};
pub use tokio_spawner::{Spawn, TokioSpawner};
