//! Game persistence

pub mod games;
pub mod rest;

pub use games::{GameStore, MemoryStore, RestStore, StoreError, StoredGame};
pub use rest::RestClient;
