//! HTTP surface: game lifecycle API and health

pub mod routes;

pub use routes::build_router;
