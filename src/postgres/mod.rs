//! PostgreSQL front-end: wire codec, backend connections, and the
//! per-connection client loop.

pub mod backend;
pub mod client;
pub mod protocol;

pub use backend::{PgDialer, PgExecutor, PgServer};
pub use client::{client_entrypoint, PgServices};

#[cfg(test)]
mod protocol_tests;
