//! Adapters that live inside the domain crate for convenience.
//!
//! The in-memory store backs unit tests and the `memory` storage provider.
//! Real adapters (PostgREST, SQLite) live in separate crates.

pub mod memory_store;
