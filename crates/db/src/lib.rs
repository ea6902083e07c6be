//! Persistence layer for the annotation pipeline.
//!
//! - [`store`] — the document store adapter: hierarchical paths, the
//!   capability trait, optimistic transactions, and the in-memory
//!   implementation.
//! - [`models`] — typed entity records with explicit optional fields.
//! - [`repositories`] — one repository per entity kind, the aggregate
//!   mutator, and the idempotency guard.
//! - [`error`] — the shared error taxonomy.

pub mod error;
pub mod models;
pub mod repositories;
pub mod store;

pub use error::StoreError;
pub use store::{DocumentStore, MemoryStore, SharedStore};
