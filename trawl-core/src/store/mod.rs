//! Relational store for extracted tracker data.
//!
//! The store owns surrogate ids and row lifecycle: upserts are idempotent
//! by natural key, rows vanished upstream are expired rather than deleted,
//! and re-upserting an expired row revives it.

pub mod schema;
pub mod sqlite;
pub mod traits;

pub use traits::TrackerStore;
