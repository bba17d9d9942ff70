//! Trawl core library — tracker client, schema mapper, store, and the
//! run controller.
//!
//! The main entry point is [`run::RunController`], which extracts the
//! configured projects through a [`api::TrackerApi`] into a
//! [`store::TrackerStore`].

pub mod api;
pub mod attach;
pub mod config;
pub mod error;
pub mod map;
pub mod progress;
pub mod run;
pub mod store;
pub mod types;
