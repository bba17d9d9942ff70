//! Tracker API access: resource addressing, pagination, pacing, retry.

pub mod http;
pub mod rate_limit;
pub mod traits;

pub use rate_limit::RateLimiter;
pub use traits::{Page, Resource, TrackerApi};
