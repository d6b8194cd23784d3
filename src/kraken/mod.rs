pub mod rate_limit;
pub mod rest;
pub mod ws;

pub use rate_limit::{RateLimitTracker, RateLimitVerdict};
pub use rest::KrakenRestClient;
