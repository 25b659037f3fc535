//! # Fetchgate Client
//!
//! The orchestrating client for one upstream target:
//! - Cache lookup, then single-flight join or lead on a miss
//! - Per-attempt token bucket admission and retry with backoff
//! - Overall request deadlines that never cancel a shared fetch
//! - A `reqwest` transport for the upstream HTTP API

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod http;
pub mod stats;

pub use client::{GatewayClient, GatewayClientBuilder};
pub use http::HttpUpstream;
pub use stats::ClientStats;
