//! # Data Retrieval Module
//!
//! Generic JSON-over-HTTP plumbing shared by the provider client.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: an `ApiClient` built on `reqwest` and `reqwest-middleware`.
//!   It does not retry on its own: every attempt against the tracking provider
//!   has to be admitted by the gatekeeper first, so retries live in the engine.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client returning status, headers and decoded JSON.
pub mod ky_http;
