//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for hosts running on a regular
//! OS with a tokio runtime (macOS, Windows, Linux servers).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::ReqwestHttpClient;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let http_client = Arc::new(ReqwestHttpClient::with_timeouts(
//!         Duration::from_millis(1500),
//!         Duration::from_millis(1000),
//!     ));
//!     // Hand to the node coordinator builder
//! }
//! ```

mod http;

pub use http::ReqwestHttpClient;
