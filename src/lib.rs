#![forbid(unsafe_code)]

//! # Surecall
//!
//! Resilient HTTP client for async Rust: every configured upstream gets a
//! single entry point that performs one logical request, transparently
//! handling transient failures.
//!
//! ## Features
//!
//! - **Circuit breaker** with a rolling bucket window, OPEN / HALF_OPEN /
//!   CLOSED states and force overrides
//! - **Retry engine** with a randomisable exponential schedule
//! - **Filter pipeline** transforming requests forward and responses in
//!   reverse, with short-circuiting
//! - **Per-phase timings** (dns, tcp, tls, first byte, download) and a
//!   precise timeout taxonomy
//! - **Typed errors** carrying the request, partial response, timings and
//!   every earlier attempt's error
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use surecall::{Client, ClientConfig, RequestOptions, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(
//!         ClientConfig::builder("api.example.com")
//!             .retry(RetryPolicy {
//!                 retries: 3,
//!                 min_timeout: Duration::from_millis(200),
//!                 max_timeout: Duration::from_millis(2_000),
//!                 ..RetryPolicy::default()
//!             })
//!             .timing(true)
//!             .build()?,
//!     )?;
//!
//!     let response = client
//!         .request(RequestOptions::new().pathname("/v1/items").query("page", "1"))
//!         .await?;
//!
//!     println!("{} in {:?} ms", response.status, response.timings.map(|t| t.phases().total));
//!     Ok(())
//! }
//! ```

mod attempt;
mod breaker;
mod client;
mod clock;
mod config;
mod error;
mod filter;
mod request;
mod response;
mod retry;
mod timing;

// Re-exports
pub use breaker::{
    BreakerConfig, BreakerError, BreakerState, Bucket, CircuitBreaker, CircuitBreakerBuilder,
    Enrollment, MetricsSnapshot, OpenRejection,
};
pub use client::Client;
pub use clock::{Clock, InstantSleeper, MonotonicClock, Sleeper, TokioSleeper, TrackingSleeper};
pub use config::{BreakerMode, ClientConfig, ClientConfigBuilder, ConfigError};
pub use error::{BoxError, ClientError, ErrorKind};
pub use filter::{Filter, FilterAction, StatusCodeError, StatusCodeFilter};
pub use request::{Body, ByteStream, RequestOptions, RequestParams, Scheme, SharedStream};
pub use response::{Response, ResponseBody};
pub use retry::{RetryConfigError, RetryOperation, RetryPolicy, RetrySchedule};
pub use timing::{TimingPhases, Timings};

pub mod prelude;
