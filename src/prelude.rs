//! Convenient re-exports for common Surecall types.
pub use crate::{
    breaker::{BreakerConfig, BreakerState, CircuitBreaker, MetricsSnapshot},
    client::Client,
    config::{BreakerMode, ClientConfig, ClientConfigBuilder, ConfigError},
    error::{ClientError, ErrorKind},
    filter::{Filter, FilterAction, StatusCodeFilter},
    request::{Body, RequestOptions, RequestParams, Scheme},
    response::{Response, ResponseBody},
    retry::RetryPolicy,
    timing::{TimingPhases, Timings},
};
