//! Client configuration: immutable after construction, validated at build
//! time.

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::clock::{Sleeper, TokioSleeper};
use crate::error::ClientError;
use crate::filter::{Filter, StatusCodeFilter};
use crate::request::{resolve_path, RequestOptions, RequestParams, Scheme};
use crate::retry::{RetryConfigError, RetryPolicy};
use http::header::{ACCEPT, HeaderValue};
use http::Method;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub(crate) const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(1_000);
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(2_000);

/// How the client obtains a breaker for each call.
#[derive(Clone)]
pub enum BreakerMode {
    /// No breaker: every call is gated straight through.
    Disabled,
    /// One breaker shared by all calls (the default).
    Shared(CircuitBreaker),
    /// A fresh breaker per call.
    PerRequest(Arc<dyn Fn() -> CircuitBreaker + Send + Sync>),
}

impl std::fmt::Debug for BreakerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerMode::Disabled => f.write_str("Disabled"),
            BreakerMode::Shared(breaker) => f.debug_tuple("Shared").field(breaker).finish(),
            BreakerMode::PerRequest(_) => f.write_str("PerRequest(..)"),
        }
    }
}

pub(crate) type ShouldRetry = Arc<dyn Fn(&ClientError, &RequestParams) -> bool + Send + Sync>;
pub(crate) type OnRetry = Arc<dyn Fn(u32, &ClientError, &RequestParams) + Send + Sync>;

/// Immutable client configuration. Build one with
/// [`ClientConfig::builder`] or parse it from a URL string with
/// [`ClientConfig::from_url`].
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) name: String,
    pub(crate) hostname: String,
    pub(crate) scheme: Scheme,
    pub(crate) port: Option<u16>,
    pub(crate) defaults: RequestOptions,
    pub(crate) filters: Vec<Arc<dyn Filter>>,
    pub(crate) retry: RetryPolicy,
    pub(crate) breaker: BreakerMode,
    pub(crate) should_retry: ShouldRetry,
    pub(crate) on_retry: OnRetry,
    pub(crate) auto_parse_json: bool,
    pub(crate) auto_decode_utf8: bool,
    pub(crate) timing: bool,
    pub(crate) sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("name", &self.name)
            .field("hostname", &self.hostname)
            .field("scheme", &self.scheme)
            .field("port", &self.port)
            .field("retry", &self.retry)
            .field("filters", &self.filters.len())
            .field("auto_parse_json", &self.auto_parse_json)
            .field("auto_decode_utf8", &self.auto_decode_utf8)
            .field("timing", &self.timing)
            .finish()
    }
}

/// Construction-time validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("hostname must not be empty")]
    EmptyHostname,
    #[error(transparent)]
    Retry(#[from] RetryConfigError),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
}

impl ClientConfig {
    pub fn builder(hostname: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(hostname)
    }

    /// Parse scheme, host, port, path and query out of a URL string into a
    /// builder whose defaults match the URL (pathname defaults to `/`).
    pub fn from_url(raw: &str) -> Result<ClientConfigBuilder, ConfigError> {
        let url = Url::parse(raw)?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        let hostname = url.host_str().ok_or(ConfigError::EmptyHostname)?.to_string();

        let mut builder = ClientConfigBuilder::new(hostname).scheme(scheme);
        if let Some(port) = url.port() {
            builder = builder.port(port);
        }
        builder.defaults.pathname = Some(url.path().to_string());
        builder.defaults.query = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        Ok(builder)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Overlay per-call options on the client defaults. The hostname always
    /// comes from the client; the port falls back to the scheme's default;
    /// `accept: application/json` is set unless overridden; `timing`
    /// inherits from the client unless the call sets it explicitly.
    pub(crate) fn merge(&self, options: RequestOptions) -> RequestParams {
        let defaults = &self.defaults;

        let method = options.method.or_else(|| defaults.method.clone()).unwrap_or(Method::GET);
        let port = options
            .port
            .or(defaults.port)
            .or(self.port)
            .unwrap_or_else(|| self.scheme.default_port());

        let pathname = options
            .pathname
            .or_else(|| defaults.pathname.clone())
            .unwrap_or_else(|| "/".to_string());
        let query = if options.query.is_empty() { defaults.query.clone() } else { options.query };
        let path =
            resolve_path(options.path.or_else(|| defaults.path.clone()), &pathname, &query);

        let mut headers = defaults.headers.clone();
        for key in options.headers.keys() {
            headers.remove(key);
        }
        for (key, value) in options.headers.iter() {
            headers.append(key.clone(), value.clone());
        }
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        RequestParams {
            method,
            scheme: self.scheme,
            hostname: self.hostname.clone(),
            port,
            path,
            headers,
            body: options.body.or_else(|| defaults.body.clone()).unwrap_or_default(),
            connection_timeout: options
                .connection_timeout
                .or(defaults.connection_timeout)
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            read_timeout: options
                .read_timeout
                .or(defaults.read_timeout)
                .unwrap_or(DEFAULT_READ_TIMEOUT),
            drop_request_after: options.drop_request_after.or(defaults.drop_request_after),
            drop_all_requests_after: options
                .drop_all_requests_after
                .or(defaults.drop_all_requests_after),
            timing: options.timing.unwrap_or(self.timing),
            span: options.span.unwrap_or_else(tracing::Span::none),
        }
    }
}

/// Builder for [`ClientConfig`]; validation happens in [`build`](Self::build).
pub struct ClientConfigBuilder {
    name: Option<String>,
    hostname: String,
    scheme: Scheme,
    port: Option<u16>,
    defaults: RequestOptions,
    filters: Option<Vec<Arc<dyn Filter>>>,
    retry: RetryPolicy,
    breaker: Option<BreakerMode>,
    should_retry: ShouldRetry,
    on_retry: OnRetry,
    auto_parse_json: bool,
    auto_decode_utf8: bool,
    timing: bool,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for ClientConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfigBuilder")
            .field("name", &self.name)
            .field("hostname", &self.hostname)
            .field("scheme", &self.scheme)
            .field("port", &self.port)
            .field("defaults", &self.defaults)
            .field("filters", &self.filters.as_ref().map(|f| f.len()))
            .field("retry", &self.retry)
            .field("breaker", &self.breaker)
            .field("should_retry", &"..")
            .field("on_retry", &"..")
            .field("auto_parse_json", &self.auto_parse_json)
            .field("auto_decode_utf8", &self.auto_decode_utf8)
            .field("timing", &self.timing)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl ClientConfigBuilder {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            name: None,
            hostname: hostname.into(),
            scheme: Scheme::Https,
            port: None,
            defaults: RequestOptions::default(),
            filters: None,
            retry: RetryPolicy::default(),
            breaker: None,
            should_retry: Arc::new(|_, _| true),
            on_retry: Arc::new(|_, _, _| {}),
            auto_parse_json: true,
            auto_decode_utf8: true,
            timing: false,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Client name used to prefix error messages; defaults to the hostname.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Default request options merged under every call's options.
    pub fn defaults(mut self, defaults: RequestOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Replace the filter list. The built-in 5xx filter applies only when
    /// this is never called.
    pub fn filters(mut self, filters: Vec<Arc<dyn Filter>>) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Append one filter, keeping whatever is already installed.
    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters
            .get_or_insert_with(|| vec![Arc::new(StatusCodeFilter::server_error())])
            .push(filter);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share one breaker across all calls.
    pub fn breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(BreakerMode::Shared(breaker));
        self
    }

    /// Produce a fresh breaker per call.
    pub fn breaker_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> CircuitBreaker + Send + Sync + 'static,
    {
        self.breaker = Some(BreakerMode::PerRequest(Arc::new(factory)));
        self
    }

    pub fn no_circuit_breaker(mut self) -> Self {
        self.breaker = Some(BreakerMode::Disabled);
        self
    }

    /// Predicate deciding whether a failed attempt is retried. Receives the
    /// typed error. Defaults to retrying everything.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ClientError, &RequestParams) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Callback fired before each retry with the next attempt ordinal.
    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &ClientError, &RequestParams) + Send + Sync + 'static,
    {
        self.on_retry = Arc::new(callback);
        self
    }

    pub fn auto_parse_json(mut self, enabled: bool) -> Self {
        self.auto_parse_json = enabled;
        self
    }

    pub fn auto_decode_utf8(mut self, enabled: bool) -> Self {
        self.auto_decode_utf8 = enabled;
        self
    }

    /// Capture per-phase timings on every call unless the call overrides.
    pub fn timing(mut self, enabled: bool) -> Self {
        self.timing = enabled;
        self
    }

    /// Override the retry sleeper (deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        if self.hostname.is_empty() {
            return Err(ConfigError::EmptyHostname);
        }
        self.retry.validate()?;

        Ok(ClientConfig {
            name: self.name.unwrap_or_else(|| self.hostname.clone()),
            hostname: self.hostname,
            scheme: self.scheme,
            port: self.port,
            defaults: self.defaults,
            filters: self
                .filters
                .unwrap_or_else(|| vec![Arc::new(StatusCodeFilter::server_error())]),
            retry: self.retry,
            breaker: self
                .breaker
                .unwrap_or_else(|| BreakerMode::Shared(CircuitBreaker::new(BreakerConfig::default()))),
            should_retry: self.should_retry,
            on_retry: self.on_retry,
            auto_parse_json: self.auto_parse_json,
            auto_decode_utf8: self.auto_decode_utf8,
            timing: self.timing,
            sleeper: self.sleeper,
        })
    }
}
