//! Request model: per-call options, the merged parameters an attempt runs
//! with, and the request body representation.

use crate::error::BoxError;
use bytes::Bytes;
use futures::stream::BoxStream;
use http::{HeaderMap, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// URL scheme of the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Streaming request body source. One-shot: the stream is consumed by the
/// first attempt that sends it.
pub type ByteStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// Request body: opaque bytes, a UTF-8 string, or a readable byte stream.
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Text(String),
    Stream(SharedStream),
}

impl Body {
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Body::Bytes(bytes.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Body::Text(text.into())
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Body::Stream(SharedStream::new(Box::pin(stream)))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Text(t) => write!(f, "Body::Text({} chars)", t.len()),
            Body::Stream(_) => write!(f, "Body::Stream"),
        }
    }
}

/// Clonable handle around a one-shot byte stream. Cloning shares the stream;
/// whichever attempt takes it first gets the data.
#[derive(Clone)]
pub struct SharedStream(Arc<Mutex<Option<ByteStream>>>);

impl SharedStream {
    fn new(stream: ByteStream) -> Self {
        Self(Arc::new(Mutex::new(Some(stream))))
    }

    pub(crate) fn take(&self) -> Option<ByteStream> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }
}

/// Per-call request options; every field optional, merged over the client's
/// defaults. Hostname is deliberately absent: it always comes from the
/// client.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Option<Method>,
    pub port: Option<u16>,
    /// Full request target including query string. Wins over
    /// `pathname`/`query` when set.
    pub path: Option<String>,
    pub pathname: Option<String>,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Body>,
    pub connection_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    /// End-to-end ceiling for a single attempt.
    pub drop_request_after: Option<Duration>,
    /// Wall-clock ceiling for the whole call, all attempts included.
    pub drop_all_requests_after: Option<Duration>,
    pub timing: Option<bool>,
    /// Observability span the attempt is instrumented with.
    pub span: Option<tracing::Span>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn pathname(mut self, pathname: impl Into<String>) -> Self {
        self.pathname = Some(pathname.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: http::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn drop_request_after(mut self, timeout: Duration) -> Self {
        self.drop_request_after = Some(timeout);
        self
    }

    pub fn drop_all_requests_after(mut self, timeout: Duration) -> Self {
        self.drop_all_requests_after = Some(timeout);
        self
    }

    pub fn timing(mut self, enabled: bool) -> Self {
        self.timing = Some(enabled);
        self
    }

    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }
}

/// Fully merged parameters for one call: client defaults overlaid with the
/// per-call options, every field resolved.
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub method: Method,
    pub scheme: Scheme,
    pub hostname: String,
    pub port: u16,
    /// Resolved request target: an explicit `path` wins, otherwise
    /// `pathname` plus the serialised query.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Body,
    pub connection_timeout: Duration,
    pub read_timeout: Duration,
    pub drop_request_after: Option<Duration>,
    pub drop_all_requests_after: Option<Duration>,
    pub timing: bool,
    pub span: tracing::Span,
}

impl RequestParams {
    /// Host header value: bare hostname on the scheme's default port,
    /// `host:port` otherwise.
    pub(crate) fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.hostname.clone()
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

/// Resolve the request target from an explicit path, or from pathname plus
/// serialised query pairs.
pub(crate) fn resolve_path(
    path: Option<String>,
    pathname: &str,
    query: &[(String, String)],
) -> String {
    if let Some(path) = path {
        return path;
    }
    if query.is_empty() {
        return pathname.to_string();
    }
    let serialised = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish();
    format!("{pathname}?{serialised}")
}
