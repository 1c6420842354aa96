//! Error taxonomy for client calls.
//!
//! Every failure surfaced to a caller is a [`ClientError`] with one of the
//! closed set of [`ErrorKind`]s, carrying whatever context existed when it
//! was raised: the offending request parameters, the partial response,
//! per-phase timings, and the errors of earlier attempts in the same call.

use crate::request::RequestParams;
use crate::response::Response;
use crate::timing::Timings;
use std::fmt;
use std::sync::Arc;

/// Boxed error type used at filter and body-stream boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Closed union of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Response body did not parse as JSON.
    BodyParseFailed,
    /// Transport-level failure (connect, TLS, read, decode).
    Network,
    /// Transport never reported connected within the window.
    ConnectionTimeout,
    /// No byte received within the idle window.
    ReadTimeout,
    /// A per-attempt or whole-call deadline expired.
    UserTimeout,
    /// The streaming request body failed mid-send.
    BodyStream,
    /// A request filter rejected.
    RequestFilterFailed,
    /// A response filter rejected.
    ResponseFilterFailed,
    /// The circuit breaker refused the call.
    CircuitOpen,
    /// The retry predicate declined to continue.
    ShouldRetryRejected,
    /// The retry schedule was exhausted.
    MaxRetriesReached,
    /// A bug or misconfiguration, not an upstream condition.
    InternalError,
}

impl ErrorKind {
    /// Stable discriminator name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BodyParseFailed => "BODY_PARSE_FAILED",
            ErrorKind::Network => "NETWORK",
            ErrorKind::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorKind::ReadTimeout => "READ_TIMEOUT",
            ErrorKind::UserTimeout => "USER_TIMEOUT",
            ErrorKind::BodyStream => "BODY_STREAM",
            ErrorKind::RequestFilterFailed => "REQUEST_FILTER_FAILED",
            ErrorKind::ResponseFilterFailed => "RESPONSE_FILTER_FAILED",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::ShouldRetryRejected => "SHOULD_RETRY_REJECTED",
            ErrorKind::MaxRetriesReached => "MAX_RETRIES_REACHED",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }

    /// True for the transport-level kinds a single HTTP attempt can end in.
    pub fn is_request_failed(self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::ConnectionTimeout
                | ErrorKind::ReadTimeout
                | ErrorKind::UserTimeout
                | ErrorKind::BodyStream
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed client failure with attached context.
#[derive(Debug, Clone)]
pub struct ClientError {
    kind: ErrorKind,
    message: String,
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    request: Option<RequestParams>,
    response: Option<Response>,
    timings: Option<Timings>,
    retry_errors: Vec<ClientError>,
}

impl ClientError {
    /// Message format is `"<client-name>: <TYPE>. <original-message>"`;
    /// the trailing space is trimmed when there is no original message.
    pub(crate) fn new(kind: ErrorKind, client_name: &str, original: Option<&str>) -> Self {
        let message = format!("{}: {}. {}", client_name, kind.as_str(), original.unwrap_or(""))
            .trim_end()
            .to_string();
        Self {
            kind,
            message,
            cause: None,
            request: None,
            response: None,
            timings: None,
            retry_errors: Vec::new(),
        }
    }

    pub(crate) fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub(crate) fn with_cause_arc(
        mut self,
        cause: Arc<dyn std::error::Error + Send + Sync + 'static>,
    ) -> Self {
        self.cause = Some(cause);
        self
    }

    pub(crate) fn with_request(mut self, request: RequestParams) -> Self {
        self.request = Some(request);
        self
    }

    pub(crate) fn with_response(mut self, response: Response) -> Self {
        if self.timings.is_none() {
            self.timings = response.timings;
        }
        self.response = Some(response);
        self
    }

    pub(crate) fn with_timings(mut self, timings: Option<Timings>) -> Self {
        if timings.is_some() {
            self.timings = timings;
        }
        self
    }

    pub(crate) fn with_retry_errors(mut self, retry_errors: Vec<ClientError>) -> Self {
        self.retry_errors = retry_errors;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The request parameters in play when the failure occurred, if known.
    pub fn request(&self) -> Option<&RequestParams> {
        self.request.as_ref()
    }

    /// The partial response, when one exists.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn timings(&self) -> Option<Timings> {
        self.timings
    }

    /// Errors observed on earlier attempts of the same call, oldest first.
    pub fn retry_errors(&self) -> &[ClientError] {
        &self.retry_errors
    }

    pub fn is_request_failed(&self) -> bool {
        self.kind.is_request_failed()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::CircuitOpen
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConnectionTimeout | ErrorKind::ReadTimeout | ErrorKind::UserTimeout
        )
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as _)
    }
}
