//! Filter pipeline: ordered request/response transforms around the HTTP
//! attempt.
//!
//! Request transforms run in declared order and may short-circuit with a
//! synthetic [`Response`]; response transforms unwind in reverse over
//! exactly the prefix of filters whose request side ran.

use crate::error::BoxError;
use crate::request::RequestParams;
use crate::response::Response;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Outcome of a request-side transform.
pub enum FilterAction {
    /// Keep going with (possibly rewritten) parameters.
    Continue(RequestParams),
    /// Skip the HTTP attempt and later request transforms; the pipeline
    /// unwinds response transforms over this response.
    ShortCircuit(Response),
}

/// A request transform, a response transform, or both. The defaults pass
/// through, so implementors override only the side they care about.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn request(&self, params: RequestParams) -> Result<FilterAction, BoxError> {
        Ok(FilterAction::Continue(params))
    }

    async fn response(&self, response: Response) -> Result<Response, BoxError> {
        Ok(response)
    }
}

/// Where the request-side pass ended up.
pub(crate) enum RequestSide {
    /// All transforms ran; dispatch with these parameters.
    Dispatch(RequestParams),
    /// A transform short-circuited with this response.
    ShortCircuit(Response),
}

/// Run request transforms forward. Returns how many filters participated
/// (the prefix that response transforms must unwind over) alongside the
/// outcome; on rejection, the participant is the failing filter's index.
pub(crate) async fn apply_request_filters(
    filters: &[Arc<dyn Filter>],
    params: RequestParams,
) -> Result<(usize, RequestSide), BoxError> {
    let mut current = params;
    for (index, filter) in filters.iter().enumerate() {
        let staged = current.clone();
        match filter.request(current).await {
            Ok(FilterAction::Continue(next)) => current = next,
            Ok(FilterAction::ShortCircuit(mut response)) => {
                if response.request.is_none() {
                    response.request = Some(staged);
                }
                return Ok((index + 1, RequestSide::ShortCircuit(response)));
            }
            Err(error) => return Err(error),
        }
    }
    Ok((filters.len(), RequestSide::Dispatch(current)))
}

/// Unwind response transforms in reverse over the participating prefix.
/// A rejection hands back the response the failing filter received so the
/// caller can attach it to the typed error.
pub(crate) async fn apply_response_filters(
    filters: &[Arc<dyn Filter>],
    participants: usize,
    mut response: Response,
) -> Result<Response, (BoxError, Response)> {
    for filter in filters[..participants.min(filters.len())].iter().rev() {
        let original = response.clone();
        match filter.response(response).await {
            Ok(next) => response = next,
            Err(error) => return Err((error, original)),
        }
    }
    Ok(response)
}

/// Rejection raised by [`StatusCodeFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCodeError {
    pub status: http::StatusCode,
}

impl fmt::Display for StatusCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected status code {}", self.status)
    }
}

impl std::error::Error for StatusCodeError {}

/// Response filter rejecting every status at or above a threshold.
#[derive(Debug, Clone, Copy)]
pub struct StatusCodeFilter {
    threshold: u16,
}

impl StatusCodeFilter {
    /// Treat `5xx` as failure. Installed by default on every client.
    pub fn server_error() -> Self {
        Self { threshold: 500 }
    }

    /// Treat `4xx` and `5xx` as failure.
    pub fn client_error() -> Self {
        Self { threshold: 400 }
    }
}

#[async_trait]
impl Filter for StatusCodeFilter {
    async fn response(&self, response: Response) -> Result<Response, BoxError> {
        if response.status.as_u16() >= self.threshold {
            return Err(Box::new(StatusCodeError { status: response.status }));
        }
        Ok(response)
    }
}
