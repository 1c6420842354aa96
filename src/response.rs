//! Response model and body decoding.

use crate::error::ClientError;
use crate::request::RequestParams;
use crate::timing::Timings;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};

/// Response body in whatever shape decoding left it: raw bytes, decoded
/// UTF-8 text, or parsed JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResponseBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
}

impl ResponseBody {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ResponseBody::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for ResponseBody {
    fn from(value: serde_json::Value) -> Self {
        ResponseBody::Json(value)
    }
}

impl From<String> for ResponseBody {
    fn from(text: String) -> Self {
        ResponseBody::Text(text)
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        ResponseBody::Bytes(bytes)
    }
}

/// One upstream (or filter-synthesised) response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// The merged parameters that produced this response. Filled by the
    /// pipeline for filter-synthesised responses that leave it empty.
    pub request: Option<RequestParams>,
    pub timings: Option<Timings>,
    /// Errors of earlier attempts in the same call, oldest first.
    pub retry_errors: Vec<ClientError>,
}

impl Response {
    /// Construct a bare response, typically from a request filter that
    /// short-circuits the HTTP attempt.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            request: None,
            timings: None,
            retry_errors: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<ResponseBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// True for `application/json` and any `application/*+json` media type,
/// parameters ignored.
pub(crate) fn is_json_content_type(content_type: &str) -> bool {
    let essence =
        content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    essence == "application/json"
        || (essence.len() > "application/+json".len()
            && essence.starts_with("application/")
            && essence.ends_with("+json"))
}
