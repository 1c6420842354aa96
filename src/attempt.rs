//! One HTTP attempt: dial, send, collect, decode.
//!
//! The attempt is non-retrying and ends in exactly one of a [`Response`] or
//! a typed transport error. The transport is dialed by hand (DNS, TCP, TLS,
//! HTTP/1 handshake) so each phase can be timed and timed out
//! independently.

use crate::error::{BoxError, ClientError, ErrorKind};
use crate::request::{Body, RequestParams, Scheme};
use crate::response::{Response, ResponseBody};
use crate::timing::TimingRecorder;
use bytes::{Bytes, BytesMut};
use flate2::read::{GzDecoder, ZlibDecoder};
use futures::StreamExt;
use http::header::{CONTENT_ENCODING, HOST};
use http::{HeaderMap, HeaderValue};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::convert::Infallible;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::Instrument;

type AttemptBody = UnsyncBoxBody<Bytes, BoxError>;

/// Execute one attempt. Timings are attached to whichever outcome the
/// attempt ends in; `drop_request_after` bounds the attempt end to end.
pub(crate) async fn execute(
    name: &str,
    tls: &Arc<rustls::ClientConfig>,
    params: &RequestParams,
    auto_decode_utf8: bool,
) -> Result<Response, ClientError> {
    let mut recorder = TimingRecorder::new(params.timing);
    let span = params.span.clone();

    let outcome = {
        let attempt =
            attempt_inner(name, tls, params, auto_decode_utf8, &mut recorder).instrument(span.clone());
        match params.drop_request_after {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::new(
                    ErrorKind::UserTimeout,
                    name,
                    Some(&format!("attempt exceeded {limit:?}")),
                )),
            },
            None => attempt.await,
        }
    };

    let timings = recorder.finish();
    match outcome {
        Ok(mut response) => {
            response.timings = timings;
            Ok(response)
        }
        Err(error) => {
            let error = error.with_timings(timings).with_request(params.clone());
            span.in_scope(|| tracing::debug!(error = %error, "request error"));
            Err(error)
        }
    }
}

async fn attempt_inner(
    name: &str,
    tls: &Arc<rustls::ClientConfig>,
    params: &RequestParams,
    auto_decode_utf8: bool,
    recorder: &mut TimingRecorder,
) -> Result<Response, ClientError> {
    tracing::debug!(
        method = %params.method,
        host = %params.hostname,
        path = %params.path,
        "request start"
    );

    recorder.socket();
    tracing::trace!("socket assigned");

    let (mut sender, _conn) = {
        let dialing = dial(name, tls, params, recorder);
        match tokio::time::timeout(params.connection_timeout, dialing).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::new(
                    ErrorKind::ConnectionTimeout,
                    name,
                    Some(&format!("no connection within {:?}", params.connection_timeout)),
                ))
            }
        }
    };

    let body_errored = Arc::new(AtomicBool::new(false));
    let request = build_request(name, params, body_errored.clone())?;

    let response =
        match tokio::time::timeout(params.read_timeout, sender.send_request(request)).await {
            Err(_) => return Err(read_timeout_error(name, params)),
            Ok(Err(error)) => {
                // The hyper error is the same either way; the flag tells a
                // failed request-body stream apart from a transport fault.
                let kind = if body_errored.load(Ordering::Acquire) {
                    ErrorKind::BodyStream
                } else {
                    ErrorKind::Network
                };
                return Err(ClientError::new(kind, name, Some(&error.to_string()))
                    .with_cause(error));
            }
            Ok(Ok(response)) => response,
        };

    recorder.response();
    tracing::trace!(status = response.status().as_u16(), "response headers");

    let (parts, mut incoming) = response.into_parts();
    let mut collected = BytesMut::new();
    loop {
        let frame = match tokio::time::timeout(params.read_timeout, incoming.frame()).await {
            Err(_) => return Err(read_timeout_error(name, params)),
            Ok(None) => break,
            Ok(Some(Err(error))) => {
                return Err(ClientError::new(ErrorKind::Network, name, Some(&error.to_string()))
                    .with_cause(error))
            }
            Ok(Some(Ok(frame))) => frame,
        };
        if let Ok(data) = frame.into_data() {
            tracing::trace!(bytes = data.len(), "body chunk");
            collected.extend_from_slice(&data);
        }
    }
    recorder.end();
    tracing::trace!(total_bytes = collected.len(), "body end");

    let raw = decode_content_encoding(name, &parts.headers, collected.freeze())?;
    // Bytes are accumulated before decoding so chunk boundaries splitting
    // multi-byte code points cannot corrupt the text.
    let body = if auto_decode_utf8 {
        ResponseBody::Text(String::from_utf8_lossy(&raw).into_owned())
    } else if raw.is_empty() {
        ResponseBody::Empty
    } else {
        ResponseBody::Bytes(raw)
    };

    Ok(Response {
        status: parts.status,
        headers: parts.headers,
        body,
        request: Some(params.clone()),
        timings: None,
        retry_errors: Vec::new(),
    })
}

/// Connection task handle; aborting on drop tears the socket down with the
/// attempt.
struct ConnGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl ConnGuard {
    fn spawn<T>(conn: http1::Connection<T, AttemptBody>) -> Self
    where
        T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(error) = conn.await {
                tracing::trace!(error = %error, "connection task ended");
            }
        });
        Self { handle }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// DNS → TCP → (TLS) → HTTP/1 handshake, recording each phase.
async fn dial(
    name: &str,
    tls: &Arc<rustls::ClientConfig>,
    params: &RequestParams,
    recorder: &mut TimingRecorder,
) -> Result<(http1::SendRequest<AttemptBody>, ConnGuard), ClientError> {
    let mut addrs = tokio::net::lookup_host((params.hostname.as_str(), params.port))
        .await
        .map_err(|error| network_error(name, error))?;
    let addr = addrs.next().ok_or_else(|| {
        ClientError::new(ErrorKind::Network, name, Some("hostname resolved to no addresses"))
    })?;
    recorder.lookup();
    tracing::trace!(%addr, "dns resolved");

    let tcp = TcpStream::connect(addr).await.map_err(|error| network_error(name, error))?;
    recorder.connect();
    tracing::trace!("tcp connected");

    match params.scheme {
        Scheme::Http => {
            let (sender, conn) = http1::handshake(TokioIo::new(tcp))
                .await
                .map_err(|error| network_error(name, error))?;
            Ok((sender, ConnGuard::spawn(conn)))
        }
        Scheme::Https => {
            let server_name = ServerName::try_from(params.hostname.clone())
                .map_err(|error| network_error(name, error))?;
            let stream = TlsConnector::from(tls.clone())
                .connect(server_name, tcp)
                .await
                .map_err(|error| network_error(name, error))?;
            recorder.secure_connect();
            tracing::trace!("tls connected");
            let (sender, conn) = http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|error| network_error(name, error))?;
            Ok((sender, ConnGuard::spawn(conn)))
        }
    }
}

fn network_error<E>(name: &str, error: E) -> ClientError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ClientError::new(ErrorKind::Network, name, Some(&error.to_string())).with_cause(error)
}

fn internal_error<E>(name: &str, error: E) -> ClientError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ClientError::new(ErrorKind::InternalError, name, Some(&error.to_string())).with_cause(error)
}

fn read_timeout_error(name: &str, params: &RequestParams) -> ClientError {
    ClientError::new(
        ErrorKind::ReadTimeout,
        name,
        Some(&format!("no data within {:?}", params.read_timeout)),
    )
}

fn empty_body() -> AttemptBody {
    Empty::<Bytes>::new().map_err(|never: Infallible| -> BoxError { match never {} }).boxed_unsync()
}

fn full_body(bytes: Bytes) -> AttemptBody {
    Full::new(bytes).map_err(|never: Infallible| -> BoxError { match never {} }).boxed_unsync()
}

fn build_request(
    name: &str,
    params: &RequestParams,
    body_errored: Arc<AtomicBool>,
) -> Result<http::Request<AttemptBody>, ClientError> {
    let body: AttemptBody = match &params.body {
        Body::Empty => empty_body(),
        Body::Bytes(bytes) => full_body(bytes.clone()),
        Body::Text(text) => full_body(Bytes::from(text.clone())),
        Body::Stream(shared) => match shared.take() {
            Some(stream) => {
                let flagged = stream.map(move |item| match item {
                    Ok(chunk) => Ok(hyper::body::Frame::data(chunk)),
                    Err(error) => {
                        body_errored.store(true, Ordering::Release);
                        Err(error)
                    }
                });
                StreamBody::new(flagged).boxed_unsync()
            }
            // Stream bodies are one-shot; a retried attempt finds it drained.
            None => empty_body(),
        },
    };

    let uri: http::Uri = params.path.parse().map_err(|error: http::uri::InvalidUri| {
        internal_error(name, error)
    })?;
    let host = HeaderValue::from_str(&params.host_header())
        .map_err(|error| internal_error(name, error))?;

    let mut request = http::Request::builder()
        .method(params.method.clone())
        .uri(uri)
        .body(body)
        .map_err(|error| internal_error(name, error))?;
    *request.headers_mut() = params.headers.clone();
    request.headers_mut().entry(HOST).or_insert(host);
    Ok(request)
}

/// Undo gzip/deflate content encodings; unknown encodings pass through.
fn decode_content_encoding(
    name: &str,
    headers: &HeaderMap,
    raw: Bytes,
) -> Result<Bytes, ClientError> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let decoded = match encoding.as_str() {
        "" | "identity" => return Ok(raw),
        "gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(raw.as_ref()).read_to_end(&mut out).map(|_| out)
        }
        "deflate" => {
            let mut out = Vec::new();
            ZlibDecoder::new(raw.as_ref()).read_to_end(&mut out).map(|_| out)
        }
        _ => return Ok(raw),
    };

    match decoded {
        Ok(out) => Ok(Bytes::from(out)),
        Err(error) => Err(network_error(name, error)),
    }
}
