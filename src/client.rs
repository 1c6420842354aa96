//! The client and its request orchestrator.
//!
//! One call = one future with exactly one terminal outcome. Per attempt the
//! orchestrator gates on the breaker, runs the filter pipeline around the
//! HTTP attempt, charges the breaker with the outcome, and consults the
//! retry policy; a global deadline bounds the whole call.

use crate::attempt;
use crate::config::{BreakerMode, ClientConfig, ConfigError};
use crate::error::{ClientError, ErrorKind};
use crate::filter::{self, RequestSide};
use crate::request::{RequestOptions, RequestParams};
use crate::response::{is_json_content_type, Response, ResponseBody};
use crate::retry::RetryOperation;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Resilient HTTP client for one upstream host. Cheap to clone; all clones
/// share the same configuration and breaker.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    tls: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("config", &self.inner.config).finish()
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let tls = build_tls()?;
        Ok(Self { inner: Arc::new(ClientInner { config, tls }) })
    }

    /// Construct from a URL string; scheme, host, port, path and query
    /// become the client defaults.
    pub fn from_url(raw: &str) -> Result<Self, ConfigError> {
        Self::new(ClientConfig::from_url(raw)?.build()?)
    }

    pub fn name(&self) -> &str {
        self.inner.config.name()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Perform one logical request: filters, breaker, retries and deadline
    /// all applied. Resolves with the response (carrying any errors from
    /// earlier attempts) or the typed terminal error.
    pub async fn request(&self, options: RequestOptions) -> Result<Response, ClientError> {
        let inner = self.inner.clone();
        let name = inner.config.name().to_string();
        let params = inner.config.merge(options);

        let breaker = match &inner.config.breaker {
            BreakerMode::Disabled => None,
            BreakerMode::Shared(breaker) => Some(breaker.clone()),
            BreakerMode::PerRequest(factory) => Some(factory()),
        };

        let deadline =
            params.drop_all_requests_after.map(|limit| tokio::time::Instant::now() + limit);

        let schedule = match inner.config.retry.schedule() {
            Ok(schedule) => schedule,
            Err(error) => {
                return Err(ClientError::new(
                    ErrorKind::InternalError,
                    &name,
                    Some(&error.to_string()),
                )
                .with_cause(error))
            }
        };
        let retries = inner.config.retry.retries;

        let op_inner = inner.clone();
        let op_params = params.clone();
        let mut driver = RetryOperation::new(schedule, move |attempt| {
            let inner = op_inner.clone();
            let params = op_params.clone();
            async move { inner.run_attempt(attempt, &params, deadline).await }
        })
        .with_sleeper(inner.config.sleeper.clone());

        let mut retry_errors: Vec<ClientError> = Vec::new();

        loop {
            // Gate before the attempt; an open breaker consumes no attempt
            // and contributes no error count.
            let enrollment = match &breaker {
                Some(breaker) => match breaker.try_acquire() {
                    Ok(enrollment) => Some(enrollment),
                    Err(rejection) => {
                        let metrics = rejection.metrics;
                        let message = format!(
                            "circuit open ({:.1}% errors over {} calls)",
                            metrics.error_percentage, metrics.total
                        );
                        return Err(ClientError::new(ErrorKind::CircuitOpen, &name, Some(&message))
                            .with_request(params.clone())
                            .with_retry_errors(retry_errors));
                    }
                },
                None => None,
            };

            match driver.attempt().await {
                Ok(mut response) => {
                    if let Some(enrollment) = &enrollment {
                        enrollment.success();
                    }
                    response.retry_errors = retry_errors;
                    return Ok(response);
                }
                Err(error) => {
                    if let Some(enrollment) = &enrollment {
                        enrollment.failure();
                    }

                    // Global ceiling hit: the in-flight attempt was aborted
                    // and no further retries are scheduled.
                    if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                        let terminal = if error.kind() == ErrorKind::UserTimeout {
                            error
                        } else {
                            ClientError::new(
                                ErrorKind::UserTimeout,
                                &name,
                                Some(error.message()),
                            )
                            .with_request(params.clone())
                            .with_cause_arc(Arc::new(error))
                        };
                        return Err(terminal.with_retry_errors(retry_errors));
                    }

                    if !(inner.config.should_retry)(&error, &params) {
                        let terminal = ClientError::new(
                            ErrorKind::ShouldRetryRejected,
                            &name,
                            Some(error.message()),
                        )
                        .with_request(params.clone())
                        .with_cause_arc(Arc::new(error));
                        return Err(terminal.with_retry_errors(retry_errors));
                    }

                    let step = match deadline {
                        Some(d) => tokio::time::timeout_at(d, driver.retry(false)).await,
                        None => Ok(driver.retry(false).await),
                    };
                    let next = match step {
                        // Deadline fired mid-delay.
                        Err(_) => {
                            retry_errors.push(error);
                            return Err(ClientError::new(ErrorKind::UserTimeout, &name, None)
                                .with_request(params.clone())
                                .with_retry_errors(retry_errors));
                        }
                        Ok(next) => next,
                    };

                    match next {
                        None => {
                            if retries == 0 {
                                // Callers who disabled retries see the raw
                                // typed error.
                                return Err(error.with_retry_errors(retry_errors));
                            }
                            let message = error.message().to_string();
                            let terminal = ClientError::new(
                                ErrorKind::MaxRetriesReached,
                                &name,
                                Some(&message),
                            )
                            .with_request(params.clone());
                            retry_errors.push(error.clone());
                            return Err(terminal
                                .with_cause_arc(Arc::new(error))
                                .with_retry_errors(retry_errors));
                        }
                        Some(next_attempt) => {
                            tracing::debug!(attempt = next_attempt, error = %error, "retrying");
                            (inner.config.on_retry)(next_attempt, &error, &params);
                            retry_errors.push(error);
                        }
                    }
                }
            }
        }
    }
}

impl ClientInner {
    async fn run_attempt(
        &self,
        attempt: u32,
        params: &RequestParams,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Response, ClientError> {
        tracing::trace!(attempt, "attempt start");
        let pipeline = self.run_pipeline(params);
        match deadline {
            Some(d) => match tokio::time::timeout_at(d, pipeline).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::new(
                    ErrorKind::UserTimeout,
                    self.config.name(),
                    Some("call deadline exceeded"),
                )
                .with_request(params.clone())),
            },
            None => pipeline.await,
        }
    }

    /// Request filters forward, HTTP attempt (unless short-circuited), JSON
    /// decode, then response filters in reverse over the ran prefix.
    async fn run_pipeline(&self, params: &RequestParams) -> Result<Response, ClientError> {
        let name = self.config.name();
        let filters = &self.config.filters;

        let (participants, side) = match filter::apply_request_filters(filters, params.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                return Err(ClientError::new(
                    ErrorKind::RequestFilterFailed,
                    name,
                    Some(&error.to_string()),
                )
                .with_cause_arc(Arc::from(error))
                .with_request(params.clone()))
            }
        };

        let response = match side {
            RequestSide::ShortCircuit(response) => response,
            RequestSide::Dispatch(final_params) => {
                let response = attempt::execute(
                    name,
                    &self.tls,
                    &final_params,
                    self.config.auto_decode_utf8,
                )
                .await?;
                self.decode_json(response)?
            }
        };

        match filter::apply_response_filters(filters, participants, response).await {
            Ok(response) => Ok(response),
            Err((error, original)) => Err(ClientError::new(
                ErrorKind::ResponseFilterFailed,
                name,
                Some(&error.to_string()),
            )
            .with_cause_arc(Arc::from(error))
            .with_request(params.clone())
            .with_response(original)),
        }
    }

    fn decode_json(&self, mut response: Response) -> Result<Response, ClientError> {
        if !self.config.auto_parse_json {
            return Ok(response);
        }
        let is_json = response.content_type().is_some_and(is_json_content_type);
        if !is_json {
            return Ok(response);
        }

        let parsed = match &response.body {
            ResponseBody::Text(text) => serde_json::from_str::<serde_json::Value>(text),
            ResponseBody::Bytes(bytes) => serde_json::from_slice(bytes),
            _ => return Ok(response),
        };

        match parsed {
            Ok(value) => {
                response.body = ResponseBody::Json(value);
                Ok(response)
            }
            Err(error) => {
                let mut typed = ClientError::new(
                    ErrorKind::BodyParseFailed,
                    self.config.name(),
                    Some(&error.to_string()),
                )
                .with_cause(error)
                .with_timings(response.timings);
                if let Some(request) = response.request.clone() {
                    typed = typed.with_request(request);
                }
                Err(typed.with_response(response))
            }
        }
    }
}

impl tower_service::Service<RequestOptions> for Client {
    type Response = Response;
    type Error = ClientError;
    type Future = BoxFuture<'static, Result<Response, ClientError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, options: RequestOptions) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.request(options).await })
    }
}

fn build_tls() -> Result<Arc<rustls::ClientConfig>, ConfigError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|error| ConfigError::Tls(error.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
