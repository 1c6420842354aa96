use surecall::{
    BreakerConfig, CircuitBreaker, Client, ClientConfig, ClientConfigBuilder, ErrorKind,
    RequestOptions, RetryPolicy, Scheme, TrackingSleeper,
};
use http::StatusCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn builder_for(server: &MockServer) -> ClientConfigBuilder {
    let addr = server.address();
    ClientConfig::builder(addr.ip().to_string()).scheme(Scheme::Http).port(addr.port())
}

fn retry_policy(retries: u32, min: u64, max: u64) -> RetryPolicy {
    RetryPolicy {
        retries,
        factor: 2.0,
        min_timeout: Duration::from_millis(min),
        max_timeout: Duration::from_millis(max),
        randomize: false,
    }
}

async fn mount_json_ok(server: &MockServer, body: &str) {
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_string(), "application/json"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn retries_until_success_and_reports_prior_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(501))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_json_ok(&server, "{\"foo\":\"bar\"}").await;

    let sleeper = TrackingSleeper::new();
    let client = Client::new(
        builder_for(&server)
            .retry(retry_policy(3, 10, 40))
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap(),
    )
    .unwrap();

    let response = client.request(RequestOptions::new()).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_json().unwrap()["foo"], "bar");
    assert_eq!(response.retry_errors.len(), 2);
    for error in &response.retry_errors {
        assert_eq!(error.kind(), ErrorKind::ResponseFilterFailed);
    }
    // Schedule is [10, 20, 40]; two retries consume the first two delays.
    assert_eq!(
        sleeper.calls(),
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn on_retry_sees_successive_attempt_ordinals() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(501))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_json_ok(&server, "{}").await;

    let ordinals = Arc::new(Mutex::new(Vec::new()));
    let ordinals_clone = ordinals.clone();
    let client = Client::new(
        builder_for(&server)
            .retry(retry_policy(3, 0, 0))
            .on_retry(move |attempt, error, _params| {
                assert_eq!(error.kind(), ErrorKind::ResponseFilterFailed);
                ordinals_clone.lock().unwrap().push(attempt);
            })
            .build()
            .unwrap(),
    )
    .unwrap();

    client.request(RequestOptions::new()).await.unwrap();
    assert_eq!(*ordinals.lock().unwrap(), vec![2, 3]);
}

#[tokio::test]
async fn exhausted_schedule_is_max_retries_reached() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(501)).mount(&server).await;

    let client = Client::new(
        builder_for(&server).retry(retry_policy(1, 0, 0)).build().unwrap(),
    )
    .unwrap();

    let error = client.request(RequestOptions::new()).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::MaxRetriesReached);
    // Both failed attempts are recorded, oldest first; the latest is also
    // the wrapped cause.
    assert_eq!(error.retry_errors().len(), 2);
    assert!(error
        .retry_errors()
        .iter()
        .all(|e| e.kind() == ErrorKind::ResponseFilterFailed));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn zero_retries_surfaces_the_raw_typed_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(501)).mount(&server).await;

    let client = Client::new(builder_for(&server).build().unwrap()).unwrap();
    let error = client.request(RequestOptions::new()).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ResponseFilterFailed, "not MAX_RETRIES_REACHED");
    assert!(error.retry_errors().is_empty());
}

#[tokio::test]
async fn should_retry_false_rejects_without_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(501)).mount(&server).await;

    let client = Client::new(
        builder_for(&server)
            .retry(retry_policy(3, 0, 0))
            .should_retry(|error, _params| error.kind() != ErrorKind::ResponseFilterFailed)
            .build()
            .unwrap(),
    )
    .unwrap();

    let error = client.request(RequestOptions::new()).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ShouldRetryRejected);
    assert!(error.message().contains("RESPONSE_FILTER_FAILED"));
    assert_eq!(server.received_requests().await.unwrap().len(), 1, "no retry attempted");
}

#[tokio::test]
async fn breaker_trips_after_error_rate_crosses_threshold() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fail"))
        .respond_with(ResponseTemplate::new(501))
        .mount(&server)
        .await;

    let breaker = CircuitBreaker::new(BreakerConfig {
        volume_threshold: 10,
        ..BreakerConfig::default()
    });
    let client =
        Client::new(builder_for(&server).breaker(breaker.clone()).build().unwrap()).unwrap();

    // S,S,E,S,E,E,E,S,E,E,S: 6 errors over 11 calls = 54.5% > 50%.
    let outcomes = [true, true, false, true, false, false, false, true, false, false, true];
    for ok in outcomes {
        let pathname = if ok { "/ok" } else { "/fail" };
        let _ = client.request(RequestOptions::new().pathname(pathname)).await;
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 11);

    let error = client
        .request(RequestOptions::new().pathname("/ok"))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::CircuitOpen);
    assert!(error.is_circuit_open());
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        11,
        "no HTTP attempt once the circuit is open"
    );
    assert_eq!(breaker.metrics().short_circuits, 1);
}

#[tokio::test]
async fn exactly_volume_threshold_failures_do_not_trip() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(501)).mount(&server).await;

    let breaker = CircuitBreaker::new(BreakerConfig {
        volume_threshold: 5,
        ..BreakerConfig::default()
    });
    let client =
        Client::new(builder_for(&server).breaker(breaker.clone()).build().unwrap()).unwrap();

    for _ in 0..5 {
        let error = client.request(RequestOptions::new()).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ResponseFilterFailed);
    }
    assert!(!breaker.is_open(), "strictly more than volume_threshold observations required");
}

#[tokio::test]
async fn forced_open_breaker_rejects_until_unforced() {
    let server = MockServer::start().await;
    mount_json_ok(&server, "{}").await;

    let breaker = CircuitBreaker::new(BreakerConfig::default());
    let client =
        Client::new(builder_for(&server).breaker(breaker.clone()).build().unwrap()).unwrap();

    breaker.force_open();
    let error = client.request(RequestOptions::new()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::CircuitOpen);
    assert!(server.received_requests().await.unwrap().is_empty());

    breaker.unforce();
    let response = client.request(RequestOptions::new()).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn breaker_factory_isolates_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(501)).mount(&server).await;

    let made = Arc::new(AtomicUsize::new(0));
    let made_clone = made.clone();
    let client = Client::new(
        builder_for(&server)
            .breaker_factory(move || {
                made_clone.fetch_add(1, Ordering::SeqCst);
                CircuitBreaker::new(BreakerConfig { volume_threshold: 1, ..BreakerConfig::default() })
            })
            .build()
            .unwrap(),
    )
    .unwrap();

    for _ in 0..3 {
        let error = client.request(RequestOptions::new()).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ResponseFilterFailed, "fresh breaker per call");
    }
    assert_eq!(made.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn global_deadline_rejects_with_prior_attempt_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(501))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("{}", "application/json")
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let client = Client::new(
        builder_for(&server).retry(retry_policy(2, 0, 0)).build().unwrap(),
    )
    .unwrap();

    let started = Instant::now();
    let error = client
        .request(
            RequestOptions::new().drop_all_requests_after(Duration::from_millis(80)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(error.kind(), ErrorKind::UserTimeout);
    assert!(elapsed < Duration::from_millis(450), "must not wait out the upstream delay");
    // Two fast failures happened before the deadline cut the third attempt.
    assert_eq!(error.retry_errors().len(), 2);
    assert!(error
        .retry_errors()
        .iter()
        .all(|e| e.kind() == ErrorKind::ResponseFilterFailed));
}

#[tokio::test]
async fn global_deadline_fires_during_a_retry_delay() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(501)).mount(&server).await;

    let client = Client::new(
        builder_for(&server).retry(retry_policy(1, 400, 400)).build().unwrap(),
    )
    .unwrap();

    let started = Instant::now();
    let error = client
        .request(RequestOptions::new().drop_all_requests_after(Duration::from_millis(60)))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::UserTimeout);
    assert!(started.elapsed() < Duration::from_millis(350), "retry delay must be cut short");
    assert_eq!(error.retry_errors().len(), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1, "no further attempts");
}

#[tokio::test]
async fn per_attempt_deadline_is_user_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("{}", "application/json")
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let client = Client::new(builder_for(&server).build().unwrap()).unwrap();
    let error = client
        .request(RequestOptions::new().drop_request_after(Duration::from_millis(50)))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::UserTimeout);
}

#[tokio::test]
async fn slow_response_headers_are_read_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("{}", "application/json")
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let client = Client::new(builder_for(&server).build().unwrap()).unwrap();
    let error = client
        .request(RequestOptions::new().read_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ReadTimeout);
}

#[tokio::test]
async fn refused_connection_is_a_network_error() {
    // Grab a port that nothing listens on any more.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = Client::new(
        ClientConfig::builder("127.0.0.1").scheme(Scheme::Http).port(port).build().unwrap(),
    )
    .unwrap();

    let error = client.request(RequestOptions::new()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Network);
    assert!(error.is_request_failed());
}

#[tokio::test]
async fn retry_error_count_is_bounded_by_retries_plus_one() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(501)).mount(&server).await;

    for retries in [0u32, 1, 3] {
        let client = Client::new(
            builder_for(&server).retry(retry_policy(retries, 0, 0)).build().unwrap(),
        )
        .unwrap();
        let error = client.request(RequestOptions::new()).await.unwrap_err();
        assert!(error.retry_errors().len() as u32 <= retries + 1);
    }
}
