//! Rolling-window circuit breaker.
//!
//! Outcomes are tallied into a ring of fixed-duration buckets covering the
//! configured window; a background ticker advances the ring. The breaker
//! trips OPEN when the windowed error percentage crosses the threshold over
//! a minimum observation volume, waits, admits a single HALF_OPEN probe,
//! and closes again on probe success.
//!
//! All bucket and state mutation happens under one mutex so concurrent
//! outcomes can never tear a transition. Transition callbacks run with no
//! lock held.

use crate::clock::{Clock, MonotonicClock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Counters for one fixed-duration slot of the rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub short_circuits: u64,
}

/// Logical breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Total rolling window covered by the bucket ring.
    pub window_duration: Duration,
    /// Number of equal-duration buckets in the window.
    pub num_buckets: usize,
    /// Error percentage above which the breaker trips (strict `>`).
    pub error_threshold: f64,
    /// Minimum windowed observations before the breaker may trip
    /// (strict `>`).
    pub volume_threshold: u64,
    /// Time spent OPEN before a probe is admitted; half the window when
    /// unset.
    pub wait_duration_in_open_state: Option<Duration>,
    /// An enrolment unresolved after this long is charged as a timeout.
    pub command_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_duration: Duration::from_millis(10_000),
            num_buckets: 10,
            error_threshold: 50.0,
            volume_threshold: 10,
            wait_duration_in_open_state: None,
            command_timeout: Duration::from_millis(3_000),
        }
    }
}

impl BreakerConfig {
    fn wait_duration(&self) -> Duration {
        self.wait_duration_in_open_state.unwrap_or(self.window_duration / 2)
    }

    fn bucket_duration(&self) -> Duration {
        self.window_duration / self.num_buckets.max(1) as u32
    }
}

/// Aggregated counters over the whole window, handed to transition
/// callbacks and open rejections.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub short_circuits: u64,
    pub total: u64,
    pub error_count: u64,
    pub error_percentage: f64,
}

type TransitionCallback = Arc<dyn Fn(&MetricsSnapshot) + Send + Sync>;

/// Builder for a [`CircuitBreaker`]; the ticker starts at `build()`.
pub struct CircuitBreakerBuilder {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    on_open: Option<TransitionCallback>,
    on_close: Option<TransitionCallback>,
}

impl CircuitBreakerBuilder {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock::default()),
            on_open: None,
            on_close: None,
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn on_circuit_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MetricsSnapshot) + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(callback));
        self
    }

    pub fn on_circuit_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MetricsSnapshot) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> CircuitBreaker {
        let buckets = vec![Bucket::default(); self.config.num_buckets.max(1)];
        let inner = Arc::new(Inner {
            config: self.config,
            clock: self.clock,
            on_open: self.on_open,
            on_close: self.on_close,
            cell: Mutex::new(Cell {
                buckets,
                current: 0,
                state: BreakerState::Closed,
                opened_at: None,
                half_open_probe: false,
                forced: None,
                ticker_started: false,
            }),
        });
        let breaker = CircuitBreaker { inner };
        Inner::ensure_ticker(&breaker.inner);
        breaker
    }
}

/// Rolling-window failure detector with OPEN / HALF_OPEN / CLOSED states.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Why the breaker refused a command.
#[derive(Debug, Clone, Copy)]
pub struct OpenRejection {
    pub metrics: MetricsSnapshot,
}

/// Error surfaced by [`CircuitBreaker::run`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker was open; the command did not run.
    Open { metrics: MetricsSnapshot },
    /// The command itself failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open { metrics } => write!(
                f,
                "circuit breaker open ({:.1}% errors over {} calls)",
                metrics.error_percentage, metrics.total
            ),
            BreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreakerBuilder::new(config).build()
    }

    pub fn builder(config: BreakerConfig) -> CircuitBreakerBuilder {
        CircuitBreakerBuilder::new(config)
    }

    /// True iff the current logical state is OPEN.
    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    /// Current logical state, applying the OPEN→HALF_OPEN wait if it has
    /// elapsed.
    pub fn state(&self) -> BreakerState {
        let mut cell = self.inner.lock();
        self.inner.refresh(&mut cell);
        cell.state
    }

    /// Windowed counters as of now.
    pub fn metrics(&self) -> MetricsSnapshot {
        snapshot(&self.inner.lock())
    }

    /// Gate a command: either an enrolment to charge at command end, or an
    /// open rejection (tallied as a short circuit).
    pub fn try_acquire(&self) -> Result<Enrollment, OpenRejection> {
        Inner::acquire(&self.inner)
    }

    /// Run a command under the breaker's supervision.
    pub async fn run<T, E, Fut, Op>(&self, operation: Op) -> Result<T, BreakerError<E>>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        match self.try_acquire() {
            Err(rejection) => Err(BreakerError::Open { metrics: rejection.metrics }),
            Ok(enrollment) => {
                let result = operation().await;
                match &result {
                    Ok(_) => enrollment.success(),
                    Err(_) => enrollment.failure(),
                }
                result.map_err(BreakerError::Inner)
            }
        }
    }

    /// Like [`run`](Self::run), but an open breaker runs the fallback
    /// instead of rejecting.
    pub async fn run_with_fallback<T, E, Fut, Op, FbFut, Fb>(
        &self,
        operation: Op,
        fallback: Fb,
    ) -> Result<T, BreakerError<E>>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        FbFut: std::future::Future<Output = Result<T, E>>,
        Fb: FnOnce(MetricsSnapshot) -> FbFut,
    {
        match self.try_acquire() {
            Err(rejection) => {
                fallback(rejection.metrics).await.map_err(BreakerError::Inner)
            }
            Ok(enrollment) => {
                let result = operation().await;
                match &result {
                    Ok(_) => enrollment.success(),
                    Err(_) => enrollment.failure(),
                }
                result.map_err(BreakerError::Inner)
            }
        }
    }

    /// Pin the breaker OPEN, snapshotting the pre-force state. Outcomes are
    /// still tallied while forced, but no transitions fire.
    pub fn force_open(&self) {
        self.inner.force(BreakerState::Open);
    }

    /// Pin the breaker CLOSED, snapshotting the pre-force state.
    pub fn force_close(&self) {
        self.inner.force(BreakerState::Closed);
    }

    /// Restore the state snapshotted by the first `force_*` call.
    pub fn unforce(&self) {
        let mut cell = self.inner.lock();
        if let Some(snapshot) = cell.forced.take() {
            cell.state = snapshot.state;
            cell.opened_at = snapshot.opened_at;
            cell.half_open_probe = snapshot.half_open_probe;
        }
    }
}

/// A gated command's handle for reporting its outcome. Exactly one of
/// success / failure / timeout is charged per enrolment; the first signal
/// wins and later ones are ignored.
pub struct Enrollment {
    inner: Arc<Inner>,
    resolved: Arc<AtomicBool>,
    probe: bool,
}

impl Enrollment {
    pub fn success(&self) {
        self.resolve(Outcome::Success);
    }

    pub fn failure(&self) {
        self.resolve(Outcome::Failure);
    }

    fn resolve(&self, outcome: Outcome) {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.observe(outcome, self.probe);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

struct Forced {
    state: BreakerState,
    opened_at: Option<u64>,
    half_open_probe: bool,
}

struct Cell {
    buckets: Vec<Bucket>,
    current: usize,
    state: BreakerState,
    /// Clock millis at the moment the breaker opened.
    opened_at: Option<u64>,
    /// A HALF_OPEN probe is in flight.
    half_open_probe: bool,
    forced: Option<Forced>,
    ticker_started: bool,
}

struct Inner {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    on_open: Option<TransitionCallback>,
    on_close: Option<TransitionCallback>,
    cell: Mutex<Cell>,
}

enum Transition {
    Opened(MetricsSnapshot),
    Closed(MetricsSnapshot),
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Cell> {
        self.cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the bucket-rotation ticker if a runtime is available. The task
    /// holds only a `Weak`, so it dies with the breaker and never pins the
    /// process.
    fn ensure_ticker(inner: &Arc<Inner>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        {
            let mut cell = inner.lock();
            if cell.ticker_started {
                return;
            }
            cell.ticker_started = true;
        }
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let period = inner.config.bucket_duration().max(Duration::from_millis(1));
        handle.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.rotate();
            }
        });
    }

    /// Advance the ring pointer and recycle the now-current bucket.
    fn rotate(&self) {
        let mut cell = self.lock();
        cell.current = (cell.current + 1) % cell.buckets.len();
        let index = cell.current;
        cell.buckets[index] = Bucket::default();
    }

    /// Apply the time-driven OPEN→HALF_OPEN transition when the wait has
    /// elapsed. Suppressed while forced.
    fn refresh(&self, cell: &mut Cell) {
        if cell.forced.is_some() || cell.state != BreakerState::Open {
            return;
        }
        let Some(opened_at) = cell.opened_at else { return };
        let waited = self.clock.now_millis().saturating_sub(opened_at);
        if waited >= self.config.wait_duration().as_millis() as u64 {
            cell.state = BreakerState::HalfOpen;
            cell.half_open_probe = false;
            tracing::info!("circuit breaker half-open");
        }
    }

    fn acquire(inner: &Arc<Inner>) -> Result<Enrollment, OpenRejection> {
        Inner::ensure_ticker(inner);
        let mut cell = inner.lock();
        inner.refresh(&mut cell);
        match cell.state {
            BreakerState::Open => {
                let index = cell.current;
                cell.buckets[index].short_circuits += 1;
                Err(OpenRejection { metrics: snapshot(&cell) })
            }
            BreakerState::HalfOpen => {
                if cell.half_open_probe {
                    let index = cell.current;
                    cell.buckets[index].short_circuits += 1;
                    Err(OpenRejection { metrics: snapshot(&cell) })
                } else {
                    cell.half_open_probe = true;
                    drop(cell);
                    Ok(Inner::enroll(inner, true))
                }
            }
            BreakerState::Closed => {
                drop(cell);
                Ok(Inner::enroll(inner, false))
            }
        }
    }

    fn enroll(inner: &Arc<Inner>, probe: bool) -> Enrollment {
        let resolved = Arc::new(AtomicBool::new(false));
        // Daemon timer charges an unresolved enrolment as a timeout.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(inner);
            let resolved = resolved.clone();
            let command_timeout = inner.config.command_timeout;
            handle.spawn(async move {
                tokio::time::sleep(command_timeout).await;
                if resolved.swap(true, Ordering::AcqRel) {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.observe(Outcome::Timeout, probe);
                }
            });
        }
        Enrollment { inner: inner.clone(), resolved, probe }
    }

    fn observe(&self, outcome: Outcome, probe: bool) {
        let transition = {
            let mut cell = self.lock();
            let index = cell.current;
            let bucket = &mut cell.buckets[index];
            match outcome {
                Outcome::Success => bucket.successes += 1,
                Outcome::Failure => bucket.failures += 1,
                Outcome::Timeout => bucket.timeouts += 1,
            }
            if probe {
                cell.half_open_probe = false;
            }
            if cell.forced.is_some() {
                // Tallied only; forced breakers never transition.
                None
            } else {
                self.evaluate(&mut cell, outcome, probe)
            }
        };

        match transition {
            Some(Transition::Opened(metrics)) => {
                tracing::warn!(
                    error_percentage = metrics.error_percentage,
                    total = metrics.total,
                    "circuit breaker open"
                );
                if let Some(callback) = &self.on_open {
                    callback(&metrics);
                }
            }
            Some(Transition::Closed(metrics)) => {
                tracing::info!("circuit breaker closed");
                if let Some(callback) = &self.on_close {
                    callback(&metrics);
                }
            }
            None => {}
        }
    }

    /// Decide a state transition after one observation. Called under the
    /// cell lock; the returned transition's callback runs outside it.
    fn evaluate(&self, cell: &mut Cell, outcome: Outcome, probe: bool) -> Option<Transition> {
        match cell.state {
            BreakerState::HalfOpen if probe => match outcome {
                Outcome::Success => {
                    cell.state = BreakerState::Closed;
                    cell.opened_at = None;
                    let metrics = snapshot(cell);
                    // A stale window would re-trip on the next observation.
                    for bucket in &mut cell.buckets {
                        *bucket = Bucket::default();
                    }
                    Some(Transition::Closed(metrics))
                }
                Outcome::Failure | Outcome::Timeout => {
                    cell.state = BreakerState::Open;
                    cell.opened_at = Some(self.clock.now_millis());
                    Some(Transition::Opened(snapshot(cell)))
                }
            },
            BreakerState::Closed => {
                let metrics = snapshot(cell);
                if metrics.total > self.config.volume_threshold
                    && metrics.error_percentage > self.config.error_threshold
                {
                    cell.state = BreakerState::Open;
                    cell.opened_at = Some(self.clock.now_millis());
                    Some(Transition::Opened(metrics))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn force(&self, state: BreakerState) {
        let mut cell = self.lock();
        if cell.forced.is_none() {
            cell.forced = Some(Forced {
                state: cell.state,
                opened_at: cell.opened_at,
                half_open_probe: cell.half_open_probe,
            });
        }
        cell.state = state;
        if state == BreakerState::Open && cell.opened_at.is_none() {
            cell.opened_at = Some(self.clock.now_millis());
        }
    }
}

fn snapshot(cell: &Cell) -> MetricsSnapshot {
    let mut metrics = MetricsSnapshot::default();
    for bucket in &cell.buckets {
        metrics.successes += bucket.successes;
        metrics.failures += bucket.failures;
        metrics.timeouts += bucket.timeouts;
        metrics.short_circuits += bucket.short_circuits;
    }
    metrics.total = metrics.successes + metrics.failures + metrics.timeouts;
    metrics.error_count = metrics.failures + metrics.timeouts;
    metrics.error_percentage =
        metrics.error_count as f64 / (metrics.total.max(1)) as f64 * 100.0;
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Default)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn config(volume: u64) -> BreakerConfig {
        BreakerConfig { volume_threshold: volume, ..BreakerConfig::default() }
    }

    fn fail_n(breaker: &CircuitBreaker, n: usize) {
        for _ in 0..n {
            breaker.try_acquire().expect("breaker should admit").failure();
        }
    }

    #[tokio::test]
    async fn starts_closed_and_counts_successes() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.try_acquire().unwrap().success();
        let metrics = breaker.metrics();
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.total, 1);
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn volume_threshold_is_strict() {
        let breaker = CircuitBreaker::new(config(5));

        // Exactly volume_threshold observations, all failures: must not trip.
        fail_n(&breaker, 5);
        assert!(!breaker.is_open(), "{} observations must not trip", 5);

        // One more failure crosses the strict threshold.
        fail_n(&breaker, 1);
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn error_percentage_threshold_is_strict() {
        let breaker = CircuitBreaker::new(config(3));

        // 2 failures / 4 total = 50%, not > 50%.
        breaker.try_acquire().unwrap().success();
        breaker.try_acquire().unwrap().success();
        fail_n(&breaker, 2);
        assert!(!breaker.is_open());

        // 3 failures / 5 total = 60% > 50%.
        fail_n(&breaker, 1);
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn open_breaker_rejects_and_counts_short_circuits() {
        let breaker = CircuitBreaker::new(config(1));
        fail_n(&breaker, 2);
        assert!(breaker.is_open());

        assert!(breaker.try_acquire().is_err());
        assert!(breaker.try_acquire().is_err());
        assert_eq!(breaker.metrics().short_circuits, 2);
    }

    #[tokio::test]
    async fn enrollment_charges_at_most_once() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());

        let enrollment = breaker.try_acquire().unwrap();
        enrollment.success();
        enrollment.success();
        enrollment.failure();

        let metrics = breaker.metrics();
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 0);
        assert_eq!(metrics.total, 1);
    }

    #[tokio::test]
    async fn unresolved_enrollment_charged_as_timeout() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            command_timeout: Duration::from_millis(20),
            ..BreakerConfig::default()
        });

        let enrollment = breaker.try_acquire().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let metrics = breaker.metrics();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.error_count, 1);

        // Late signal after the timeout charge is ignored.
        enrollment.success();
        assert_eq!(breaker.metrics().successes, 0);
    }

    #[tokio::test]
    async fn open_waits_then_admits_single_probe() {
        let clock = ManualClock::default();
        let breaker = CircuitBreaker::builder(BreakerConfig {
            volume_threshold: 1,
            wait_duration_in_open_state: Some(Duration::from_millis(100)),
            ..BreakerConfig::default()
        })
        .with_clock(clock.clone())
        .build();

        fail_n(&breaker, 2);
        assert!(breaker.is_open());
        assert!(breaker.try_acquire().is_err(), "still inside the wait");

        clock.advance(150);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let probe = breaker.try_acquire().expect("probe admitted");
        assert!(breaker.try_acquire().is_err(), "only one probe at a time");

        probe.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.metrics().total, 0, "window cleared on close");
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let clock = ManualClock::default();
        let breaker = CircuitBreaker::builder(BreakerConfig {
            volume_threshold: 1,
            wait_duration_in_open_state: Some(Duration::from_millis(100)),
            ..BreakerConfig::default()
        })
        .with_clock(clock.clone())
        .build();

        fail_n(&breaker, 2);
        clock.advance(150);

        let probe = breaker.try_acquire().expect("probe admitted");
        probe.failure();
        assert!(breaker.is_open());

        // The wait starts over from the reopen.
        clock.advance(50);
        assert!(breaker.is_open());
        clock.advance(100);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn ticker_rotation_recycles_buckets() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            window_duration: Duration::from_millis(100),
            num_buckets: 10,
            volume_threshold: 1_000,
            ..BreakerConfig::default()
        });

        fail_n(&breaker, 4);
        assert_eq!(breaker.metrics().failures, 4);

        // After a full window every bucket has been recycled.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(breaker.metrics().failures, 0);
    }

    #[tokio::test]
    async fn force_open_snapshots_and_unforce_restores() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.force_open();
        assert!(breaker.is_open());
        assert!(breaker.try_acquire().is_err());

        breaker.unforce();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn forced_close_tallies_without_transitions() {
        let breaker = CircuitBreaker::new(config(1));
        breaker.force_close();

        fail_n(&breaker, 10);
        assert!(!breaker.is_open(), "forced-closed breaker never trips");
        assert_eq!(breaker.metrics().failures, 10, "outcomes still tallied");

        breaker.unforce();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn run_executes_and_charges() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());

        let ok: Result<u32, BreakerError<std::io::Error>> =
            breaker.run(|| async { Ok(42) }).await;
        assert_eq!(ok.unwrap(), 42);
        assert_eq!(breaker.metrics().successes, 1);

        let err: Result<u32, BreakerError<std::io::Error>> = breaker
            .run(|| async { Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")) })
            .await;
        assert!(matches!(err.unwrap_err(), BreakerError::Inner(_)));
        assert_eq!(breaker.metrics().failures, 1);
    }

    #[tokio::test]
    async fn run_with_fallback_takes_over_when_open() {
        let breaker = CircuitBreaker::new(config(1));
        fail_n(&breaker, 2);
        assert!(breaker.is_open());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result: Result<&str, BreakerError<std::io::Error>> = breaker
            .run_with_fallback(
                || async { Ok("primary") },
                move |_metrics| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok("fallback")
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.metrics().short_circuits, 1);
    }

    #[tokio::test]
    async fn transition_callbacks_fire_with_metrics() {
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let opened_clone = opened.clone();
        let closed_clone = closed.clone();

        let clock = ManualClock::default();
        let breaker = CircuitBreaker::builder(BreakerConfig {
            volume_threshold: 1,
            wait_duration_in_open_state: Some(Duration::from_millis(10)),
            ..BreakerConfig::default()
        })
        .with_clock(clock.clone())
        .on_circuit_open(move |metrics| {
            assert!(metrics.error_percentage > 50.0);
            opened_clone.fetch_add(1, Ordering::SeqCst);
        })
        .on_circuit_close(move |_metrics| {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        })
        .build();

        fail_n(&breaker, 2);
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        clock.advance(20);
        breaker.try_acquire().expect("probe").success();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
