//! Per-attempt timing capture.
//!
//! Each mark is milliseconds elapsed since the attempt started, taken from a
//! monotonic instant. A mark is `None` when the event never happened (plain
//! HTTP never records `secure_connect`) or when timing capture is disabled.

use std::time::Instant;

/// Raw event marks for one HTTP attempt.
///
/// When the transport hands back a pre-connected resource, `lookup`,
/// `connect` and `secure_connect` collapse onto `socket`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    /// Transport assigned.
    pub socket: Option<u64>,
    /// DNS resolution complete.
    pub lookup: Option<u64>,
    /// TCP established.
    pub connect: Option<u64>,
    /// TLS established.
    pub secure_connect: Option<u64>,
    /// First byte of response headers.
    pub response: Option<u64>,
    /// Response body fully received.
    pub end: Option<u64>,
}

impl Timings {
    /// Derived phase durations. Any phase is `None` when either endpoint
    /// mark is missing.
    pub fn phases(&self) -> TimingPhases {
        TimingPhases {
            wait: self.socket,
            dns: diff(self.socket, self.lookup),
            tcp: diff(self.lookup, self.connect),
            tls: diff(self.connect, self.secure_connect),
            first_byte: diff(self.secure_connect, self.response),
            download: diff(self.response, self.end),
            total: self.end,
        }
    }
}

/// Phase view over [`Timings`], all values in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingPhases {
    pub wait: Option<u64>,
    pub dns: Option<u64>,
    pub tcp: Option<u64>,
    pub tls: Option<u64>,
    pub first_byte: Option<u64>,
    pub download: Option<u64>,
    pub total: Option<u64>,
}

fn diff(from: Option<u64>, to: Option<u64>) -> Option<u64> {
    Some(to?.saturating_sub(from?))
}

/// Records each event at most once against a single monotonic origin.
/// Disabled recorders mark nothing.
#[derive(Debug)]
pub(crate) struct TimingRecorder {
    start: Option<Instant>,
    timings: Timings,
}

impl TimingRecorder {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { start: enabled.then(Instant::now), timings: Timings::default() }
    }

    fn mark(&self) -> Option<u64> {
        self.start.map(|s| s.elapsed().as_millis() as u64)
    }

    pub(crate) fn socket(&mut self) {
        if self.timings.socket.is_none() {
            self.timings.socket = self.mark();
        }
    }

    pub(crate) fn lookup(&mut self) {
        if self.timings.lookup.is_none() {
            self.timings.lookup = self.mark();
        }
    }

    pub(crate) fn connect(&mut self) {
        if self.timings.connect.is_none() {
            self.timings.connect = self.mark();
        }
    }

    pub(crate) fn secure_connect(&mut self) {
        if self.timings.secure_connect.is_none() {
            self.timings.secure_connect = self.mark();
        }
    }

    pub(crate) fn response(&mut self) {
        if self.timings.response.is_none() {
            self.timings.response = self.mark();
        }
    }

    pub(crate) fn end(&mut self) {
        if self.timings.end.is_none() {
            self.timings.end = self.mark();
        }
    }

    /// The captured marks, or `None` when the recorder was disabled.
    pub(crate) fn finish(self) -> Option<Timings> {
        self.start.map(|_| self.timings)
    }
}
