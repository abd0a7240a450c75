//! Latency metrics
//!
//! A Prometheus-style summary (observation count and sum) with a timing
//! combinator that wraps any future.

use std::fmt::Write as _;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Name of the generation latency summary
pub const RESPONSE_TIME_METRIC: &str = "response_time";

#[derive(Debug, Default, Clone, Copy)]
struct SummaryState {
    count: u64,
    sum_seconds: f64,
}

/// Duration summary
#[derive(Debug)]
pub struct Summary {
    name: &'static str,
    help: &'static str,
    state: Mutex<SummaryState>,
}

impl Summary {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            state: Mutex::new(SummaryState::default()),
        }
    }

    /// Summary for `async_generate` latency
    pub fn response_time() -> Self {
        Self::new(RESPONSE_TIME_METRIC, "Time spent generating responses")
    }

    pub fn observe(&self, elapsed: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.count += 1;
        state.sum_seconds += elapsed.as_secs_f64();
    }

    pub fn count(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).count
    }

    pub fn sum_seconds(&self) -> f64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).sum_seconds
    }

    /// Start a timer that records one observation when dropped
    pub fn start_timer(&self) -> SummaryTimer<'_> {
        SummaryTimer {
            summary: self,
            started: Instant::now(),
        }
    }

    /// Run `fut` and record how long it took, whatever its outcome
    pub async fn time<F: Future>(&self, fut: F) -> F::Output {
        let _timer = self.start_timer();
        fut.await
    }

    /// Export in Prometheus text format
    pub fn render_prometheus(&self) -> String {
        let state = *self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut output = String::with_capacity(256);
        let _ = writeln!(output, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(output, "# TYPE {} summary", self.name);
        let _ = writeln!(output, "{}_count {}", self.name, state.count);
        let _ = writeln!(output, "{}_sum {:.6}", self.name, state.sum_seconds);
        output
    }
}

/// Records elapsed time into its summary on drop
pub struct SummaryTimer<'a> {
    summary: &'a Summary,
    started: Instant,
}

impl Drop for SummaryTimer<'_> {
    fn drop(&mut self) {
        self.summary.observe(self.started.elapsed());
    }
}
