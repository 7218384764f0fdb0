//! Canary health evaluation over sliding metric windows.
//!
//! A [`CanarySession`] accumulates per-request metrics for one candidate
//! version and turns them into periodic verdicts. Samples carry the version
//! that served them; a session drops anything tagged for another version.
//! Breaches must persist for `breach_ticks` consecutive ticks before the
//! session fails, and a session must stay healthy for
//! `promote_after_healthy_ticks` consecutive ticks before promotion is
//! recommended. A failed session is terminal.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use drydock_state::VersionKey;

/// Per-request error indicator: 0.0 for success, 1.0 for failure.
pub const METRIC_ERROR: &str = "error";
/// Per-request latency in milliseconds.
pub const METRIC_LATENCY_MS: &str = "latency_ms";

/// Tuning knobs for canary evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Samples retained per metric stream.
    #[serde(default = "default_window_samples")]
    pub window_samples: usize,
    /// Minimum samples per stream before a tick is conclusive.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Error rate above this breaches.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Latency percentile above this (in ms) breaches.
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: f64,
    /// Which latency percentile to watch, in (0, 1].
    #[serde(default = "default_latency_percentile")]
    pub latency_percentile: f64,
    /// Consecutive breached ticks before the session fails.
    #[serde(default = "default_breach_ticks")]
    pub breach_ticks: u32,
    /// Consecutive healthy ticks before promotion is recommended.
    #[serde(default = "default_promote_after_healthy_ticks")]
    pub promote_after_healthy_ticks: u32,
    /// Traffic share a canary receives on entry.
    #[serde(default = "default_traffic_percent")]
    pub traffic_percent: u8,
    /// Wall-clock tick interval.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Also tick after this many new samples, whichever comes first.
    #[serde(default = "default_tick_every_samples")]
    pub tick_every_samples: usize,
}

fn default_window_samples() -> usize {
    200
}
fn default_min_samples() -> usize {
    20
}
fn default_error_rate_threshold() -> f64 {
    0.05
}
fn default_latency_threshold_ms() -> f64 {
    500.0
}
fn default_latency_percentile() -> f64 {
    0.95
}
fn default_breach_ticks() -> u32 {
    3
}
fn default_promote_after_healthy_ticks() -> u32 {
    3
}
fn default_traffic_percent() -> u8 {
    10
}
fn default_tick_interval_secs() -> u64 {
    15
}
fn default_tick_every_samples() -> usize {
    50
}

impl Default for CanaryConfig {
    fn default() -> Self {
        CanaryConfig {
            window_samples: default_window_samples(),
            min_samples: default_min_samples(),
            error_rate_threshold: default_error_rate_threshold(),
            latency_threshold_ms: default_latency_threshold_ms(),
            latency_percentile: default_latency_percentile(),
            breach_ticks: default_breach_ticks(),
            promote_after_healthy_ticks: default_promote_after_healthy_ticks(),
            traffic_percent: default_traffic_percent(),
            tick_interval_secs: default_tick_interval_secs(),
            tick_every_samples: default_tick_every_samples(),
        }
    }
}

/// One observed metric data point, tagged with the version that served it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub key: VersionKey,
    pub recorded_at: DateTime<Utc>,
    pub name: String,
    pub value: f64,
}

impl MetricSample {
    pub fn error(key: VersionKey, recorded_at: DateTime<Utc>, failed: bool) -> Self {
        MetricSample {
            key,
            recorded_at,
            name: METRIC_ERROR.to_string(),
            value: if failed { 1.0 } else { 0.0 },
        }
    }

    pub fn latency_ms(key: VersionKey, recorded_at: DateTime<Utc>, value: f64) -> Self {
        MetricSample {
            key,
            recorded_at,
            name: METRIC_LATENCY_MS.to_string(),
            value,
        }
    }

    /// A business metric outside the two thresholded streams, e.g.
    /// `conversion_rate`.
    pub fn custom(
        key: VersionKey,
        recorded_at: DateTime<Utc>,
        name: impl Into<String>,
        value: f64,
    ) -> Self {
        MetricSample {
            key,
            recorded_at,
            name: name.into(),
            value,
        }
    }
}

/// Where a session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not enough data for a conclusive tick yet.
    Collecting,
    Healthy,
    Degraded,
    /// Terminal. The session has breached for too many consecutive ticks.
    Failed,
}

/// Outcome of a single evaluation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Healthy,
    Degraded,
    Failed,
    /// One or both metric streams are below `min_samples`.
    Inconclusive,
}

/// What the caller should do after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanaryAction {
    /// Keep watching.
    Hold,
    /// The session has been healthy long enough.
    Promote,
    /// The session failed.
    Rollback { reason: String },
}

/// Everything a tick concluded, for logging and the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub verdict: Verdict,
    pub state: SessionState,
    pub error_rate: Option<f64>,
    pub latency_pctl: Option<f64>,
    pub error_samples: usize,
    pub latency_samples: usize,
    /// Rolling mean of each custom metric stream. Never breaches.
    pub custom_means: BTreeMap<String, f64>,
    pub healthy_streak: u32,
    pub breach_streak: u32,
    pub action: CanaryAction,
}

/// Sliding-window health tracker for one canary version.
#[derive(Debug)]
pub struct CanarySession {
    key: VersionKey,
    config: CanaryConfig,
    errors: VecDeque<f64>,
    latencies: VecDeque<f64>,
    custom: BTreeMap<String, VecDeque<f64>>,
    state: SessionState,
    healthy_streak: u32,
    breach_streak: u32,
}

impl CanarySession {
    pub fn new(key: VersionKey, config: CanaryConfig) -> Self {
        CanarySession {
            key,
            config,
            errors: VecDeque::new(),
            latencies: VecDeque::new(),
            custom: BTreeMap::new(),
            state: SessionState::Collecting,
            healthy_streak: 0,
            breach_streak: 0,
        }
    }

    pub fn key(&self) -> &VersionKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sample_counts(&self) -> (usize, usize) {
        (self.errors.len(), self.latencies.len())
    }

    /// Record one sample. A sample tagged for another version is dropped.
    /// Metric names beyond the two thresholded streams go into per-name
    /// windows that are reported but never breach.
    pub fn observe(&mut self, sample: &MetricSample) {
        if sample.key != self.key {
            debug!(
                session = %self.key,
                sample = %sample.key,
                "dropping sample for another version"
            );
            return;
        }
        let window = match sample.name.as_str() {
            METRIC_ERROR => &mut self.errors,
            METRIC_LATENCY_MS => &mut self.latencies,
            name => self.custom.entry(name.to_string()).or_default(),
        };
        window.push_back(sample.value);
        while window.len() > self.config.window_samples {
            window.pop_front();
        }
    }

    /// Replay a batch of samples, e.g. a recent window fetched on restart.
    pub fn seed(&mut self, samples: &[MetricSample]) {
        for sample in samples {
            self.observe(sample);
        }
    }

    /// Evaluate the current windows and advance the session.
    ///
    /// An inconclusive tick neither advances nor resets the streaks.
    /// Hysteresis lives in the streak counters: one clean tick clears the
    /// breach streak, one breached tick clears the healthy streak.
    pub fn evaluate_tick(&mut self, now: DateTime<Utc>) -> TickReport {
        if self.state == SessionState::Failed {
            return self.report(now, Verdict::Failed, None, None, CanaryAction::Hold);
        }

        let error_rate = mean(&self.errors);
        let latency_pctl = percentile(&self.latencies, self.config.latency_percentile);

        if self.errors.len() < self.config.min_samples
            || self.latencies.len() < self.config.min_samples
        {
            return self.report(
                now,
                Verdict::Inconclusive,
                error_rate,
                latency_pctl,
                CanaryAction::Hold,
            );
        }

        let mut breaches = Vec::new();
        if let Some(rate) = error_rate {
            if rate > self.config.error_rate_threshold {
                breaches.push(format!(
                    "error rate {rate:.4} over threshold {:.4}",
                    self.config.error_rate_threshold
                ));
            }
        }
        if let Some(pctl) = latency_pctl {
            if pctl > self.config.latency_threshold_ms {
                breaches.push(format!(
                    "p{:02.0} latency {pctl:.1}ms over threshold {:.1}ms",
                    self.config.latency_percentile * 100.0,
                    self.config.latency_threshold_ms
                ));
            }
        }

        if breaches.is_empty() {
            self.breach_streak = 0;
            self.healthy_streak += 1;
            // A clean tick out of Degraded steps back to Collecting, not
            // straight to Healthy.
            self.state = if self.state == SessionState::Degraded {
                SessionState::Collecting
            } else {
                SessionState::Healthy
            };
            let action = if self.state == SessionState::Healthy
                && self.healthy_streak >= self.config.promote_after_healthy_ticks
            {
                CanaryAction::Promote
            } else {
                CanaryAction::Hold
            };
            return self.report(now, Verdict::Healthy, error_rate, latency_pctl, action);
        }

        self.healthy_streak = 0;
        self.breach_streak += 1;
        if self.breach_streak >= self.config.breach_ticks {
            self.state = SessionState::Failed;
            let reason = format!(
                "{} for {} consecutive ticks",
                breaches.join("; "),
                self.breach_streak
            );
            return self.report(
                now,
                Verdict::Failed,
                error_rate,
                latency_pctl,
                CanaryAction::Rollback { reason },
            );
        }

        self.state = SessionState::Degraded;
        self.report(
            now,
            Verdict::Degraded,
            error_rate,
            latency_pctl,
            CanaryAction::Hold,
        )
    }

    fn report(
        &self,
        at: DateTime<Utc>,
        verdict: Verdict,
        error_rate: Option<f64>,
        latency_pctl: Option<f64>,
        action: CanaryAction,
    ) -> TickReport {
        TickReport {
            at,
            verdict,
            state: self.state,
            error_rate,
            latency_pctl,
            error_samples: self.errors.len(),
            latency_samples: self.latencies.len(),
            custom_means: self
                .custom
                .iter()
                .filter_map(|(name, window)| mean(window).map(|m| (name.clone(), m)))
                .collect(),
            healthy_streak: self.healthy_streak,
            breach_streak: self.breach_streak,
            action,
        }
    }
}

fn mean(values: &VecDeque<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Nearest-rank percentile over a window. `p` is in (0, 1].
fn percentile(values: &VecDeque<f64>, p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    Some(sorted[rank - 1])
}
