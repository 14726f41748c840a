use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::benchmark::BenchmarkConfig;
use crate::records::{RequestOutcome, RequestPhase, RequestRecord};
use crate::scheduler::RunConfig;
use crate::strategy::RateType;

/// Order-independent accumulator for one latency metric. Sums are kept in
/// integer nanoseconds so every derived statistic is invariant under
/// permutation of record arrival order.
#[derive(Debug, Clone, Default)]
pub struct StreamingStats {
    count: u64,
    sum_ns: u128,
    sum_sq_ns: u128,
    min_ns: u64,
    max_ns: u64,
}

impl StreamingStats {
    pub fn record(&mut self, value_ns: u64) {
        if self.count == 0 || value_ns < self.min_ns {
            self.min_ns = value_ns;
        }
        if value_ns > self.max_ns {
            self.max_ns = value_ns;
        }
        self.count += 1;
        self.sum_ns += value_ns as u128;
        self.sum_sq_ns += (value_ns as u128) * (value_ns as u128);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean_ns(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum_ns as f64 / self.count as f64)
    }

    /// Sample standard deviation; zero below two samples.
    pub fn stddev_ns(&self) -> Option<f64> {
        let mean = self.mean_ns()?;
        if self.count < 2 {
            return Some(0.0);
        }
        let variance = (self.sum_sq_ns as f64 - mean * mean * self.count as f64)
            / (self.count - 1) as f64;
        Some(variance.max(0.0).sqrt())
    }
}

/// Bounded-memory percentile estimator. Exact interpolated quantiles over
/// retained samples up to `limit`, then the samples spill into an
/// auto-resizing histogram at three significant figures (relative error
/// at most 0.1%).
#[derive(Debug, Clone)]
pub struct QuantileSketch {
    limit: usize,
    exact: Vec<u64>,
    histogram: Option<Histogram<u64>>,
}

impl QuantileSketch {
    pub fn new(limit: usize) -> QuantileSketch {
        QuantileSketch {
            limit: limit.max(1),
            exact: Vec::new(),
            histogram: None,
        }
    }

    pub fn record(&mut self, value_ns: u64) {
        match &mut self.histogram {
            Some(histogram) => histogram.saturating_record(value_ns.max(1)),
            None => {
                self.exact.push(value_ns);
                if self.exact.len() > self.limit {
                    let mut histogram =
                        Histogram::<u64>::new(3).expect("3 significant figures is valid");
                    for value in self.exact.drain(..) {
                        histogram.saturating_record(value.max(1));
                    }
                    self.histogram = Some(histogram);
                }
            }
        }
    }

    pub fn is_exact(&self) -> bool {
        self.histogram.is_none()
    }

    /// Interpolated quantile, matching `numpy.percentile` on the exact
    /// path.
    pub fn quantile_ns(&self, quantile: f64) -> Option<f64> {
        if let Some(histogram) = &self.histogram {
            if histogram.is_empty() {
                return None;
            }
            return Some(histogram.value_at_quantile(quantile) as f64);
        }
        if self.exact.is_empty() {
            return None;
        }
        let mut data = self.exact.clone();
        data.sort_unstable();
        let position = quantile.clamp(0.0, 1.0) * (data.len() - 1) as f64;
        let index = position.floor() as usize;
        let delta = position - index as f64;
        if index + 1 >= data.len() {
            return Some(data[data.len() - 1] as f64);
        }
        Some((1.0 - delta) * data[index] as f64 + delta * data[index + 1] as f64)
    }
}

/// Finalized distribution of one latency metric, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub mean_ms: f64,
    pub stddev_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p75_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

fn ns_to_ms(value_ns: f64) -> f64 {
    value_ns / 1e6
}

fn summarize(stats: &StreamingStats, sketch: &QuantileSketch) -> Option<MetricSummary> {
    if stats.count() == 0 {
        return None;
    }
    Some(MetricSummary {
        count: stats.count(),
        mean_ms: ns_to_ms(stats.mean_ns()?),
        stddev_ms: ns_to_ms(stats.stddev_ns()?),
        min_ms: ns_to_ms(stats.min_ns as f64),
        max_ms: ns_to_ms(stats.max_ns as f64),
        p50_ms: ns_to_ms(sketch.quantile_ns(0.50)?),
        p75_ms: ns_to_ms(sketch.quantile_ns(0.75)?),
        p90_ms: ns_to_ms(sketch.quantile_ns(0.90)?),
        p95_ms: ns_to_ms(sketch.quantile_ns(0.95)?),
        p99_ms: ns_to_ms(sketch.quantile_ns(0.99)?),
    })
}

/// Counts by terminal outcome, with the error breakdown by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeTally {
    pub completed: u64,
    pub errored: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
}

impl OutcomeTally {
    fn add(&mut self, outcome: &RequestOutcome) {
        match outcome {
            RequestOutcome::Completed => self.completed += 1,
            RequestOutcome::Error { .. } => self.errored += 1,
            RequestOutcome::Cancelled => self.cancelled += 1,
            RequestOutcome::Timeout => self.timed_out += 1,
        }
        if let Some(kind) = outcome.failure_kind() {
            *self.errors_by_kind.entry(kind.to_string()).or_insert(0) += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.completed + self.errored + self.cancelled + self.timed_out
    }

    pub fn failed(&self) -> u64 {
        self.errored + self.cancelled + self.timed_out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcomes {
    pub warmup: OutcomeTally,
    pub measured: OutcomeTally,
    pub cooldown: OutcomeTally,
}

impl PhaseOutcomes {
    fn tally_mut(&mut self, phase: RequestPhase) -> &mut OutcomeTally {
        match phase {
            RequestPhase::Warmup => &mut self.warmup,
            RequestPhase::Measured => &mut self.measured,
            RequestPhase::Cooldown => &mut self.cooldown,
        }
    }

    pub fn total(&self) -> u64 {
        self.warmup.total() + self.measured.total() + self.cooldown.total()
    }

    pub fn completed(&self) -> u64 {
        self.warmup.completed + self.measured.completed + self.cooldown.completed
    }

    pub fn failed(&self) -> u64 {
        self.warmup.failed() + self.measured.failed() + self.cooldown.failed()
    }
}

/// Single-consumer sink for completed records. Warmup and cooldown
/// records only feed the outcome tallies; statistics come from the
/// measured phase alone.
pub struct MetricsAggregator {
    retain_all: bool,
    outcomes: PhaseOutcomes,
    ttft_stats: StreamingStats,
    ttft_sketch: QuantileSketch,
    itl_stats: StreamingStats,
    itl_sketch: QuantileSketch,
    e2e_stats: StreamingStats,
    e2e_sketch: QuantileSketch,
    prompt_tokens: u64,
    output_tokens: u64,
    window_start_ns: Option<u64>,
    window_end_ns: Option<u64>,
    records: Vec<RequestRecord>,
}

impl MetricsAggregator {
    pub fn new(sample_limit: usize, retain_all: bool) -> MetricsAggregator {
        MetricsAggregator {
            retain_all,
            outcomes: PhaseOutcomes::default(),
            ttft_stats: StreamingStats::default(),
            ttft_sketch: QuantileSketch::new(sample_limit),
            itl_stats: StreamingStats::default(),
            itl_sketch: QuantileSketch::new(sample_limit),
            e2e_stats: StreamingStats::default(),
            e2e_sketch: QuantileSketch::new(sample_limit),
            prompt_tokens: 0,
            output_tokens: 0,
            window_start_ns: None,
            window_end_ns: None,
            records: Vec::new(),
        }
    }

    pub fn add_record(&mut self, record: RequestRecord) {
        let outcome = record
            .outcome
            .clone()
            .expect("records reaching the aggregator are terminal");
        self.outcomes.tally_mut(record.phase).add(&outcome);

        if record.phase == RequestPhase::Measured {
            if let Some(dispatch) = record.actual_dispatch {
                self.window_start_ns = Some(match self.window_start_ns {
                    Some(start) => start.min(dispatch),
                    None => dispatch,
                });
            }
            if let Some(completion) = record.completion {
                self.window_end_ns = Some(match self.window_end_ns {
                    Some(end) => end.max(completion),
                    None => completion,
                });
            }
            if outcome.is_success() {
                if let Some(ttft) = record.time_to_first_token_ns() {
                    self.ttft_stats.record(ttft);
                    self.ttft_sketch.record(ttft);
                }
                if let Some(e2e) = record.e2e_latency_ns() {
                    self.e2e_stats.record(e2e);
                    self.e2e_sketch.record(e2e);
                }
                for gap in record.inter_token_gaps_ns() {
                    self.itl_stats.record(gap);
                    self.itl_sketch.record(gap);
                }
                self.prompt_tokens += record.prompt_tokens;
                self.output_tokens += record.output_tokens;
            }
        }

        if self.retain_all || record.phase == RequestPhase::Measured {
            self.records.push(record);
        }
    }

    pub fn outcomes(&self) -> &PhaseOutcomes {
        &self.outcomes
    }

    pub fn completed_total(&self) -> u64 {
        self.outcomes.completed()
    }

    pub fn failed_total(&self) -> u64 {
        self.outcomes.failed()
    }

    pub fn received_total(&self) -> u64 {
        self.outcomes.total()
    }

    pub fn running_ttft_mean_ms(&self) -> Option<f64> {
        self.ttft_stats.mean_ns().map(ns_to_ms)
    }

    pub fn running_itl_mean_ms(&self) -> Option<f64> {
        self.itl_stats.mean_ns().map(ns_to_ms)
    }

    fn measured_window_secs(&self) -> Option<f64> {
        match (self.window_start_ns, self.window_end_ns) {
            (Some(start), Some(end)) if end > start => Some((end - start) as f64 / 1e9),
            _ => None,
        }
    }

    /// Achieved request rate over the measured window so far.
    pub fn running_request_rate(&self) -> Option<f64> {
        let window = self.measured_window_secs()?;
        Some(self.outcomes.measured.completed as f64 / window)
    }

    pub fn running_output_token_rate(&self) -> Option<f64> {
        let window = self.measured_window_secs()?;
        Some(self.output_tokens as f64 / window)
    }

    pub fn finalize(
        self,
        id: String,
        config: RunConfig,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> BenchmarkResults {
        let request_rate = self.running_request_rate();
        let output_token_rate = self.running_output_token_rate();
        BenchmarkResults {
            id,
            rate_type: config.rate_type,
            config,
            started_at,
            ended_at,
            time_to_first_token: summarize(&self.ttft_stats, &self.ttft_sketch),
            inter_token_latency: summarize(&self.itl_stats, &self.itl_sketch),
            e2e_latency: summarize(&self.e2e_stats, &self.e2e_sketch),
            request_rate,
            output_token_rate,
            total_prompt_tokens: self.prompt_tokens,
            total_output_tokens: self.output_tokens,
            outcomes: self.outcomes,
            records: self.records,
        }
    }
}

/// Immutable result of one benchmark run. Statistics are embedded at
/// finalize time, so serializing and reloading reproduces them
/// byte-identically without recomputation. `None` summaries mean the run
/// had no successful measured-phase requests and its statistics are
/// undefined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResults {
    pub id: String,
    pub rate_type: RateType,
    pub config: RunConfig,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcomes: PhaseOutcomes,
    pub time_to_first_token: Option<MetricSummary>,
    pub inter_token_latency: Option<MetricSummary>,
    pub e2e_latency: Option<MetricSummary>,
    pub request_rate: Option<f64>,
    pub output_token_rate: Option<f64>,
    pub total_prompt_tokens: u64,
    pub total_output_tokens: u64,
    pub records: Vec<RequestRecord>,
}

impl BenchmarkResults {
    pub fn successful_requests(&self) -> u64 {
        self.outcomes.measured.completed
    }

    pub fn failed_requests(&self) -> u64 {
        self.outcomes.measured.failed()
    }

    pub fn has_statistics(&self) -> bool {
        self.e2e_latency.is_some()
    }
}

/// The overall report: configuration snapshot plus one result per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub config: BenchmarkConfig,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    results: Vec<BenchmarkResults>,
}

impl BenchmarkReport {
    pub fn new(config: BenchmarkConfig) -> BenchmarkReport {
        BenchmarkReport {
            config,
            start_time: None,
            end_time: None,
            results: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.start_time = Some(Utc::now());
    }

    pub fn end(&mut self) {
        self.end_time = Some(Utc::now());
    }

    pub fn add_benchmark_result(&mut self, result: BenchmarkResults) {
        self.results.push(result);
    }

    pub fn get_results(&self) -> &[BenchmarkResults] {
        &self.results
    }
}
