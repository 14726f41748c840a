use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::clock::Clock;
use crate::records::{DispatchTicket, RequestOutcome, RequestPhase, RequestRecord};
use crate::requests::{TextGenerationBackend, TextRequestGenerator};
use crate::results::{BenchmarkResults, MetricsAggregator};
use crate::strategy::{DispatchDirective, RateStrategy, RateType};
use crate::workers::WorkerPool;

/// Warmup or cooldown extent. When both forms are configured the request
/// count takes precedence over the duration.
#[serde_with::serde_as]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseAllotment {
    pub requests: Option<u64>,
    #[serde_as(as = "Option<serde_with::DurationSecondsWithFrac<f64>>")]
    #[serde(rename = "duration_secs")]
    pub duration: Option<Duration>,
}

/// Everything one run needs, snapshotted into its results.
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub rate_type: RateType,
    pub rate: Option<f64>,
    pub max_concurrency: u64,
    #[serde_as(as = "Option<serde_with::DurationSecondsWithFrac<f64>>")]
    #[serde(rename = "max_duration_secs")]
    pub max_duration: Option<Duration>,
    pub max_requests: Option<u64>,
    pub warmup: PhaseAllotment,
    pub cooldown: PhaseAllotment,
    #[serde_as(as = "Option<serde_with::DurationSecondsWithFrac<f64>>")]
    #[serde(rename = "request_timeout_secs")]
    pub request_timeout: Option<Duration>,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac<f64>")]
    #[serde(rename = "drain_timeout_secs")]
    pub drain_timeout: Duration,
    pub random_seed: u64,
    pub sample_limit: usize,
    pub retain_all_phases: bool,
}

/// Per-run accumulator owned by the scheduler. `in_flight` mirrors the
/// in-flight table at all times.
#[derive(Debug, Clone, Copy, Default)]
pub struct BenchmarkState {
    pub start_ns: u64,
    pub sequence_index: u64,
    pub dispatched: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub last_dispatch_ns: Option<u64>,
}

/// Live counters pushed to the progress consumer on every completion.
#[derive(Debug, Clone)]
pub struct SchedulerProgress {
    pub progress: f64,
    pub requests_throughput: Option<f64>,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub sent_requests: u64,
    pub in_flight_requests: u64,
    pub completed_requests: u64,
    pub avg_ttft_ms: Option<f64>,
    pub avg_itl_ms: Option<f64>,
    pub output_token_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    MaxRequests,
    MaxDuration,
    SourceExhausted,
    Cancelled,
}

/// Owns one run: the rate strategy, the request source, the in-flight
/// table and the dispatch loop. Workers communicate completions by
/// message; the scheduler applies `on_completion` and forwards each
/// record to the aggregator from a single thread of control.
pub struct Scheduler<'a> {
    id: String,
    config: RunConfig,
    strategy: RateStrategy,
    backend: Box<dyn TextGenerationBackend + Send + Sync>,
    generator: &'a mut dyn TextRequestGenerator,
    progress_tx: mpsc::Sender<Option<SchedulerProgress>>,
    stop_sender: broadcast::Sender<()>,
    clock: Clock,
    state: BenchmarkState,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        id: String,
        backend: Box<dyn TextGenerationBackend + Send + Sync>,
        config: RunConfig,
        generator: &'a mut dyn TextRequestGenerator,
        progress_tx: mpsc::Sender<Option<SchedulerProgress>>,
        stop_sender: broadcast::Sender<()>,
        clock: Clock,
    ) -> anyhow::Result<Scheduler<'a>> {
        let strategy = RateStrategy::new(config.rate_type, config.rate, config.random_seed)?;
        Ok(Scheduler {
            id,
            config,
            strategy,
            backend,
            generator,
            progress_tx,
            stop_sender,
            clock,
            state: BenchmarkState::default(),
        })
    }

    pub fn state(&self) -> &BenchmarkState {
        &self.state
    }

    pub async fn run(&mut self) -> anyhow::Result<BenchmarkResults> {
        debug!("Starting scheduler '{}'", self.id);
        let started_at = Utc::now();
        let clock = self.clock;
        self.generator.reset();
        self.state = BenchmarkState {
            start_ns: clock.now_ns(),
            ..BenchmarkState::default()
        };
        let start_ns = self.state.start_ns;
        let deadline_ns = self
            .config
            .max_duration
            .map(|max| start_ns + max.as_nanos() as u64);

        let (completions_tx, mut completions_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            self.backend.clone(),
            self.config.max_concurrency,
            self.config.request_timeout,
            clock,
            completions_tx,
        );

        // the aggregator is the single consumer of completed records and
        // reports progress as they arrive
        let (records_tx, mut records_rx) = mpsc::unbounded_channel::<RequestRecord>();
        let sent_requests = Arc::new(AtomicU64::new(0));
        let collector = {
            let progress_tx = self.progress_tx.clone();
            let sent_requests = sent_requests.clone();
            let expected_requests = self.config.max_requests;
            let expected_duration = self.config.max_duration;
            let sample_limit = self.config.sample_limit;
            let retain_all = self.config.retain_all_phases;
            tokio::spawn(async move {
                let mut aggregator = MetricsAggregator::new(sample_limit, retain_all);
                while let Some(record) = records_rx.recv().await {
                    aggregator.add_record(record);
                    let sent = sent_requests.load(Ordering::SeqCst);
                    let received = aggregator.received_total();
                    let progress = match (expected_requests, expected_duration) {
                        (Some(max), _) if max > 0 => {
                            (received as f64 / max as f64 * 100.0).min(100.0)
                        }
                        (_, Some(duration)) => ((clock.now_ns() - start_ns) as f64
                            / duration.as_nanos() as f64
                            * 100.0)
                            .min(100.0),
                        _ => 0.0,
                    };
                    let _ = progress_tx
                        .send(Some(SchedulerProgress {
                            progress,
                            requests_throughput: aggregator.running_request_rate(),
                            successful_requests: aggregator.completed_total(),
                            failed_requests: aggregator.failed_total(),
                            sent_requests: sent,
                            in_flight_requests: sent.saturating_sub(received),
                            completed_requests: received,
                            avg_ttft_ms: aggregator.running_ttft_mean_ms(),
                            avg_itl_ms: aggregator.running_itl_mean_ms(),
                            output_token_rate: aggregator.running_output_token_rate(),
                        }))
                        .await;
                }
                aggregator
            })
        };

        let mut stop_rx = self.stop_sender.subscribe();
        let mut in_flight_set: HashSet<u64> = HashSet::new();
        let mut cancelled = false;

        let stop_reason = loop {
            if cancelled {
                break StopReason::Cancelled;
            }
            if let Some(max) = self.config.max_requests {
                if self.state.dispatched >= max {
                    break StopReason::MaxRequests;
                }
            }
            if let Some(deadline) = deadline_ns {
                if clock.now_ns() >= deadline {
                    break StopReason::MaxDuration;
                }
            }

            let targeted = match self.strategy.next_dispatch(start_ns) {
                DispatchDirective::AwaitCompletion => {
                    tokio::select! {
                        _ = stop_rx.recv() => cancelled = true,
                        _ = deadline_sleep(clock, deadline_ns) => {}
                        completion = completions_rx.recv() => {
                            if let Some(record) = completion {
                                self.handle_completion(record, &mut in_flight_set, &records_tx);
                            }
                        }
                    }
                    continue;
                }
                DispatchDirective::At(at_ns) => {
                    // a slot targeted at or past the run deadline is
                    // never dispatched
                    if let Some(deadline) = deadline_ns {
                        if at_ns >= deadline {
                            break StopReason::MaxDuration;
                        }
                    }
                    while clock.now_ns() < at_ns && !cancelled {
                        tokio::select! {
                            _ = clock.sleep_until(at_ns) => {}
                            _ = stop_rx.recv() => cancelled = true,
                            completion = completions_rx.recv() => {
                                if let Some(record) = completion {
                                    self.handle_completion(record, &mut in_flight_set, &records_tx);
                                }
                            }
                        }
                    }
                    if cancelled {
                        continue;
                    }
                    at_ns
                }
                DispatchDirective::Immediate => clock.now_ns(),
            };

            // apply completions that arrived while waiting, without
            // blocking
            while let Ok(record) = completions_rx.try_recv() {
                self.handle_completion(record, &mut in_flight_set, &records_tx);
            }

            let request = match self.generator.next_request() {
                Some(request) => request,
                None => break StopReason::SourceExhausted,
            };

            let now_ns = clock.now_ns();
            let phase = phase_for(&self.config, self.state.dispatched, now_ns - start_ns);
            let ticket = DispatchTicket {
                request: Arc::new(request),
                targeted_dispatch: targeted,
                sequence_index: self.state.sequence_index,
                phase,
            };
            let record = RequestRecord::dispatched(&ticket);
            in_flight_set.insert(ticket.sequence_index);
            self.state.sequence_index += 1;
            self.state.dispatched += 1;
            self.state.in_flight += 1;
            self.state.last_dispatch_ns = Some(now_ns);
            sent_requests.fetch_add(1, Ordering::SeqCst);
            self.strategy.on_dispatch();

            // waiting for pool capacity is the only backpressure path; a
            // stop signal during that wait turns the ticket into a
            // cancelled record instead of leaking it
            tokio::select! {
                _ = pool.submit(ticket, record.clone()) => {}
                _ = stop_rx.recv() => {
                    cancelled = true;
                    let mut record = record;
                    record.finish(RequestOutcome::Cancelled, clock.now_ns());
                    self.handle_completion(record, &mut in_flight_set, &records_tx);
                }
            }
        };

        info!(
            "Scheduler '{}' stopped ({:?}), draining {} in-flight requests",
            self.id, stop_reason, self.state.in_flight
        );
        if stop_reason == StopReason::Cancelled {
            pool.cancel_all();
        }
        let drain_deadline = clock.now_ns() + self.config.drain_timeout.as_nanos() as u64;
        let mut drain_cancelled = stop_reason == StopReason::Cancelled;
        while self.state.in_flight > 0 {
            tokio::select! {
                completion = completions_rx.recv() => match completion {
                    Some(record) => {
                        self.handle_completion(record, &mut in_flight_set, &records_tx);
                    }
                    None => break,
                },
                _ = clock.sleep_until(drain_deadline), if !drain_cancelled => {
                    warn!(
                        "Drain timeout reached, cancelling {} in-flight requests",
                        self.state.in_flight
                    );
                    pool.cancel_all();
                    drain_cancelled = true;
                }
            }
        }

        drop(pool);
        drop(records_tx);
        let aggregator = collector.await.context("record collector task panicked")?;
        let ended_at = Utc::now();
        Ok(aggregator.finalize(self.id.clone(), self.config.clone(), started_at, ended_at))
    }

    fn handle_completion(
        &mut self,
        record: RequestRecord,
        in_flight_set: &mut HashSet<u64>,
        records_tx: &UnboundedSender<RequestRecord>,
    ) {
        self.strategy.on_completion(&record);
        if !in_flight_set.remove(&record.sequence_index) {
            warn!(
                "completion for unknown sequence index {}",
                record.sequence_index
            );
        }
        self.state.in_flight = self.state.in_flight.saturating_sub(1);
        self.state.completed += 1;
        debug_assert_eq!(self.state.in_flight as usize, in_flight_set.len());
        let _ = records_tx.send(record);
    }
}

async fn deadline_sleep(clock: Clock, deadline_ns: Option<u64>) {
    match deadline_ns {
        Some(at_ns) => clock.sleep_until(at_ns).await,
        None => std::future::pending::<()>().await,
    }
}

/// Tags a dispatch with its phase. Warmup is checked against the leading
/// edge, cooldown against the trailing window of the configured caps;
/// request counts take precedence over durations.
fn phase_for(config: &RunConfig, dispatched_so_far: u64, elapsed_ns: u64) -> RequestPhase {
    if let Some(requests) = config.warmup.requests {
        if dispatched_so_far < requests {
            return RequestPhase::Warmup;
        }
    } else if let Some(duration) = config.warmup.duration {
        if elapsed_ns < duration.as_nanos() as u64 {
            return RequestPhase::Warmup;
        }
    }
    if let Some(requests) = config.cooldown.requests {
        if let Some(max) = config.max_requests {
            if dispatched_so_far >= max.saturating_sub(requests) {
                return RequestPhase::Cooldown;
            }
        }
    } else if let Some(duration) = config.cooldown.duration {
        if let Some(max) = config.max_duration {
            let window_start = (max.as_nanos() as u64).saturating_sub(duration.as_nanos() as u64);
            if elapsed_ns >= window_start {
                return RequestPhase::Cooldown;
            }
        }
    }
    RequestPhase::Measured
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::{
        DummyTextGenerationBackend, DummyTextRequestGenerator, TextGenerationRequest,
    };
    use std::time::Duration;

    fn run_config(rate_type: RateType, rate: Option<f64>) -> RunConfig {
        RunConfig {
            rate_type,
            rate,
            max_concurrency: 64,
            max_duration: None,
            max_requests: None,
            warmup: PhaseAllotment::default(),
            cooldown: PhaseAllotment::default(),
            request_timeout: None,
            drain_timeout: Duration::from_secs(10),
            random_seed: 42,
            sample_limit: 8192,
            retain_all_phases: false,
        }
    }

    fn drain_progress() -> mpsc::Sender<Option<SchedulerProgress>> {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        tx
    }

    async fn run_with_backend(
        config: RunConfig,
        backend: DummyTextGenerationBackend,
        clock: Clock,
    ) -> BenchmarkResults {
        let (stop_sender, _) = broadcast::channel(1);
        let mut generator = DummyTextRequestGenerator::new();
        let mut scheduler = Scheduler::new(
            "test".to_string(),
            Box::new(backend),
            config,
            &mut generator,
            drain_progress(),
            stop_sender,
            clock,
        )
        .unwrap();
        scheduler.run().await.unwrap()
    }

    fn assert_dense_sequence(results: &BenchmarkResults) {
        let mut sequences: Vec<_> = results.records.iter().map(|r| r.sequence_index).collect();
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), results.records.len());
    }

    fn peak_in_flight(results: &BenchmarkResults) -> usize {
        let spans: Vec<_> = results
            .records
            .iter()
            .map(|r| (r.actual_dispatch.unwrap(), r.completion.unwrap()))
            .collect();
        spans
            .iter()
            .map(|(dispatch, _)| {
                spans
                    .iter()
                    .filter(|(d, c)| d <= dispatch && c > dispatch)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_run_is_strictly_serial() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_millis(100),
            Duration::from_millis(0),
            1,
        );
        let mut config = run_config(RateType::Synchronous, None);
        config.max_requests = Some(10);
        let results = run_with_backend(config, backend, clock).await;

        assert_eq!(results.successful_requests(), 10);
        assert_eq!(results.records.len(), 10);
        assert_dense_sequence(&results);
        assert!(peak_in_flight(&results) <= 1);
        let e2e = results.e2e_latency.unwrap();
        assert!((e2e.mean_ms - 100.0).abs() < 1.0, "{}", e2e.mean_ms);
        let rate = results.request_rate.unwrap();
        assert!((rate - 10.0).abs() < 0.5, "{rate}");
        // dispatch order is sequence order even though completion drives it
        let mut records = results.records.clone();
        records.sort_by_key(|r| r.sequence_index);
        for pair in records.windows(2) {
            assert!(pair[1].actual_dispatch.unwrap() >= pair[0].completion.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_run_holds_target_in_flight() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_millis(50),
            Duration::from_millis(0),
            1,
        );
        let mut config = run_config(RateType::Concurrent, Some(4.0));
        config.max_requests = Some(100);
        let results = run_with_backend(config, backend, clock).await;

        assert_eq!(results.successful_requests(), 100);
        assert_eq!(peak_in_flight(&results), 4);
        let e2e = results.e2e_latency.unwrap();
        assert!((e2e.mean_ms - 50.0).abs() < 1.0, "{}", e2e.mean_ms);
        let rate = results.request_rate.unwrap();
        assert!((rate - 80.0).abs() < 4.0, "{rate}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_rate_grid_has_zero_deviation() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_millis(10),
            Duration::from_millis(0),
            1,
        );
        let mut config = run_config(RateType::Constant, Some(20.0));
        config.max_duration = Some(Duration::from_secs(5));
        config.warmup = PhaseAllotment {
            requests: None,
            duration: Some(Duration::from_millis(500)),
        };
        let results = run_with_backend(config, backend, clock).await;

        // 100 dispatches on the 50 ms grid, the first 10 inside warmup
        assert_eq!(results.outcomes.warmup.completed, 10);
        assert_eq!(results.outcomes.measured.completed, 90);
        let mut records = results.records.clone();
        records.sort_by_key(|r| r.sequence_index);
        let start_ns = records[0].targeted_dispatch - records[0].sequence_index * 50_000_000;
        for record in &records {
            assert_eq!(
                record.targeted_dispatch,
                start_ns + record.sequence_index * 50_000_000
            );
            // no backpressure: the 10 ms backend keeps up with the grid
            assert!(record.actual_dispatch.unwrap() - record.targeted_dispatch < 1_000_000);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poisson_replay_with_same_seed_is_identical() {
        let offsets = |results: &BenchmarkResults| -> Vec<u64> {
            let mut records = results.records.clone();
            records.sort_by_key(|r| r.sequence_index);
            let base = records[0].targeted_dispatch;
            records
                .iter()
                .map(|r| r.targeted_dispatch - base)
                .collect()
        };

        let clock_a = Clock::start();
        let backend_a = DummyTextGenerationBackend::new(
            clock_a,
            Duration::from_millis(5),
            Duration::from_millis(0),
            1,
        );
        let mut config = run_config(RateType::Poisson, Some(50.0));
        config.max_requests = Some(200);
        let first = run_with_backend(config.clone(), backend_a, clock_a).await;

        let clock_b = Clock::start();
        let backend_b = DummyTextGenerationBackend::new(
            clock_b,
            Duration::from_millis(5),
            Duration::from_millis(0),
            1,
        );
        let second = run_with_backend(config, backend_b, clock_b).await;

        assert_eq!(offsets(&first), offsets(&second));
        assert_eq!(first.successful_requests(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_metrics_for_serial_run() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_millis(20),
            Duration::from_millis(20),
            20,
        );
        let mut config = run_config(RateType::Synchronous, None);
        config.max_requests = Some(10);
        let results = run_with_backend(config, backend, clock).await;

        assert_eq!(results.successful_requests(), 10);
        let ttft = results.time_to_first_token.unwrap();
        assert!((ttft.mean_ms - 20.0).abs() < 1.0, "{}", ttft.mean_ms);
        let itl = results.inter_token_latency.unwrap();
        assert!((itl.mean_ms - 20.0).abs() < 1.0, "{}", itl.mean_ms);
        assert_eq!(itl.count, 10 * 19);
        let e2e = results.e2e_latency.unwrap();
        assert!((e2e.mean_ms - 400.0).abs() < 2.0, "{}", e2e.mean_ms);
        assert!(results
            .records
            .iter()
            .all(|record| record.output_tokens == 20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_failing_backend_splits_outcomes() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_millis(10),
            Duration::from_millis(0),
            1,
        )
        .with_failures(2);
        let mut config = run_config(RateType::Throughput, None);
        config.max_requests = Some(200);
        config.max_concurrency = 8;
        let results = run_with_backend(config, backend, clock).await;

        assert_eq!(results.outcomes.measured.completed, 100);
        assert_eq!(results.outcomes.measured.errored, 100);
        assert_eq!(
            results.outcomes.measured.errors_by_kind.get("http_status"),
            Some(&100)
        );
        // statistics cover the successes only
        assert_eq!(results.e2e_latency.unwrap().count, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_shorter_than_first_byte_leave_ttft_undefined() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_millis(200),
            Duration::from_millis(0),
            1,
        );
        let mut config = run_config(RateType::Synchronous, None);
        config.max_requests = Some(5);
        config.request_timeout = Some(Duration::from_millis(50));
        let results = run_with_backend(config, backend, clock).await;

        assert_eq!(results.outcomes.measured.timed_out, 5);
        assert!(results.time_to_first_token.is_none());
        assert!(!results.has_statistics());
        assert!(results
            .records
            .iter()
            .all(|r| r.outcome == Some(RequestOutcome::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_requests_yields_empty_report() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_millis(10),
            Duration::from_millis(0),
            1,
        );
        let mut config = run_config(RateType::Throughput, None);
        config.max_requests = Some(0);
        let results = run_with_backend(config, backend, clock).await;

        assert_eq!(results.outcomes.total(), 0);
        assert!(results.records.is_empty());
        assert!(!results.has_statistics());
    }

    struct FiniteGenerator {
        remaining: u64,
        limit: u64,
    }

    impl FiniteGenerator {
        fn new(limit: u64) -> FiniteGenerator {
            FiniteGenerator {
                remaining: limit,
                limit,
            }
        }
    }

    impl TextRequestGenerator for FiniteGenerator {
        fn reset(&mut self) {
            self.remaining = self.limit;
        }

        fn next_request(&mut self) -> Option<TextGenerationRequest> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            Some(TextGenerationRequest::text("finite", 3, None))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_exhaustion_drains_cleanly() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_millis(30),
            Duration::from_millis(0),
            1,
        );
        let config = run_config(RateType::Throughput, None);
        let (stop_sender, _) = broadcast::channel(1);
        let mut generator = FiniteGenerator::new(7);
        let mut scheduler = Scheduler::new(
            "finite".to_string(),
            Box::new(backend),
            config,
            &mut generator,
            drain_progress(),
            stop_sender,
            clock,
        )
        .unwrap();
        let results = scheduler.run().await.unwrap();

        assert_eq!(results.outcomes.total(), 7);
        assert_eq!(results.successful_requests(), 7);
        assert_eq!(scheduler.state().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_terminates_every_record() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_secs(600),
            Duration::from_millis(0),
            1,
        );
        let mut config = run_config(RateType::Throughput, None);
        config.max_concurrency = 8;
        config.max_requests = Some(1000);
        let (stop_sender, _) = broadcast::channel(1);
        let stopper = stop_sender.clone();
        let mut generator = DummyTextRequestGenerator::new();
        let mut scheduler = Scheduler::new(
            "cancel".to_string(),
            Box::new(backend),
            config,
            &mut generator,
            drain_progress(),
            stop_sender,
            clock,
        )
        .unwrap();
        let (results, _) = tokio::join!(scheduler.run(), async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = stopper.send(());
        });
        let results = results.unwrap();

        assert!(results.outcomes.total() > 0);
        assert_eq!(
            results.outcomes.measured.cancelled,
            results.outcomes.total()
        );
        assert!(results
            .records
            .iter()
            .all(|record| record.outcome.is_some() && record.completion.is_some()));
        assert_eq!(scheduler.state().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_cancels_stragglers() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_secs(600),
            Duration::from_millis(0),
            1,
        );
        let mut config = run_config(RateType::Throughput, None);
        config.max_requests = Some(3);
        config.max_concurrency = 4;
        config.drain_timeout = Duration::from_secs(1);
        let results = run_with_backend(config, backend, clock).await;

        assert_eq!(results.outcomes.measured.cancelled, 3);
        assert!(results.records.iter().all(|r| r.completion.is_some()));
    }

    #[test]
    fn test_phase_tagging_prefers_request_counts() {
        let mut config = run_config(RateType::Throughput, None);
        config.max_requests = Some(100);
        config.warmup = PhaseAllotment {
            requests: Some(10),
            duration: Some(Duration::from_secs(3600)),
        };
        config.cooldown = PhaseAllotment {
            requests: Some(5),
            duration: None,
        };
        assert_eq!(phase_for(&config, 0, 0), RequestPhase::Warmup);
        assert_eq!(phase_for(&config, 9, u64::MAX), RequestPhase::Warmup);
        assert_eq!(phase_for(&config, 10, 0), RequestPhase::Measured);
        assert_eq!(phase_for(&config, 94, 0), RequestPhase::Measured);
        assert_eq!(phase_for(&config, 95, 0), RequestPhase::Cooldown);
        assert_eq!(phase_for(&config, 99, 0), RequestPhase::Cooldown);
    }

    #[test]
    fn test_phase_tagging_by_duration_windows() {
        let mut config = run_config(RateType::Throughput, None);
        config.max_duration = Some(Duration::from_secs(10));
        config.warmup = PhaseAllotment {
            requests: None,
            duration: Some(Duration::from_secs(1)),
        };
        config.cooldown = PhaseAllotment {
            requests: None,
            duration: Some(Duration::from_secs(2)),
        };
        let second = 1_000_000_000u64;
        assert_eq!(phase_for(&config, 0, 0), RequestPhase::Warmup);
        assert_eq!(phase_for(&config, 0, second - 1), RequestPhase::Warmup);
        assert_eq!(phase_for(&config, 0, second), RequestPhase::Measured);
        assert_eq!(
            phase_for(&config, 0, 8 * second - 1),
            RequestPhase::Measured
        );
        assert_eq!(phase_for(&config, 0, 8 * second), RequestPhase::Cooldown);
    }
}
