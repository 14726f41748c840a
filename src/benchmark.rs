use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::clock::Clock;
use crate::requests::{EndpointKind, TextGenerationBackend, TextRequestGenerator};
use crate::results::{BenchmarkReport, BenchmarkResults};
use crate::scheduler::{PhaseAllotment, RunConfig, Scheduler, SchedulerProgress};
use crate::strategy::RateType;

/// Sweep headroom above the observed throughput rate.
const THROUGHPUT_BUDGET: f64 = 1.2;

/// The full configuration surface, folded from CLI flags and environment
/// before any component is constructed and snapshotted into the report.
#[serde_with::serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub target: String,
    pub model: String,
    /// Never serialized into reports.
    #[serde(skip)]
    pub api_key: Option<String>,
    pub endpoint: EndpointKind,
    pub rate_type: RateType,
    pub rate: Option<f64>,
    /// Explicit sweep step list; bypasses the probing runs.
    pub rates: Option<Vec<f64>>,
    pub num_rates: u64,
    #[serde_as(as = "Option<serde_with::DurationSecondsWithFrac<f64>>")]
    #[serde(rename = "max_seconds")]
    pub max_duration: Option<Duration>,
    pub max_requests: Option<u64>,
    pub warmup_percent: Option<f64>,
    pub warmup_requests: Option<u64>,
    pub cooldown_percent: Option<f64>,
    pub cooldown_requests: Option<u64>,
    pub max_concurrency: u64,
    #[serde_as(as = "Option<serde_with::DurationSecondsWithFrac<f64>>")]
    #[serde(rename = "request_timeout_secs")]
    pub request_timeout: Option<Duration>,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac<f64>")]
    #[serde(rename = "drain_timeout_secs")]
    pub drain_timeout: Duration,
    pub random_seed: u64,
    pub sample_limit: usize,
    pub retain_all_phases: bool,
    pub run_id: String,
}

impl BenchmarkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be greater than 0"));
        }
        if self.sample_limit == 0 {
            return Err(anyhow!("sample_limit must be greater than 0"));
        }
        match self.rate_type {
            RateType::Synchronous | RateType::Throughput => {
                if self.rate.is_some() {
                    return Err(anyhow!(
                        "rate must not be specified for {} benchmarks",
                        self.rate_type
                    ));
                }
            }
            RateType::Concurrent | RateType::Constant | RateType::Poisson => match self.rate {
                None => {
                    return Err(anyhow!(
                        "rate must be specified for {} benchmarks",
                        self.rate_type
                    ))
                }
                Some(rate) if rate <= 0.0 => {
                    return Err(anyhow!("rate must be positive"));
                }
                Some(_) => {}
            },
            RateType::Sweep => {
                if self.rate.is_some() {
                    return Err(anyhow!("rate must not be specified for sweep benchmarks"));
                }
                if self.num_rates == 0 && self.rates.is_none() {
                    return Err(anyhow!("num_rates must be greater than 0 for sweeps"));
                }
            }
        }
        if self.rates.is_some() && self.rate_type != RateType::Sweep {
            return Err(anyhow!("rates is only valid for sweep benchmarks"));
        }
        for (name, percent) in [
            ("warmup_percent", self.warmup_percent),
            ("cooldown_percent", self.cooldown_percent),
        ] {
            if let Some(percent) = percent {
                if !(0.0..100.0).contains(&percent) {
                    return Err(anyhow!("{name} must be within [0, 100)"));
                }
                if self.max_requests.is_none() && self.max_duration.is_none() {
                    return Err(anyhow!("{name} requires max_requests or max_seconds"));
                }
            }
        }
        if self.cooldown_requests.is_some() && self.max_requests.is_none() {
            return Err(anyhow!("cooldown_requests requires max_requests"));
        }
        Ok(())
    }

    /// Resolves the warmup boundary; explicit request counts win over the
    /// percent form, which resolves against whichever cap is configured.
    fn warmup_allotment(&self) -> PhaseAllotment {
        resolve_allotment(
            self.warmup_requests,
            self.warmup_percent,
            self.max_requests,
            self.max_duration,
        )
    }

    fn cooldown_allotment(&self) -> PhaseAllotment {
        resolve_allotment(
            self.cooldown_requests,
            self.cooldown_percent,
            self.max_requests,
            self.max_duration,
        )
    }

    /// The per-run slice of this configuration for one strategy.
    pub fn run_plan(&self, rate_type: RateType, rate: Option<f64>) -> RunConfig {
        RunConfig {
            rate_type,
            rate,
            max_concurrency: self.max_concurrency,
            max_duration: self.max_duration,
            max_requests: self.max_requests,
            warmup: self.warmup_allotment(),
            cooldown: self.cooldown_allotment(),
            request_timeout: self.request_timeout,
            drain_timeout: self.drain_timeout,
            random_seed: self.random_seed,
            sample_limit: self.sample_limit,
            retain_all_phases: self.retain_all_phases,
        }
    }
}

fn resolve_allotment(
    requests: Option<u64>,
    percent: Option<f64>,
    max_requests: Option<u64>,
    max_duration: Option<Duration>,
) -> PhaseAllotment {
    if let Some(requests) = requests {
        return PhaseAllotment {
            requests: Some(requests),
            duration: None,
        };
    }
    if let Some(percent) = percent {
        if let Some(max) = max_requests {
            return PhaseAllotment {
                requests: Some((max as f64 * percent / 100.0).ceil() as u64),
                duration: None,
            };
        }
        if let Some(max) = max_duration {
            return PhaseAllotment {
                requests: None,
                duration: Some(max.mul_f64(percent / 100.0)),
            };
        }
    }
    PhaseAllotment::default()
}

pub struct MessageEvent {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub level: log::Level,
}

pub struct BenchmarkEvent {
    pub id: String,
    pub rate_type: RateType,
    pub progress: f64,
    pub request_throughput: Option<f64>,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub sent_requests: u64,
    pub in_flight_requests: u64,
    pub avg_ttft_ms: Option<f64>,
    pub avg_itl_ms: Option<f64>,
    pub output_token_rate: Option<f64>,
    pub results: Option<BenchmarkResults>,
}

pub enum Event {
    BenchmarkStart(BenchmarkEvent),
    BenchmarkProgress(BenchmarkEvent),
    BenchmarkEnd(BenchmarkEvent),
    Message(MessageEvent),
    BenchmarkReportEnd(String),
    BenchmarkError(String),
}

fn message_event(message: String) -> Event {
    Event::Message(MessageEvent {
        message,
        timestamp: Utc::now(),
        level: log::Level::Info,
    })
}

/// Drives one or more runs (a sweep is several), owning the backend, the
/// request source and the report being assembled.
pub struct Benchmark {
    config: BenchmarkConfig,
    backend: Box<dyn TextGenerationBackend + Send + Sync>,
    requests: Box<dyn TextRequestGenerator>,
    report: BenchmarkReport,
    event_bus: mpsc::UnboundedSender<Event>,
    stop_sender: broadcast::Sender<()>,
    /// Shared run epoch; the backend must stamp events on this same
    /// timeline.
    clock: Clock,
}

impl Benchmark {
    pub fn new(
        config: BenchmarkConfig,
        backend: Box<dyn TextGenerationBackend + Send + Sync>,
        requests: Box<dyn TextRequestGenerator>,
        event_bus: mpsc::UnboundedSender<Event>,
        stop_sender: broadcast::Sender<()>,
        clock: Clock,
    ) -> Benchmark {
        Benchmark {
            report: BenchmarkReport::new(config.clone()),
            config,
            backend,
            requests,
            event_bus,
            stop_sender,
            clock,
        }
    }

    pub fn get_report(&self) -> BenchmarkReport {
        self.report.clone()
    }

    pub async fn run(&mut self) -> anyhow::Result<BenchmarkReport> {
        self.config.validate()?;
        self.report.start();
        info!("Probing backend at {}", self.config.target);
        self.backend
            .probe()
            .await
            .context("backend probe failed before any run")?;
        match self.config.rate_type {
            RateType::Sweep => self.run_sweep().await?,
            rate_type => {
                let id = run_id(rate_type, self.config.rate);
                self.run_one(id, rate_type, self.config.rate).await?;
            }
        }
        self.report.end();
        self.event_bus.send(message_event(format!(
            "Benchmark complete, {} run(s)",
            self.report.get_results().len()
        )))?;
        Ok(self.report.clone())
    }

    async fn run_sweep(&mut self) -> anyhow::Result<()> {
        let rates = match self.config.rates.clone() {
            Some(rates) => rates,
            None => {
                // bound the rate range with a serial run and an open
                // throughput run, then step between them
                let synchronous = self
                    .run_one("synchronous".to_string(), RateType::Synchronous, None)
                    .await?;
                let throughput = self
                    .run_one("throughput".to_string(), RateType::Throughput, None)
                    .await?;
                let low = synchronous.request_rate.unwrap_or(0.1).max(0.1);
                let high = throughput
                    .request_rate
                    .context("throughput run produced no achieved rate to sweep from")?
                    * THROUGHPUT_BUDGET;
                self.event_bus.send(message_event(format!(
                    "Sweeping {} rates between {:.2} and {:.2} req/s",
                    self.config.num_rates, low, high
                )))?;
                geometric_rates(low, high, self.config.num_rates)
            }
        };
        for rate in rates {
            self.run_one(
                format!("constant@{rate:.2}reqs"),
                RateType::Constant,
                Some(rate),
            )
            .await?;
        }
        Ok(())
    }

    async fn run_one(
        &mut self,
        id: String,
        rate_type: RateType,
        rate: Option<f64>,
    ) -> anyhow::Result<BenchmarkResults> {
        debug!("Running benchmark '{id}'");
        self.event_bus.send(Event::BenchmarkStart(BenchmarkEvent {
            id: id.clone(),
            rate_type,
            progress: 0.0,
            request_throughput: None,
            successful_requests: 0,
            failed_requests: 0,
            sent_requests: 0,
            in_flight_requests: 0,
            avg_ttft_ms: None,
            avg_itl_ms: None,
            output_token_rate: None,
            results: None,
        }))?;

        let progress_tx = self.handle_progress(id.clone(), rate_type).await;
        let clock = self.clock;
        let run_config = self.config.run_plan(rate_type, rate);
        let results = {
            let mut scheduler = Scheduler::new(
                id.clone(),
                self.backend.clone(),
                run_config,
                self.requests.as_mut(),
                progress_tx.clone(),
                self.stop_sender.clone(),
                clock,
            )?;
            scheduler.run().await?
        };
        // close the progress handler
        let _ = progress_tx.send(None).await;
        self.report.add_benchmark_result(results.clone());

        self.event_bus.send(Event::BenchmarkEnd(BenchmarkEvent {
            id,
            rate_type,
            progress: 100.0,
            request_throughput: results.request_rate,
            successful_requests: results.outcomes.completed(),
            failed_requests: results.outcomes.failed(),
            sent_requests: results.outcomes.total(),
            in_flight_requests: 0,
            avg_ttft_ms: results.time_to_first_token.as_ref().map(|s| s.mean_ms),
            avg_itl_ms: results.inter_token_latency.as_ref().map(|s| s.mean_ms),
            output_token_rate: results.output_token_rate,
            results: Some(results.clone()),
        }))?;
        Ok(results)
    }

    /// Bridges scheduler progress into the event bus until `None` is
    /// received.
    async fn handle_progress(
        &self,
        id: String,
        rate_type: RateType,
    ) -> Sender<Option<SchedulerProgress>> {
        let (tx, mut rx): (
            Sender<Option<SchedulerProgress>>,
            Receiver<Option<SchedulerProgress>>,
        ) = mpsc::channel(8);
        let event_bus = self.event_bus.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    None => break,
                    Some(progress) => {
                        let _ = event_bus.send(Event::BenchmarkProgress(BenchmarkEvent {
                            id: id.clone(),
                            rate_type,
                            progress: progress.progress,
                            request_throughput: progress.requests_throughput,
                            successful_requests: progress.successful_requests,
                            failed_requests: progress.failed_requests,
                            sent_requests: progress.sent_requests,
                            in_flight_requests: progress.in_flight_requests,
                            avg_ttft_ms: progress.avg_ttft_ms,
                            avg_itl_ms: progress.avg_itl_ms,
                            output_token_rate: progress.output_token_rate,
                            results: None,
                        }));
                    }
                }
            }
        });
        tx
    }
}

fn run_id(rate_type: RateType, rate: Option<f64>) -> String {
    match (rate_type, rate) {
        (RateType::Concurrent, Some(rate)) => format!("concurrent@{rate:.0}"),
        (RateType::Constant, Some(rate)) => format!("constant@{rate:.2}reqs"),
        (RateType::Poisson, Some(rate)) => format!("poisson@{rate:.2}reqs"),
        _ => rate_type.to_string(),
    }
}

/// `count` geometrically spaced rates in `(low, high]`.
fn geometric_rates(low: f64, high: f64, count: u64) -> Vec<f64> {
    if high <= low || count == 0 {
        return vec![high.max(low)];
    }
    let ratio = high / low;
    (1..=count)
        .map(|step| low * ratio.powf(step as f64 / count as f64))
        .collect()
}
