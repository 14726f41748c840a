//! Load generation and measurement harness for OpenAI-compatible
//! inference servers.
//!
//! The engine dispatches a request workload under a configurable rate
//! strategy, captures per-request and per-token timings from streaming
//! responses, and aggregates the measured phase into latency and
//! throughput statistics.

use std::path::PathBuf;

use tokio::sync::broadcast;
use tokio::sync::mpsc;

pub mod benchmark;
pub mod clock;
pub mod console;
pub mod records;
pub mod requests;
pub mod results;
pub mod scheduler;
pub mod strategy;
pub mod workers;
pub mod writers;

pub use benchmark::{Benchmark, BenchmarkConfig, Event};
pub use clock::Clock;
pub use records::{FailureKind, RequestOutcome, RequestPhase, RequestRecord};
pub use requests::{EndpointKind, SamplingMode};
pub use results::{BenchmarkReport, BenchmarkResults, MetricSummary};
pub use strategy::RateType;

use crate::console::run_console;
use crate::requests::{
    FileTextRequestGenerator, GenerationOptions, OpenAITextGenerationBackend,
    SyntheticTextRequestGenerator, TextRequestGenerator, TokenEstimator,
};

/// Where request payloads come from: a JSONL dataset when a file is
/// given, an infinite synthetic source otherwise.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub dataset_file: Option<PathBuf>,
    pub prompt: String,
    pub prompt_tokens: u64,
    pub prompt_variance: u64,
    pub tokenizer_file: Option<PathBuf>,
    pub sampling: SamplingMode,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// Runs the configured benchmark against the target backend, rendering
/// progress to the console and persisting the report when a path is
/// given. Ctrl-C cancels the run; in-flight requests drain and whatever
/// was measured is still reported.
pub async fn run(
    config: BenchmarkConfig,
    source: SourceOptions,
    report_path: Option<PathBuf>,
) -> anyhow::Result<BenchmarkReport> {
    config.validate()?;
    let clock = Clock::start();
    let backend = OpenAITextGenerationBackend::try_new(
        config.api_key.clone(),
        config.target.clone(),
        config.model.clone(),
        clock,
    )?;

    let estimator = match &source.tokenizer_file {
        Some(path) => TokenEstimator::from_file(path)?,
        None => TokenEstimator::approximate(),
    };
    let options = GenerationOptions {
        max_tokens: source.max_output_tokens,
        temperature: source.temperature,
        stop: Vec::new(),
    };
    let requests: Box<dyn TextRequestGenerator> = match &source.dataset_file {
        Some(path) => Box::new(FileTextRequestGenerator::new(
            path,
            config.endpoint,
            options,
            &estimator,
            source.sampling,
            config.random_seed,
        )?),
        None => Box::new(SyntheticTextRequestGenerator::new(
            &source.prompt,
            source.prompt_tokens,
            source.prompt_variance,
            config.endpoint,
            options,
            estimator,
            config.random_seed,
        )),
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (stop_sender, _) = broadcast::channel(8);

    let ctrlc_stop = stop_sender.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrlc_stop.send(());
        }
    });

    let console = tokio::spawn(run_console(
        config.clone(),
        event_rx,
        stop_sender.clone(),
    ));

    let mut benchmark = Benchmark::new(
        config,
        Box::new(backend),
        requests,
        event_tx.clone(),
        stop_sender,
        clock,
    );
    let report = match benchmark.run().await {
        Ok(report) => report,
        Err(e) => {
            // flush whatever was measured before surfacing the failure
            let partial = benchmark.get_report();
            if let Some(path) = &report_path {
                if !partial.get_results().is_empty() {
                    let _ = writers::write_report(&partial, path);
                }
            }
            let _ = event_tx.send(Event::BenchmarkError(format!("{e:#}")));
            drop(event_tx);
            let _ = console.await;
            return Err(e);
        }
    };

    if let Some(path) = &report_path {
        writers::write_report(&report, path)?;
        let _ = event_tx.send(Event::BenchmarkReportEnd(path.display().to_string()));
    }
    drop(event_tx);
    let _ = console.await;
    Ok(report)
}
