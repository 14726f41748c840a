use colored::*;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::benchmark::{BenchmarkConfig, Event};

/// One line of live state per benchmark run.
#[derive(Clone)]
pub struct BenchmarkInfo {
    pub id: String,
    pub running: bool,
    pub progress: f64,
    pub throughput: Option<f64>,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub in_flight_requests: u64,
    pub avg_ttft_ms: Option<f64>,
    pub avg_itl_ms: Option<f64>,
    pub output_token_rate: Option<f64>,
}

pub struct ConsoleState {
    benchmarks: Vec<BenchmarkInfo>,
}

impl ConsoleState {
    pub fn new() -> ConsoleState {
        ConsoleState {
            benchmarks: Vec::new(),
        }
    }

    pub fn upsert(&mut self, benchmark: BenchmarkInfo) {
        if let Some(existing) = self.benchmarks.iter_mut().find(|b| b.id == benchmark.id) {
            *existing = benchmark;
        } else {
            self.benchmarks.push(benchmark);
        }
    }
}

impl Default for ConsoleState {
    fn default() -> Self {
        Self::new()
    }
}

fn print_config(config: &BenchmarkConfig) {
    println!("{}", "Benchmark configuration".bold());
    println!("  target:          {}", config.target);
    println!("  model:           {}", config.model);
    println!("  endpoint:        {}", config.endpoint);
    println!("  rate type:       {}", config.rate_type);
    if let Some(rate) = config.rate {
        println!("  rate:            {rate}");
    }
    if let Some(max_requests) = config.max_requests {
        println!("  max requests:    {max_requests}");
    }
    if let Some(max_duration) = config.max_duration {
        println!("  max seconds:     {}", max_duration.as_secs_f64());
    }
    println!("  max concurrency: {}", config.max_concurrency);
    println!("  random seed:     {}", config.random_seed);
}

fn format_opt(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(value) => format!("{value:.1}{unit}"),
        None => "n/a".to_string(),
    }
}

fn print_benchmark(info: &BenchmarkInfo) {
    let status = if info.running {
        format!("{:>5.1}%", info.progress).yellow()
    } else {
        "done".green()
    };
    println!(
        "[{}] {} ok={} err={} in-flight={} rate={} ttft={} itl={} out-tok/s={}",
        status,
        info.id.bold(),
        info.successful_requests.to_string().green(),
        if info.failed_requests > 0 {
            info.failed_requests.to_string().red()
        } else {
            info.failed_requests.to_string().normal()
        },
        info.in_flight_requests,
        format_opt(info.throughput, " req/s"),
        format_opt(info.avg_ttft_ms, " ms"),
        format_opt(info.avg_itl_ms, " ms"),
        format_opt(info.output_token_rate, ""),
    );
}

fn info_from_event(event: &crate::benchmark::BenchmarkEvent, running: bool) -> BenchmarkInfo {
    BenchmarkInfo {
        id: event.id.clone(),
        running,
        progress: event.progress,
        throughput: event.request_throughput,
        successful_requests: event.successful_requests,
        failed_requests: event.failed_requests,
        in_flight_requests: event.in_flight_requests,
        avg_ttft_ms: event.avg_ttft_ms,
        avg_itl_ms: event.avg_itl_ms,
        output_token_rate: event.output_token_rate,
    }
}

/// Consumes the event bus and renders progress until the bus closes or
/// the stop signal fires.
pub async fn run_console(
    config: BenchmarkConfig,
    mut receiver: UnboundedReceiver<Event>,
    stop_sender: broadcast::Sender<()>,
) {
    let mut state = ConsoleState::new();
    let mut stop_receiver = stop_sender.subscribe();
    print_config(&config);

    loop {
        tokio::select! {
            _ = stop_receiver.recv() => {
                println!("{}", "Benchmark interrupted, draining in-flight requests".yellow());
                break;
            }
            event = receiver.recv() => {
                let Some(event) = event else { break };
                match event {
                    Event::BenchmarkStart(event) => {
                        state.upsert(info_from_event(&event, true));
                        println!("Starting benchmark {}", event.id.bold());
                    }
                    Event::BenchmarkProgress(event) => {
                        let info = info_from_event(&event, true);
                        print_benchmark(&info);
                        state.upsert(info);
                    }
                    Event::BenchmarkEnd(event) => {
                        let info = info_from_event(&event, false);
                        print_benchmark(&info);
                        state.upsert(info);
                    }
                    Event::Message(message) => {
                        println!("[{}] {}", message.timestamp.format("%H:%M:%S"), message.message);
                    }
                    Event::BenchmarkReportEnd(path) => {
                        println!("Report saved to {}", path.bold());
                        break;
                    }
                    Event::BenchmarkError(error) => {
                        eprintln!("{} {}", "benchmark failed:".red().bold(), error);
                        break;
                    }
                }
            }
        }
    }
}
