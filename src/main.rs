use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use guidellm::{BenchmarkConfig, EndpointKind, RateType, SamplingMode, SourceOptions};

#[derive(Parser, Debug)]
#[command(
    name = "guidellm",
    about = "Load generation and measurement for OpenAI-compatible inference servers"
)]
struct Args {
    /// Backend base URL
    #[arg(long, default_value = "http://localhost:8000")]
    target: String,

    /// Model identifier passed to the backend
    #[arg(long)]
    model: String,

    /// API key; falls back to the environment
    #[arg(long, env = "GUIDELLM_API_KEY")]
    api_key: Option<String>,

    /// Endpoint family to benchmark
    #[arg(long, value_enum, default_value_t = EndpointKind::Chat)]
    endpoint: EndpointKind,

    /// Rate strategy
    #[arg(long, value_enum, default_value_t = RateType::Sweep)]
    rate_type: RateType,

    /// Rate parameter for constant/poisson (req/s) and concurrent (slots)
    #[arg(long)]
    rate: Option<f64>,

    /// Explicit sweep rates, comma separated; skips the probing runs
    #[arg(long, value_delimiter = ',')]
    rates: Option<Vec<f64>>,

    /// Number of generated sweep steps
    #[arg(long, default_value_t = 5)]
    num_rates: u64,

    /// Overall duration cap in seconds
    #[arg(long)]
    max_seconds: Option<f64>,

    /// Overall request cap
    #[arg(long)]
    max_requests: Option<u64>,

    /// Leading share of the run excluded from statistics
    #[arg(long)]
    warmup_percent: Option<f64>,

    #[arg(long)]
    warmup_requests: Option<u64>,

    /// Trailing share of the run excluded from statistics
    #[arg(long)]
    cooldown_percent: Option<f64>,

    #[arg(long)]
    cooldown_requests: Option<u64>,

    /// Worker pool cap
    #[arg(long, default_value_t = 128)]
    max_concurrency: u64,

    /// Per-request deadline in seconds
    #[arg(long)]
    request_timeout_secs: Option<f64>,

    /// How long to wait for in-flight requests after the run stops
    #[arg(long, default_value_t = 10.0)]
    drain_timeout_secs: f64,

    /// Seed for the strategy RNG and sampling
    #[arg(long, default_value_t = 42)]
    random_seed: u64,

    /// Exact-quantile sample cap before spilling to histograms
    #[arg(long, default_value_t = 65536)]
    sample_limit: usize,

    /// Keep warmup and cooldown records in the report
    #[arg(long)]
    retain_all_phases: bool,

    #[arg(long)]
    run_id: Option<String>,

    /// JSONL dataset with a `text` field per line; synthetic prompts when
    /// absent
    #[arg(long)]
    dataset_file: Option<PathBuf>,

    /// Base prompt for the synthetic source
    #[arg(long, default_value = "Explain the history of numerical weather prediction")]
    prompt: String,

    /// Target synthetic prompt length in tokens
    #[arg(long, default_value_t = 512)]
    prompt_tokens: u64,

    /// Standard deviation of the synthetic prompt length
    #[arg(long, default_value_t = 64)]
    prompt_variance: u64,

    /// Tokenizer JSON file for exact prompt token counts
    #[arg(long)]
    tokenizer_file: Option<PathBuf>,

    /// Dataset sampling order
    #[arg(long, value_enum, default_value_t = SamplingMode::Sequential)]
    sampling: SamplingMode,

    /// Requested max output tokens per request
    #[arg(long)]
    max_output_tokens: Option<u32>,

    /// Temperature passthrough
    #[arg(long)]
    temperature: Option<f64>,

    /// Where to write the JSON report
    #[arg(long)]
    report_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let run_id = args.run_id.clone().unwrap_or_else(|| {
        format!("run-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"))
    });
    let config = BenchmarkConfig {
        target: args.target,
        model: args.model,
        api_key: args.api_key,
        endpoint: args.endpoint,
        rate_type: args.rate_type,
        rate: args.rate,
        rates: args.rates,
        num_rates: args.num_rates,
        max_duration: args.max_seconds.map(Duration::from_secs_f64),
        max_requests: args.max_requests,
        warmup_percent: args.warmup_percent,
        warmup_requests: args.warmup_requests,
        cooldown_percent: args.cooldown_percent,
        cooldown_requests: args.cooldown_requests,
        max_concurrency: args.max_concurrency,
        request_timeout: args.request_timeout_secs.map(Duration::from_secs_f64),
        drain_timeout: Duration::from_secs_f64(args.drain_timeout_secs),
        random_seed: args.random_seed,
        sample_limit: args.sample_limit,
        retain_all_phases: args.retain_all_phases,
        run_id,
    };
    let source = SourceOptions {
        dataset_file: args.dataset_file,
        prompt: args.prompt,
        prompt_tokens: args.prompt_tokens,
        prompt_variance: args.prompt_variance,
        tokenizer_file: args.tokenizer_file,
        sampling: args.sampling,
        max_output_tokens: args.max_output_tokens,
        temperature: args.temperature,
    };

    guidellm::run(config, source, args.report_path).await?;
    Ok(())
}
