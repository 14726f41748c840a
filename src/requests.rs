use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use reqwest::header::AUTHORIZATION;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tokio::sync::mpsc::Sender;

use crate::clock::Clock;
use crate::records::FailureKind;

/// Which OpenAI-compatible endpoint family a request targets.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::Display,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EndpointKind {
    Text,
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Generation parameters passed through to the backend unchanged.
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stop: Vec<String>,
}

/// One immutable request payload produced by a request generator.
#[derive(Debug, Clone)]
pub struct TextGenerationRequest {
    pub endpoint: EndpointKind,
    pub prompt: String,
    /// Explicit chat messages; when absent a chat request wraps the prompt
    /// in a single user message.
    pub messages: Option<Vec<ChatMessage>>,
    pub options: GenerationOptions,
    /// Prompt token count hint, from the tokenizer estimate at source
    /// construction. The backend's `usage` object overrides it.
    pub num_prompt_tokens: u64,
    pub dataset_index: Option<usize>,
}

impl TextGenerationRequest {
    pub fn text(
        prompt: impl Into<String>,
        num_prompt_tokens: u64,
        max_tokens: Option<u32>,
    ) -> TextGenerationRequest {
        TextGenerationRequest {
            endpoint: EndpointKind::Text,
            prompt: prompt.into(),
            messages: None,
            options: GenerationOptions {
                max_tokens,
                ..GenerationOptions::default()
            },
            num_prompt_tokens,
            dataset_index: None,
        }
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        match &self.messages {
            Some(messages) => messages.clone(),
            None => vec![ChatMessage {
                role: "user".to_string(),
                content: self.prompt.clone(),
            }],
        }
    }
}

/// Prompt token counting: exact when a tokenizer file is supplied, a
/// character-ratio estimate otherwise.
#[derive(Clone)]
pub struct TokenEstimator {
    tokenizer: Option<Arc<Tokenizer>>,
}

impl TokenEstimator {
    pub fn approximate() -> TokenEstimator {
        TokenEstimator { tokenizer: None }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<TokenEstimator> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("unable to load tokenizer from {}: {e}", path.display()))?;
        Ok(TokenEstimator {
            tokenizer: Some(Arc::new(tokenizer)),
        })
    }

    pub fn estimate(&self, text: &str) -> u64 {
        match &self.tokenizer {
            Some(tokenizer) => tokenizer
                .encode(text, false)
                .map(|encoding| encoding.len() as u64)
                .unwrap_or_else(|_| approximate_tokens(text)),
            None => approximate_tokens(text),
        }
    }
}

fn approximate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / 4).max(1)
}

/// Restartable lazy sequence of request payloads. Finite sources return
/// `None` once exhausted; infinite (synthetic) sources never do. Single
/// consumer; `reset` returns the source to its start and re-seeds any
/// sampling state so replays are identical.
pub trait TextRequestGenerator: Send {
    fn reset(&mut self);
    fn next_request(&mut self) -> Option<TextGenerationRequest>;
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::Display,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SamplingMode {
    Sequential,
    Shuffled,
}

/// Finite source backed by a JSONL file whose objects carry a `text`
/// field, one request per line.
pub struct FileTextRequestGenerator {
    requests: Vec<TextGenerationRequest>,
    order: Vec<usize>,
    cursor: usize,
    sampling: SamplingMode,
    seed: u64,
}

impl FileTextRequestGenerator {
    pub fn new(
        path: &Path,
        endpoint: EndpointKind,
        options: GenerationOptions,
        estimator: &TokenEstimator,
        sampling: SamplingMode,
        seed: u64,
    ) -> anyhow::Result<FileTextRequestGenerator> {
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read dataset {}", path.display()))?;
        let mut requests = Vec::new();
        for (index, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(line)
                .with_context(|| format!("dataset line {} is not valid JSON", index + 1))?;
            let text = value
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("dataset line {} missing string field `text`", index + 1))?;
            requests.push(TextGenerationRequest {
                endpoint,
                prompt: text.to_string(),
                messages: None,
                options: options.clone(),
                num_prompt_tokens: estimator.estimate(text),
                dataset_index: Some(index),
            });
        }
        if requests.is_empty() {
            bail!("dataset {} contains no usable records", path.display());
        }
        info!(
            "Loaded {} requests from {}",
            requests.len(),
            path.display()
        );
        let mut generator = FileTextRequestGenerator {
            order: (0..requests.len()).collect(),
            requests,
            cursor: 0,
            sampling,
            seed,
        };
        generator.reset();
        Ok(generator)
    }
}

impl TextRequestGenerator for FileTextRequestGenerator {
    fn reset(&mut self) {
        self.cursor = 0;
        self.order = (0..self.requests.len()).collect();
        if self.sampling == SamplingMode::Shuffled {
            let mut rng = StdRng::seed_from_u64(self.seed);
            self.order.shuffle(&mut rng);
        }
    }

    fn next_request(&mut self) -> Option<TextGenerationRequest> {
        let index = *self.order.get(self.cursor)?;
        self.cursor += 1;
        Some(self.requests[index].clone())
    }
}

/// Infinite synthetic source: repeats a base prompt out to a target token
/// length drawn from a seeded normal distribution.
pub struct SyntheticTextRequestGenerator {
    base_words: Vec<String>,
    prompt_tokens: u64,
    variance: u64,
    endpoint: EndpointKind,
    options: GenerationOptions,
    estimator: TokenEstimator,
    rng: StdRng,
    seed: u64,
    issued: usize,
}

impl SyntheticTextRequestGenerator {
    pub fn new(
        base_prompt: &str,
        prompt_tokens: u64,
        variance: u64,
        endpoint: EndpointKind,
        options: GenerationOptions,
        estimator: TokenEstimator,
        seed: u64,
    ) -> SyntheticTextRequestGenerator {
        SyntheticTextRequestGenerator {
            base_words: base_prompt
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            prompt_tokens: prompt_tokens.max(1),
            variance,
            endpoint,
            options,
            estimator,
            rng: StdRng::seed_from_u64(seed),
            seed,
            issued: 0,
        }
    }
}

impl TextRequestGenerator for SyntheticTextRequestGenerator {
    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.issued = 0;
    }

    fn next_request(&mut self) -> Option<TextGenerationRequest> {
        let target = if self.variance == 0 {
            self.prompt_tokens
        } else {
            let normal = Normal::new(self.prompt_tokens as f64, self.variance as f64)
                .expect("variance is finite");
            normal.sample(&mut self.rng).round().max(1.0) as u64
        };
        let mut prompt = String::new();
        let mut words = self.base_words.iter().cycle();
        while self.estimator.estimate(&prompt) < target {
            if !prompt.is_empty() {
                prompt.push(' ');
            }
            prompt.push_str(words.next().map(String::as_str).unwrap_or("hello"));
        }
        let num_prompt_tokens = self.estimator.estimate(&prompt);
        let index = self.issued;
        self.issued += 1;
        Some(TextGenerationRequest {
            endpoint: self.endpoint,
            prompt,
            messages: None,
            options: self.options.clone(),
            num_prompt_tokens,
            dataset_index: Some(index),
        })
    }
}

/// Fixed-prompt infinite generator used by the test suite.
pub struct DummyTextRequestGenerator {
    issued: usize,
}

impl DummyTextRequestGenerator {
    pub fn new() -> DummyTextRequestGenerator {
        DummyTextRequestGenerator { issued: 0 }
    }
}

impl Default for DummyTextRequestGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TextRequestGenerator for DummyTextRequestGenerator {
    fn reset(&mut self) {
        self.issued = 0;
    }

    fn next_request(&mut self) -> Option<TextGenerationRequest> {
        let index = self.issued;
        self.issued += 1;
        let mut request = TextGenerationRequest::text("Lorem ipsum dolor sit amet", 10, Some(16));
        request.dataset_index = Some(index);
        Some(request)
    }
}

/// One event observed while driving a single request. Timestamps are
/// captured by the backend at the moment of observation, never at handoff.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    FirstByte {
        at_ns: u64,
    },
    Token {
        at_ns: u64,
        text: String,
        token_count: u64,
    },
    /// Success terminal; counts come from the `usage` object when the
    /// backend reports one, else from what was streamed.
    Done {
        prompt_tokens: u64,
        output_tokens: u64,
    },
    /// Failure terminal.
    Failed {
        kind: FailureKind,
        message: String,
    },
}

#[async_trait]
pub trait TextGenerationBackend: TextGenerationBackendClone + Send + Sync {
    /// Issues one request and streams timestamped events into `events`,
    /// ending with exactly one terminal event. The backend never retries;
    /// a dropped receiver aborts the stream silently.
    async fn generate(&self, request: Arc<TextGenerationRequest>, events: Sender<GenerationEvent>);

    /// Reachability and model-availability probe, run once before any
    /// benchmark. A failure here is fatal.
    async fn probe(&self) -> anyhow::Result<()>;
}

pub trait TextGenerationBackendClone {
    fn clone_box(&self) -> Box<dyn TextGenerationBackend + Send + Sync>;
}

impl<T> TextGenerationBackendClone for T
where
    T: 'static + TextGenerationBackend + Clone + Send + Sync,
{
    fn clone_box(&self) -> Box<dyn TextGenerationBackend + Send + Sync> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn TextGenerationBackend + Send + Sync> {
    fn clone(&self) -> Box<dyn TextGenerationBackend + Send + Sync> {
        self.clone_box()
    }
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

impl StreamChunk {
    /// `choices[0].delta.content` for chat, `choices[0].text` for text.
    fn token_text(&self) -> Option<String> {
        let choice = self.choices.first()?;
        choice
            .delta
            .as_ref()
            .and_then(|delta| delta.content.clone())
            .or_else(|| choice.text.clone())
    }
}

#[derive(Clone)]
pub struct OpenAITextGenerationBackend {
    api_key: Option<String>,
    base_url: String,
    model: String,
    client: reqwest::Client,
    clock: Clock,
}

impl OpenAITextGenerationBackend {
    pub fn try_new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        clock: Clock,
    ) -> anyhow::Result<OpenAITextGenerationBackend> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to construct HTTP client")?;
        Ok(OpenAITextGenerationBackend {
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
            clock,
        })
    }

    fn request_body(&self, request: &TextGenerationRequest) -> serde_json::Value {
        let mut body = match request.endpoint {
            EndpointKind::Chat => serde_json::json!({
                "model": self.model,
                "messages": request.chat_messages(),
                "stream": true,
            }),
            EndpointKind::Text => serde_json::json!({
                "model": self.model,
                "prompt": request.prompt,
                "stream": true,
            }),
        };
        let map = body.as_object_mut().expect("body is an object");
        if let Some(max_tokens) = request.options.max_tokens {
            map.insert("max_tokens".to_string(), serde_json::json!(max_tokens));
        }
        if let Some(temperature) = request.options.temperature {
            map.insert("temperature".to_string(), serde_json::json!(temperature));
        }
        if !request.options.stop.is_empty() {
            map.insert("stop".to_string(), serde_json::json!(request.options.stop));
        }
        body
    }

    fn endpoint_url(&self, endpoint: EndpointKind) -> String {
        match endpoint {
            EndpointKind::Text => format!("{}/v1/completions", self.base_url),
            EndpointKind::Chat => format!("{}/v1/chat/completions", self.base_url),
        }
    }
}

fn classify_stream_error(error: &reqwest_eventsource::Error) -> (FailureKind, String) {
    use reqwest_eventsource::Error as EsError;
    match error {
        EsError::InvalidStatusCode(code, _) => {
            (FailureKind::HttpStatus, format!("HTTP status {code}"))
        }
        EsError::Transport(e) if e.is_timeout() => (FailureKind::Timeout, e.to_string()),
        EsError::Transport(e) if e.is_connect() => (FailureKind::Connect, e.to_string()),
        EsError::Transport(e) => (FailureKind::Connect, e.to_string()),
        EsError::Utf8(_) | EsError::Parser(_) | EsError::InvalidContentType(..) => {
            (FailureKind::Decode, error.to_string())
        }
        other => (FailureKind::Decode, other.to_string()),
    }
}

#[async_trait]
impl TextGenerationBackend for OpenAITextGenerationBackend {
    async fn generate(&self, request: Arc<TextGenerationRequest>, events: Sender<GenerationEvent>) {
        let url = self.endpoint_url(request.endpoint);
        let body = self.request_body(&request);
        trace!("Requesting {url} for dataset index {:?}", request.dataset_index);

        let mut builder = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {api_key}"));
        }
        let mut stream = match EventSource::new(builder) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = events
                    .send(GenerationEvent::Failed {
                        kind: FailureKind::Connect,
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let mut usage: Option<StreamUsage> = None;
        let mut streamed_tokens = 0u64;
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Open) => {
                    let first_byte = GenerationEvent::FirstByte {
                        at_ns: self.clock.now_ns(),
                    };
                    if events.send(first_byte).await.is_err() {
                        stream.close();
                        return;
                    }
                }
                Ok(Event::Message(message)) => {
                    let at_ns = self.clock.now_ns();
                    if message.data == "[DONE]" {
                        break;
                    }
                    if message.data.starts_with("{\"error\"") {
                        let _ = events
                            .send(GenerationEvent::Failed {
                                kind: FailureKind::HttpStatus,
                                message: message.data.clone(),
                            })
                            .await;
                        stream.close();
                        return;
                    }
                    let chunk: StreamChunk = match serde_json::from_str(&message.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            let _ = events
                                .send(GenerationEvent::Failed {
                                    kind: FailureKind::Decode,
                                    message: format!("undecodable stream chunk: {e}"),
                                })
                                .await;
                            stream.close();
                            return;
                        }
                    };
                    let chunk_text = chunk.token_text();
                    if let Some(chunk_usage) = chunk.usage {
                        usage = Some(chunk_usage);
                    }
                    if let Some(text) = chunk_text {
                        if !text.is_empty() {
                            streamed_tokens += 1;
                            let token = GenerationEvent::Token {
                                at_ns,
                                text,
                                token_count: 1,
                            };
                            if events.send(token).await.is_err() {
                                stream.close();
                                return;
                            }
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    let (kind, message) = classify_stream_error(&e);
                    let _ = events.send(GenerationEvent::Failed { kind, message }).await;
                    stream.close();
                    return;
                }
            }
        }
        stream.close();

        let (prompt_tokens, output_tokens) = match usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (request.num_prompt_tokens, streamed_tokens),
        };
        let _ = events
            .send(GenerationEvent::Done {
                prompt_tokens,
                output_tokens,
            })
            .await;
    }

    async fn probe(&self) -> anyhow::Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let mut builder = self.client.get(&url);
        if let Some(api_key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {api_key}"));
        }
        let response = builder
            .send()
            .await
            .with_context(|| format!("backend unreachable at {url}"))?;
        if !response.status().is_success() {
            bail!("backend probe failed with HTTP status {}", response.status());
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .context("backend probe returned invalid JSON")?;
        if let Some(models) = payload.get("data").and_then(|data| data.as_array()) {
            let available = models
                .iter()
                .filter_map(|model| model.get("id").and_then(|id| id.as_str()));
            if !available.clone().any(|id| id == self.model) {
                bail!(
                    "model {} not served by backend (available: {})",
                    self.model,
                    available.collect::<Vec<_>>().join(", ")
                );
            }
        }
        debug!("Backend probe succeeded for {url}");
        Ok(())
    }
}

/// Deterministic in-process backend used by the test suite: emits the
/// first byte and first token after `time_to_first_token`, then one token
/// per `inter_token_delay`.
#[derive(Clone)]
pub struct DummyTextGenerationBackend {
    clock: Clock,
    time_to_first_token: Duration,
    inter_token_delay: Duration,
    num_tokens: u64,
    fail_every: Option<u64>,
    issued: Arc<AtomicU64>,
}

impl DummyTextGenerationBackend {
    pub fn new(
        clock: Clock,
        time_to_first_token: Duration,
        inter_token_delay: Duration,
        num_tokens: u64,
    ) -> DummyTextGenerationBackend {
        DummyTextGenerationBackend {
            clock,
            time_to_first_token,
            inter_token_delay,
            num_tokens,
            fail_every: None,
            issued: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Every `every`-th request fails with an HTTP-status error instead of
    /// producing output.
    pub fn with_failures(mut self, every: u64) -> DummyTextGenerationBackend {
        self.fail_every = Some(every.max(1));
        self
    }
}

#[async_trait]
impl TextGenerationBackend for DummyTextGenerationBackend {
    async fn generate(&self, request: Arc<TextGenerationRequest>, events: Sender<GenerationEvent>) {
        let sequence = self.issued.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.time_to_first_token).await;
        if let Some(every) = self.fail_every {
            if (sequence + 1) % every == 0 {
                let _ = events
                    .send(GenerationEvent::Failed {
                        kind: FailureKind::HttpStatus,
                        message: "injected HTTP status 500".to_string(),
                    })
                    .await;
                return;
            }
        }
        let first_byte = GenerationEvent::FirstByte {
            at_ns: self.clock.now_ns(),
        };
        if events.send(first_byte).await.is_err() {
            return;
        }
        for index in 0..self.num_tokens {
            if index > 0 {
                tokio::time::sleep(self.inter_token_delay).await;
            }
            let token = GenerationEvent::Token {
                at_ns: self.clock.now_ns(),
                text: "token".to_string(),
                token_count: 1,
            };
            if events.send(token).await.is_err() {
                return;
            }
        }
        let _ = events
            .send(GenerationEvent::Done {
                prompt_tokens: request.num_prompt_tokens,
                output_tokens: self.num_tokens,
            })
            .await;
    }

    async fn probe(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn collect_events(
        mut rx: tokio::sync::mpsc::Receiver<GenerationEvent>,
    ) -> Vec<GenerationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_approximate_token_estimate() {
        let estimator = TokenEstimator::approximate();
        assert_eq!(estimator.estimate(""), 1);
        assert_eq!(estimator.estimate("abcdefgh"), 2);
    }

    #[test]
    fn test_file_generator_sequential_and_reset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..5 {
            writeln!(file, "{{\"text\": \"prompt number {i}\"}}").unwrap();
        }
        let mut generator = FileTextRequestGenerator::new(
            file.path(),
            EndpointKind::Text,
            GenerationOptions::default(),
            &TokenEstimator::approximate(),
            SamplingMode::Sequential,
            0,
        )
        .unwrap();
        let first_pass: Vec<_> = std::iter::from_fn(|| generator.next_request())
            .map(|r| r.dataset_index.unwrap())
            .collect();
        assert_eq!(first_pass, vec![0, 1, 2, 3, 4]);
        assert!(generator.next_request().is_none());
        generator.reset();
        assert_eq!(generator.next_request().unwrap().dataset_index, Some(0));
    }

    #[test]
    fn test_file_generator_shuffle_is_seeded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..20 {
            writeln!(file, "{{\"text\": \"prompt number {i}\"}}").unwrap();
        }
        let order = |seed: u64| -> Vec<usize> {
            let mut generator = FileTextRequestGenerator::new(
                file.path(),
                EndpointKind::Text,
                GenerationOptions::default(),
                &TokenEstimator::approximate(),
                SamplingMode::Shuffled,
                seed,
            )
            .unwrap();
            std::iter::from_fn(|| generator.next_request())
                .map(|r| r.dataset_index.unwrap())
                .collect()
        };
        assert_eq!(order(7), order(7));
        assert_ne!(order(7), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_synthetic_generator_replays_after_reset() {
        let mut generator = SyntheticTextRequestGenerator::new(
            "the quick brown fox jumps over the lazy dog",
            50,
            10,
            EndpointKind::Chat,
            GenerationOptions::default(),
            TokenEstimator::approximate(),
            42,
        );
        let first: Vec<_> = (0..10)
            .map(|_| generator.next_request().unwrap().num_prompt_tokens)
            .collect();
        generator.reset();
        let second: Vec<_> = (0..10)
            .map(|_| generator.next_request().unwrap().num_prompt_tokens)
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dummy_backend_event_timing() {
        let clock = Clock::start();
        let backend = DummyTextGenerationBackend::new(
            clock,
            Duration::from_millis(20),
            Duration::from_millis(20),
            3,
        );
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let request = Arc::new(TextGenerationRequest::text("hi", 2, None));
        backend.generate(request, tx).await;
        let events = collect_events(rx);
        assert_eq!(events.len(), 5); // first byte, 3 tokens, done
        match &events[0] {
            GenerationEvent::FirstByte { at_ns } => assert_eq!(*at_ns, 20_000_000),
            other => panic!("expected first byte, got {:?}", other),
        }
        match &events[3] {
            GenerationEvent::Token { at_ns, .. } => assert_eq!(*at_ns, 60_000_000),
            other => panic!("expected token, got {:?}", other),
        }
        match &events[4] {
            GenerationEvent::Done {
                prompt_tokens,
                output_tokens,
            } => {
                assert_eq!(*prompt_tokens, 2);
                assert_eq!(*output_tokens, 3);
            }
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_openai_backend_parses_chat_stream() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_chunked_body(|w| {
                w.write_all(b"data: {\"choices\": [{\"delta\": {\"content\": \"Hello\"}, \"finish_reason\": null}]}\n\n")?;
                w.write_all(b"data: {\"choices\": [{\"delta\": {\"content\": \", world\"}, \"finish_reason\": null}]}\n\n")?;
                w.write_all(b"data: {\"choices\": [], \"usage\": {\"prompt_tokens\": 12, \"completion_tokens\": 2}}\n\n")?;
                w.write_all(b"data: [DONE]\n\n")
            })
            .create_async()
            .await;

        let clock = Clock::start();
        let backend =
            OpenAITextGenerationBackend::try_new(None, server.url(), "gpt2", clock).unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let mut request = TextGenerationRequest::text("hi", 3, Some(16));
        request.endpoint = EndpointKind::Chat;
        backend.generate(Arc::new(request), tx).await;

        let events = collect_events(rx);
        assert!(matches!(events[0], GenerationEvent::FirstByte { .. }));
        let tokens: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Token { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, vec!["Hello", ", world"]);
        match events.last().unwrap() {
            GenerationEvent::Done {
                prompt_tokens,
                output_tokens,
            } => {
                assert_eq!(*prompt_tokens, 12);
                assert_eq!(*output_tokens, 2);
            }
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_openai_backend_reports_http_status_failures() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/completions")
            .with_status(500)
            .create_async()
            .await;

        let clock = Clock::start();
        let backend =
            OpenAITextGenerationBackend::try_new(None, server.url(), "gpt2", clock).unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let request = Arc::new(TextGenerationRequest::text("hi", 3, None));
        backend.generate(request, tx).await;

        let events = collect_events(rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            GenerationEvent::Failed { kind, .. } => assert_eq!(*kind, FailureKind::HttpStatus),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_checks_model_availability() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/models")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{\"data\": [{\"id\": \"gpt2\"}, {\"id\": \"other\"}]}")
            .create_async()
            .await;

        let clock = Clock::start();
        let ok_backend =
            OpenAITextGenerationBackend::try_new(None, server.url(), "gpt2", clock).unwrap();
        assert!(ok_backend.probe().await.is_ok());

        let missing_backend =
            OpenAITextGenerationBackend::try_new(None, server.url(), "unknown-model", clock)
                .unwrap();
        assert!(missing_backend.probe().await.is_err());
    }
}
