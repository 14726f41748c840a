use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::{broadcast, mpsc, Semaphore};

use crate::clock::Clock;
use crate::records::{DispatchTicket, FailureKind, RequestOutcome, RequestRecord};
use crate::requests::{GenerationEvent, TextGenerationBackend};

/// Parallel request executors behind a fixed concurrency cap. The
/// scheduler blocks in `submit` when the cap is reached; that wait is the
/// only backpressure path in the system. Each accepted ticket runs on its
/// own task, drives the backend's event stream into the ticket's record,
/// and emits the finished record as a message. Workers never touch
/// scheduler state.
pub struct WorkerPool {
    backend: Box<dyn TextGenerationBackend + Send + Sync>,
    permits: Arc<Semaphore>,
    completions_tx: mpsc::UnboundedSender<RequestRecord>,
    request_timeout: Option<Duration>,
    clock: Clock,
    cancel: broadcast::Sender<()>,
}

impl WorkerPool {
    pub fn new(
        backend: Box<dyn TextGenerationBackend + Send + Sync>,
        max_concurrency: u64,
        request_timeout: Option<Duration>,
        clock: Clock,
        completions_tx: mpsc::UnboundedSender<RequestRecord>,
    ) -> WorkerPool {
        let (cancel, _) = broadcast::channel(1);
        WorkerPool {
            backend,
            permits: Arc::new(Semaphore::new(max_concurrency as usize)),
            completions_tx,
            request_timeout,
            clock,
            cancel,
        }
    }

    /// Cancels every in-flight worker. Each produces a `Cancelled` record
    /// stamped at the instant the signal was observed.
    pub fn cancel_all(&self) {
        let _ = self.cancel.send(());
    }

    /// Hands a ticket to a worker, waiting for pool capacity first.
    pub async fn submit(&self, ticket: DispatchTicket, mut record: RequestRecord) {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed");
        let backend = self.backend.clone();
        let completions = self.completions_tx.clone();
        let clock = self.clock;
        let mut cancel_rx = self.cancel.subscribe();
        // the deadline is anchored to the targeted time, so a ticket that
        // waited out its budget in the pool queue can expire immediately
        let deadline_ns = self
            .request_timeout
            .map(|timeout| ticket.targeted_dispatch + timeout.as_nanos() as u64);

        tokio::spawn(async move {
            let _permit = permit;
            let (event_tx, mut event_rx) = mpsc::channel::<GenerationEvent>(32);
            record.actual_dispatch = Some(clock.now_ns());
            let request = ticket.request.clone();
            let generator =
                tokio::spawn(async move { backend.generate(request, event_tx).await });

            let outcome = loop {
                tokio::select! {
                    _ = cancel_rx.recv() => break RequestOutcome::Cancelled,
                    _ = deadline_sleep(clock, deadline_ns) => break RequestOutcome::Timeout,
                    event = event_rx.recv() => match event {
                        None => break RequestOutcome::Error {
                            kind: FailureKind::Decode,
                            message: "backend stream ended without a terminal event".to_string(),
                        },
                        Some(GenerationEvent::FirstByte { at_ns }) => record.note_first_byte(at_ns),
                        Some(GenerationEvent::Token { at_ns, token_count, .. }) => {
                            record.note_token(at_ns, token_count);
                        }
                        Some(GenerationEvent::Done { prompt_tokens, output_tokens }) => {
                            record.prompt_tokens = prompt_tokens;
                            record.output_tokens = output_tokens;
                            break RequestOutcome::Completed;
                        }
                        Some(GenerationEvent::Failed { kind, message }) => {
                            break RequestOutcome::Error { kind, message };
                        }
                    },
                }
            };
            if !outcome.is_success() {
                generator.abort();
            }
            record.finish(outcome, clock.now_ns());
            if completions.send(record).is_err() {
                warn!("completion channel closed before worker finished");
            }
        });
    }
}

async fn deadline_sleep(clock: Clock, deadline_ns: Option<u64>) {
    match deadline_ns {
        Some(at_ns) => clock.sleep_until(at_ns).await,
        None => std::future::pending::<()>().await,
    }
}
