use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::requests::TextGenerationRequest;

/// Which phase of the run a request was dispatched in. Only `Measured`
/// records contribute to statistics; the scheduler tags tickets, the rate
/// strategies never observe phases.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Warmup,
    Measured,
    Cooldown,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Connect,
    Timeout,
    HttpStatus,
    Decode,
    Cancelled,
}

/// Terminal outcome of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed,
    Error { kind: FailureKind, message: String },
    Cancelled,
    Timeout,
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Completed)
    }

    /// The failure kind reported in error breakdowns, `None` on success.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            RequestOutcome::Completed => None,
            RequestOutcome::Error { kind, .. } => Some(*kind),
            RequestOutcome::Cancelled => Some(FailureKind::Cancelled),
            RequestOutcome::Timeout => Some(FailureKind::Timeout),
        }
    }
}

/// One payload released by the scheduler, handed to the worker pool.
#[derive(Debug, Clone)]
pub struct DispatchTicket {
    pub request: Arc<TextGenerationRequest>,
    pub targeted_dispatch: u64,
    pub sequence_index: u64,
    pub phase: RequestPhase,
}

/// One row of measurement, created by the scheduler at dispatch, filled by
/// the worker driving the backend, owned by the aggregator afterwards. All
/// times are monotonic nanoseconds from the run epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub sequence_index: u64,
    pub phase: RequestPhase,
    pub targeted_dispatch: u64,
    pub actual_dispatch: Option<u64>,
    pub first_response_byte: Option<u64>,
    pub first_token: Option<u64>,
    pub last_token: Option<u64>,
    pub completion: Option<u64>,
    /// Arrival time of each streamed token (or token group).
    pub token_arrivals: Vec<u64>,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    /// `None` only while the request is in flight.
    pub outcome: Option<RequestOutcome>,
}

impl RequestRecord {
    pub fn dispatched(ticket: &DispatchTicket) -> RequestRecord {
        RequestRecord {
            sequence_index: ticket.sequence_index,
            phase: ticket.phase,
            targeted_dispatch: ticket.targeted_dispatch,
            actual_dispatch: None,
            first_response_byte: None,
            first_token: None,
            last_token: None,
            completion: None,
            token_arrivals: Vec::new(),
            prompt_tokens: 0,
            output_tokens: 0,
            outcome: None,
        }
    }

    pub fn note_first_byte(&mut self, at_ns: u64) {
        if self.first_response_byte.is_none() {
            self.first_response_byte = Some(at_ns);
        }
    }

    pub fn note_token(&mut self, at_ns: u64, token_count: u64) {
        if self.first_token.is_none() {
            self.first_token = Some(at_ns);
        }
        self.last_token = Some(at_ns);
        self.token_arrivals.push(at_ns);
        self.output_tokens += token_count;
    }

    pub fn finish(&mut self, outcome: RequestOutcome, at_ns: u64) {
        self.completion = Some(at_ns);
        self.outcome = Some(outcome);
    }

    /// Time to first token, from actual dispatch.
    pub fn time_to_first_token_ns(&self) -> Option<u64> {
        match (self.actual_dispatch, self.first_token) {
            (Some(dispatch), Some(first)) => Some(first.saturating_sub(dispatch)),
            _ => None,
        }
    }

    /// End-to-end latency, from actual dispatch to completion.
    pub fn e2e_latency_ns(&self) -> Option<u64> {
        match (self.actual_dispatch, self.completion) {
            (Some(dispatch), Some(end)) => Some(end.saturating_sub(dispatch)),
            _ => None,
        }
    }

    /// Gaps between consecutive token arrivals. The gap between dispatch
    /// and the first token is not included.
    pub fn inter_token_gaps_ns(&self) -> impl Iterator<Item = u64> + '_ {
        self.token_arrivals
            .windows(2)
            .map(|pair| pair[1].saturating_sub(pair[0]))
    }

    /// Checks `targeted <= actual <= first_byte <= first_token <=
    /// last_token <= completion` over the timestamps that are set.
    pub fn timeline_is_monotonic(&self) -> bool {
        let ordered = [
            Some(self.targeted_dispatch),
            self.actual_dispatch,
            self.first_response_byte,
            self.first_token,
            self.last_token,
            self.completion,
        ];
        let mut last = 0u64;
        for t in ordered.into_iter().flatten() {
            if t < last {
                return false;
            }
            last = t;
        }
        self.token_arrivals.windows(2).all(|p| p[0] <= p[1])
    }
}
