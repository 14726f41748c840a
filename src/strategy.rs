use anyhow::anyhow;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use crate::records::RequestRecord;

/// Strategy selector, as it appears in configuration and reports.
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
pub enum RateType {
    Synchronous,
    Throughput,
    Concurrent,
    Constant,
    Poisson,
    Sweep,
}

/// What the dispatch loop should do for the next ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDirective {
    /// Dispatch at the given monotonic time. Times in the past mean
    /// dispatch now, one ticket per loop iteration, without batching.
    At(u64),
    /// Dispatch as soon as the worker pool accepts.
    Immediate,
    /// Hold until a completion releases a slot.
    AwaitCompletion,
}

/// Tagged variant over the dispatch policies. Strategy-private state (the
/// Poisson RNG, the constant-rate grid index, live slot counts) lives in
/// the variant; the scheduler owns the value and consults it from a single
/// thread of control.
///
/// `next_dispatch` is called exactly once per ticket the scheduler intends
/// to release, so each call advances time-grid strategies by one slot.
/// Sweep is not a variant here: the benchmark driver expands it into a
/// sequence of runs, one strategy each.
pub enum RateStrategy {
    Synchronous { live: u64 },
    Throughput,
    Concurrent { target: u64, live: u64 },
    Constant { interval_ns: u64, next_index: u64 },
    Poisson { rng: StdRng, gap: Exp<f64>, next_at_ns: Option<u64> },
}

impl RateStrategy {
    pub fn new(rate_type: RateType, rate: Option<f64>, seed: u64) -> anyhow::Result<RateStrategy> {
        match rate_type {
            RateType::Synchronous => Ok(RateStrategy::Synchronous { live: 0 }),
            RateType::Throughput => Ok(RateStrategy::Throughput),
            RateType::Concurrent => {
                let target = rate.ok_or_else(|| anyhow!("concurrent requires a rate"))?;
                if target < 1.0 {
                    return Err(anyhow!("concurrent rate must be at least 1"));
                }
                Ok(RateStrategy::Concurrent {
                    target: target.round() as u64,
                    live: 0,
                })
            }
            RateType::Constant => {
                let rate = rate.ok_or_else(|| anyhow!("constant requires a rate"))?;
                if rate <= 0.0 {
                    return Err(anyhow!("constant rate must be positive"));
                }
                Ok(RateStrategy::Constant {
                    interval_ns: (1e9 / rate).round() as u64,
                    next_index: 0,
                })
            }
            RateType::Poisson => {
                let rate = rate.ok_or_else(|| anyhow!("poisson requires a rate"))?;
                let gap = Exp::new(rate).map_err(|e| anyhow!("invalid poisson rate: {e}"))?;
                Ok(RateStrategy::Poisson {
                    rng: StdRng::seed_from_u64(seed),
                    gap,
                    next_at_ns: None,
                })
            }
            RateType::Sweep => Err(anyhow!(
                "sweep is expanded into individual runs by the benchmark driver"
            )),
        }
    }

    pub fn rate_type(&self) -> RateType {
        match self {
            RateStrategy::Synchronous { .. } => RateType::Synchronous,
            RateStrategy::Throughput => RateType::Throughput,
            RateStrategy::Concurrent { .. } => RateType::Concurrent,
            RateStrategy::Constant { .. } => RateType::Constant,
            RateStrategy::Poisson { .. } => RateType::Poisson,
        }
    }

    /// Produces the directive for the next ticket. `start_ns` is the run
    /// epoch offset the time-grid strategies anchor to.
    pub fn next_dispatch(&mut self, start_ns: u64) -> DispatchDirective {
        match self {
            RateStrategy::Synchronous { live } => {
                if *live > 0 {
                    DispatchDirective::AwaitCompletion
                } else {
                    DispatchDirective::Immediate
                }
            }
            RateStrategy::Throughput => DispatchDirective::Immediate,
            RateStrategy::Concurrent { target, live } => {
                if *live >= *target {
                    DispatchDirective::AwaitCompletion
                } else {
                    DispatchDirective::Immediate
                }
            }
            RateStrategy::Constant {
                interval_ns,
                next_index,
            } => {
                // t_k = t_0 + k/r; overruns are not absorbed, the grid
                // stays fixed and late slots dispatch back to back.
                let at = start_ns + *interval_ns * *next_index;
                *next_index += 1;
                DispatchDirective::At(at)
            }
            RateStrategy::Poisson {
                rng,
                gap,
                next_at_ns,
            } => {
                let gap_ns = (gap.sample(rng) * 1e9).round() as u64;
                let at = next_at_ns.unwrap_or(start_ns) + gap_ns;
                *next_at_ns = Some(at);
                DispatchDirective::At(at)
            }
        }
    }

    /// Called by the scheduler right after a ticket is handed to the pool.
    pub fn on_dispatch(&mut self) {
        match self {
            RateStrategy::Synchronous { live } | RateStrategy::Concurrent { live, .. } => {
                *live += 1;
            }
            _ => {}
        }
    }

    /// Called by the scheduler for every terminal record; releases the
    /// slot for completion-gated strategies.
    pub fn on_completion(&mut self, _record: &RequestRecord) {
        match self {
            RateStrategy::Synchronous { live } | RateStrategy::Concurrent { live, .. } => {
                *live = live.saturating_sub(1);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{RequestOutcome, RequestPhase};

    fn record(seq: u64) -> RequestRecord {
        RequestRecord {
            sequence_index: seq,
            phase: RequestPhase::Measured,
            targeted_dispatch: 0,
            actual_dispatch: Some(0),
            first_response_byte: None,
            first_token: None,
            last_token: None,
            completion: Some(1),
            token_arrivals: Vec::new(),
            prompt_tokens: 0,
            output_tokens: 0,
            outcome: Some(RequestOutcome::Completed),
        }
    }

    #[test]
    fn test_constant_rate_grid_is_exact() {
        let mut strategy = RateStrategy::new(RateType::Constant, Some(20.0), 0).unwrap();
        for k in 0..100u64 {
            match strategy.next_dispatch(1_000) {
                DispatchDirective::At(t) => assert_eq!(t, 1_000 + k * 50_000_000),
                other => panic!("expected At, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_poisson_is_reproducible_for_a_seed() {
        let sample = |seed: u64| -> Vec<u64> {
            let mut strategy = RateStrategy::new(RateType::Poisson, Some(50.0), seed).unwrap();
            (0..1000)
                .map(|_| match strategy.next_dispatch(0) {
                    DispatchDirective::At(t) => t,
                    other => panic!("expected At, got {:?}", other),
                })
                .collect()
        };
        let a = sample(42);
        let b = sample(42);
        assert_eq!(a, b);
        assert_ne!(a, sample(43));

        // arrivals are strictly ordered and the empirical rate is in the
        // right neighborhood of 50 req/s
        assert!(a.windows(2).all(|p| p[0] <= p[1]));
        let mean_gap_secs = *a.last().unwrap() as f64 / 1e9 / a.len() as f64;
        assert!((mean_gap_secs - 0.02).abs() < 0.005, "{mean_gap_secs}");
    }

    #[test]
    fn test_synchronous_gates_on_completion() {
        let mut strategy = RateStrategy::new(RateType::Synchronous, None, 0).unwrap();
        assert_eq!(strategy.next_dispatch(0), DispatchDirective::Immediate);
        strategy.on_dispatch();
        assert_eq!(strategy.next_dispatch(0), DispatchDirective::AwaitCompletion);
        strategy.on_completion(&record(0));
        assert_eq!(strategy.next_dispatch(0), DispatchDirective::Immediate);
    }

    #[test]
    fn test_concurrent_releases_one_slot_per_completion() {
        let mut strategy = RateStrategy::new(RateType::Concurrent, Some(4.0), 0).unwrap();
        for _ in 0..4 {
            assert_eq!(strategy.next_dispatch(0), DispatchDirective::Immediate);
            strategy.on_dispatch();
        }
        assert_eq!(strategy.next_dispatch(0), DispatchDirective::AwaitCompletion);
        strategy.on_completion(&record(0));
        assert_eq!(strategy.next_dispatch(0), DispatchDirective::Immediate);
        strategy.on_dispatch();
        assert_eq!(strategy.next_dispatch(0), DispatchDirective::AwaitCompletion);
    }

    #[test]
    fn test_sweep_is_not_a_runnable_strategy() {
        assert!(RateStrategy::new(RateType::Sweep, None, 0).is_err());
    }
}
