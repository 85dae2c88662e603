//! Per-turn cap on in-flight subagent tasks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::SubagentError;

#[derive(Debug, Default)]
struct Ledger {
    /// Bumped on every reset; permits from older turns no longer count.
    generation: u64,
    in_flight: usize,
}

/// Rejects submissions beyond the cap instead of queueing them.
#[derive(Debug, Clone)]
pub(crate) struct SubagentLimiter {
    max: usize,
    ledger: Arc<Mutex<Ledger>>,
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SubagentLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.ledger).in_flight
    }

    /// Takes a slot for one task, released when the permit drops.
    pub fn try_acquire(&self) -> Result<LimiterPermit, SubagentError> {
        let mut ledger = lock(&self.ledger);
        if ledger.in_flight >= self.max {
            warn!(in_flight = ledger.in_flight, max = self.max, "Subagent submission rejected");
            return Err(SubagentError::concurrency_limit(self.max));
        }
        ledger.in_flight += 1;
        debug!(in_flight = ledger.in_flight, max = self.max, "Subagent slot taken");
        Ok(LimiterPermit {
            ledger: Arc::clone(&self.ledger),
            generation: ledger.generation,
        })
    }

    /// Starts a new turn with an empty ledger.
    pub fn reset(&self) {
        let mut ledger = lock(&self.ledger);
        ledger.generation += 1;
        ledger.in_flight = 0;
        debug!(generation = ledger.generation, "Subagent ledger reset");
    }
}

/// One task's slot in the ledger. Dropping it releases the slot once.
#[derive(Debug)]
pub(crate) struct LimiterPermit {
    ledger: Arc<Mutex<Ledger>>,
    generation: u64,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        let mut ledger = lock(&self.ledger);
        if ledger.generation == self.generation {
            ledger.in_flight = ledger.in_flight.saturating_sub(1);
        }
    }
}
