use crate::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// What happened to a partial result handed to [`ResultAggregator::offer`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted { received: usize, expected: usize },
    /// Byte-identical to a result already collected under the same correlation id
    Duplicate,
    /// Nobody is waiting on this correlation id (never started, finished or expired)
    Unknown,
    /// The expected count was already reached
    Surplus,
}

struct Slot {
    expected: usize,
    results: Vec<Vec<u8>>,
    notify: Arc<Notify>,
}

type Slots = Arc<Mutex<HashMap<Uuid, Slot>>>;

/// Collects partial results per correlation id until an expected count is reached.
///
/// Any number of correlation ids may be pending at once. Results are matched only by
/// their correlation id, so one request can never be satisfied by another's results.
#[derive(Clone, Default)]
pub struct ResultAggregator {
    slots: Slots,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting for a correlation id.
    ///
    /// Must be called before the request is published, so that no early reply is lost.
    pub fn begin(
        &self,
        correlation_id: Uuid,
        expected: usize,
        timeout: Duration,
    ) -> Result<PendingResults, AggregatorError> {
        let notify = Arc::new(Notify::new());
        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&correlation_id) {
                return Err(AggregatorError::DuplicateCorrelationId(correlation_id));
            }
            slots.insert(
                correlation_id,
                Slot {
                    expected,
                    results: Vec::with_capacity(expected),
                    notify: notify.clone(),
                },
            );
        }
        debug!(%correlation_id, expected, "collecting results");

        Ok(PendingResults {
            correlation_id,
            deadline: Instant::now() + timeout,
            notify,
            slots: self.slots.clone(),
        })
    }

    /// Hand over one partial result
    pub fn offer(&self, correlation_id: Uuid, result: Vec<u8>) -> OfferOutcome {
        let mut slots = self.slots.lock();
        let slot = match slots.get_mut(&correlation_id) {
            Some(slot) => slot,
            None => {
                debug!(%correlation_id, "dropping result for unknown correlation id");
                return OfferOutcome::Unknown;
            }
        };

        if slot.results.contains(&result) {
            warn!(%correlation_id, "ignoring redelivered result");
            return OfferOutcome::Duplicate;
        }
        if slot.results.len() >= slot.expected {
            warn!(%correlation_id, expected = slot.expected, "ignoring surplus result");
            return OfferOutcome::Surplus;
        }

        slot.results.push(result);
        slot.notify.notify_one();
        OfferOutcome::Accepted {
            received: slot.results.len(),
            expected: slot.expected,
        }
    }

    /// Wake waiters so they re-check their state.
    ///
    /// With a correlation id only that waiter is woken, otherwise all of them are.
    pub fn notify_ready(&self, correlation_id: Option<Uuid>) {
        let slots = self.slots.lock();
        match correlation_id {
            Some(id) => {
                if let Some(slot) = slots.get(&id) {
                    slot.notify.notify_one();
                }
            }
            None => slots.values().for_each(|slot| slot.notify.notify_one()),
        }
    }

    /// Number of correlation ids currently collecting
    pub fn pending_count(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Handle on one pending correlation id.
///
/// Dropping the handle, or the future returned by [`PendingResults::wait`], abandons the
/// request: its slot is released and later results for it are dropped as unknown.
pub struct PendingResults {
    correlation_id: Uuid,
    deadline: Instant,
    notify: Arc<Notify>,
    slots: Slots,
}

impl PendingResults {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Wait until the expected number of results arrived, or fail at the deadline
    pub async fn wait(self) -> Result<Vec<Vec<u8>>, AggregatorError> {
        loop {
            if let Some(results) = self.take_if_complete() {
                return Ok(results);
            }

            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = sleep_until(self.deadline) => break,
            }
        }

        // A result may have landed right at the deadline
        if let Some(results) = self.take_if_complete() {
            return Ok(results);
        }

        let (received, expected) = self
            .slots
            .lock()
            .get(&self.correlation_id)
            .map_or((0, 0), |slot| (slot.results.len(), slot.expected));
        Err(AggregatorError::Timeout {
            correlation_id: self.correlation_id,
            received,
            expected,
        })
    }

    fn take_if_complete(&self) -> Option<Vec<Vec<u8>>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&self.correlation_id)?;
        if slot.results.len() >= slot.expected {
            Some(std::mem::take(&mut slot.results))
        } else {
            None
        }
    }
}

impl Drop for PendingResults {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.correlation_id);
    }
}
