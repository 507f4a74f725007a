//! The dispatch rate budget.
//!
//! The budget answers "may I dispatch now, and if not, how long until I can."
//! It is fed by polling the backend's rate-status authority; no local
//! clock-based simulation is authoritative. Every dispatch decision is gated
//! by a fresh [`RateBudget::query`], except inside a single already-committed
//! dispatch cycle.

use std::sync::Arc;

use crate::{
    prelude::*,
    transport::{OcrTransport, RateStatus},
};

/// A point-in-time view of the rate budget.
///
/// Invariant: `ready == (available_slots > 0 && wait_seconds == 0)`. We
/// derive `ready` from the other two fields rather than trusting the
/// authority's flag, so an inconsistent authority cannot break the invariant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BudgetSnapshot {
    /// May we dispatch right now?
    pub ready: bool,

    /// How many requests we may dispatch.
    pub available_slots: u64,

    /// Seconds until capacity returns.
    pub wait_seconds: u64,
}

impl BudgetSnapshot {
    /// Build a snapshot from an authority reply.
    ///
    /// Authorities that predate slot reporting omit `available_slots`; when
    /// they claim readiness we assume `assumed_slots`, and when they do not
    /// we assume zero.
    pub fn from_status(status: &RateStatus, assumed_slots: u64) -> Self {
        let available_slots = status
            .available_slots
            .unwrap_or(if status.ready { assumed_slots } else { 0 });
        Self::from_fields(available_slots, status.wait_seconds)
    }

    /// Build a snapshot directly from slot and wait counts.
    pub fn from_fields(available_slots: u64, wait_seconds: u64) -> Self {
        Self {
            ready: available_slots > 0 && wait_seconds == 0,
            available_slots,
            wait_seconds,
        }
    }

    /// The snapshot used when the status authority is unreachable: ready,
    /// with a small slot count. Stalling forever on a dead status endpoint
    /// would be worse than occasionally over-dispatching; the OCR endpoint
    /// itself still rejects anything the real budget cannot absorb.
    pub fn fail_open(assumed_slots: u64) -> Self {
        Self::from_fields(assumed_slots.max(1), 0)
    }
}

/// Polls the rate-status authority on behalf of the control loop.
#[derive(Clone, Debug)]
pub struct RateBudget {
    transport: Arc<dyn OcrTransport>,

    /// Slot count assumed when the authority is unreachable or silent about
    /// slots. A tunable default, not a load-bearing number.
    fail_open_slots: u64,
}

impl RateBudget {
    /// Create a budget backed by `transport`.
    pub fn new(transport: Arc<dyn OcrTransport>, fail_open_slots: u64) -> Self {
        Self {
            transport,
            fail_open_slots,
        }
    }

    /// Interpret a status reply the same way [`RateBudget::query`] would.
    /// Used for status metadata piggybacked on other responses.
    pub fn interpret(&self, status: &RateStatus) -> BudgetSnapshot {
        BudgetSnapshot::from_status(status, self.fail_open_slots)
    }

    /// Ask the authority for the current budget.
    ///
    /// Transport failures are swallowed and mapped to the fail-open default;
    /// they are logged but never surfaced as errors.
    pub async fn query(&self) -> BudgetSnapshot {
        match self.transport.rate_status().await {
            Ok(status) => BudgetSnapshot::from_status(&status, self.fail_open_slots),
            Err(err) => {
                debug!("rate-status query failed, assuming capacity: {err:#}");
                BudgetSnapshot::fail_open(self.fail_open_slots)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn test_ready_is_derived_from_fields() {
        let snapshot = BudgetSnapshot::from_status(
            &RateStatus {
                ready: true,
                wait_seconds: 5,
                available_slots: Some(3),
            },
            5,
        );
        // The authority claimed readiness, but a nonzero wait wins.
        assert!(!snapshot.ready);
        assert_eq!(snapshot.wait_seconds, 5);

        let snapshot = BudgetSnapshot::from_status(
            &RateStatus {
                ready: false,
                wait_seconds: 0,
                available_slots: None,
            },
            5,
        );
        assert!(!snapshot.ready);
        assert_eq!(snapshot.available_slots, 0);
    }

    #[test]
    fn test_missing_slots_assumed_when_ready() {
        let snapshot = BudgetSnapshot::from_status(
            &RateStatus {
                ready: true,
                wait_seconds: 0,
                available_slots: None,
            },
            5,
        );
        assert!(snapshot.ready);
        assert_eq!(snapshot.available_slots, 5);
    }

    #[tokio::test]
    async fn test_fail_open_on_status_outage() {
        let transport = Arc::new(MockTransport::default());
        transport.set_status_outage();
        let budget = RateBudget::new(transport.clone(), 5);

        let snapshot = budget.query().await;
        assert!(snapshot.ready);
        assert_eq!(snapshot.available_slots, 5);
        assert_eq!(snapshot.wait_seconds, 0);
        assert_eq!(transport.status_calls(), 1);
    }

    #[tokio::test]
    async fn test_query_reflects_authority() {
        let transport = Arc::new(MockTransport::default());
        transport.set_status_fallback(RateStatus {
            ready: false,
            wait_seconds: 9,
            available_slots: Some(0),
        });
        let budget = RateBudget::new(transport, 5);

        let snapshot = budget.query().await;
        assert!(!snapshot.ready);
        assert_eq!(snapshot.wait_seconds, 9);
    }
}
