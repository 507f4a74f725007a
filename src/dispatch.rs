//! Batch dispatch cycles.
//!
//! A dispatch cycle picks a capacity-bounded slice of pending pages, fans
//! out their requests, and merges every result back into the store before
//! returning. Per-page failures are classified and recorded; only a failure
//! of the whole cycle surfaces as an error, and then only after the affected
//! pages have been made eligible for retry.

use std::{sync::Arc, time::Instant};

use crate::{
    budget::{BudgetSnapshot, RateBudget},
    classify::{ErrorKind, classify_message},
    credential::Credential,
    prelude::*,
    store::{PageOutcome, PageStore},
    transport::{BatchReply, OcrReply, OcrRequest, OcrTransport},
};

/// Record of one dispatch cycle. Ephemeral; exists mostly so the caller can
/// see which pages were chosen and how long the cycle took.
#[derive(Clone, Debug)]
pub struct BatchRun {
    /// The pages chosen for this cycle, lowest id first.
    pub page_ids: Vec<u32>,

    /// When the cycle started.
    pub started_at: Instant,

    /// When every result had been merged.
    pub completed_at: Instant,
}

impl BatchRun {
    /// Did this cycle dispatch nothing?
    pub fn is_empty(&self) -> bool {
        self.page_ids.is_empty()
    }
}

/// A session-fatal condition discovered during a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltSignal {
    /// The key was explicitly rejected.
    InvalidCredential,

    /// A long-horizon quota is exhausted.
    QuotaExhausted,
}

/// What a dispatch cycle did.
#[derive(Debug)]
pub struct DispatchReport {
    /// The cycle itself. Empty when there was no capacity — a normal
    /// outcome that tells the caller to wait, not an error.
    pub run: BatchRun,

    /// A refreshed budget snapshot, when the cycle produced one. Taken from
    /// response metadata when available, otherwise from a follow-up query,
    /// so the caller does not need a redundant round trip.
    pub budget: Option<BudgetSnapshot>,

    /// Set when some result means the session should stop.
    pub halt: Option<HaltSignal>,

    /// How many pages reached a final state this cycle.
    pub resolved: usize,

    /// True when the whole cycle was rejected and its pages were reverted
    /// to pending.
    pub reverted: bool,
}

/// Executes one bounded concurrent dispatch cycle at a time.
#[derive(Debug)]
pub struct BatchDispatcher {
    store: Arc<PageStore>,
    transport: Arc<dyn OcrTransport>,
    credential: Arc<Credential>,
    budget: RateBudget,
    model: String,
}

impl BatchDispatcher {
    /// Create a dispatcher.
    pub fn new(
        store: Arc<PageStore>,
        transport: Arc<dyn OcrTransport>,
        credential: Arc<Credential>,
        budget: RateBudget,
        model: String,
    ) -> Self {
        Self {
            store,
            transport,
            credential,
            budget,
            model,
        }
    }

    /// Run one dispatch cycle over `candidates`.
    ///
    /// `candidates` must be currently-pending page ids, lowest first; the
    /// first `min(len, max_batch_size, budget.available_slots)` of them are
    /// dispatched. Returns `Err` only for a systemic failure of the whole
    /// cycle, after reverting the affected pages to pending.
    #[instrument(level = "debug", skip_all, fields(candidates = candidates.len()))]
    pub async fn dispatch(
        &self,
        candidates: &[u32],
        max_batch_size: usize,
        budget: &BudgetSnapshot,
    ) -> Result<DispatchReport> {
        let started_at = Instant::now();
        let slots = usize::try_from(budget.available_slots).unwrap_or(usize::MAX);
        let effective = candidates.len().min(max_batch_size).min(slots);
        if effective == 0 {
            return Ok(DispatchReport {
                run: BatchRun {
                    page_ids: vec![],
                    started_at,
                    completed_at: Instant::now(),
                },
                budget: None,
                halt: None,
                resolved: 0,
                reverted: false,
            });
        }

        let selected = candidates[..effective].to_vec();
        let requests = selected
            .iter()
            .map(|&page_id| {
                let image = self
                    .store
                    .page_path(page_id)
                    .ok_or_else(|| anyhow!("page {page_id} is not registered"))?;
                Ok(OcrRequest { page_id, image })
            })
            .collect::<Result<Vec<_>>>()?;

        self.store.mark_in_flight(&selected);
        debug!("dispatching pages {:?} with model {}", selected, self.model);

        let reply = self
            .transport
            .ocr_batch(&requests, &self.model, self.credential.key())
            .await;

        match reply {
            Err(err) => {
                // Systemic failure: nothing produced a per-page result, so
                // the pages stay eligible instead of being marked failed.
                self.store.revert_to_pending(&selected);
                Err(err)
            }
            Ok(BatchReply::RateLimited {
                wait_seconds,
                available_slots,
            }) => {
                // The local snapshot said "ready" but the backend disagreed.
                // The backend wins; revert and let the caller wait.
                info!("batch rejected by rate limiter, retry in {wait_seconds}s");
                self.store.revert_to_pending(&selected);
                Ok(DispatchReport {
                    run: BatchRun {
                        page_ids: selected,
                        started_at,
                        completed_at: Instant::now(),
                    },
                    budget: Some(BudgetSnapshot::from_fields(
                        available_slots.unwrap_or(0),
                        wait_seconds.max(1),
                    )),
                    halt: None,
                    resolved: 0,
                    reverted: true,
                })
            }
            Ok(BatchReply::Completed(output)) => {
                debug!(
                    "batch finished: {} ok, {} failed",
                    output.succeeded, output.failed
                );
                let mut halt = None;
                let mut resolved = 0;
                for item in output.items {
                    let (outcome, item_halt) = self.outcome_for_reply(item.reply);
                    self.store.resolve(item.page_id, outcome);
                    resolved += 1;
                    halt = prefer_halt(halt, item_halt);
                }

                let refreshed = match &output.rate_status {
                    Some(status) => self.budget.interpret(status),
                    None => self.budget.query().await,
                };

                Ok(DispatchReport {
                    run: BatchRun {
                        page_ids: selected,
                        started_at,
                        completed_at: Instant::now(),
                    },
                    budget: Some(refreshed),
                    halt,
                    resolved,
                    reverted: false,
                })
            }
        }
    }

    /// Turn one page's reply into a store outcome, updating credential
    /// state and spotting session-fatal conditions along the way.
    fn outcome_for_reply(&self, reply: OcrReply) -> (PageOutcome, Option<HaltSignal>) {
        match reply {
            OcrReply::Success {
                transcript,
                model_used,
                processing_time_ms,
            } => {
                debug!("page transcribed by {model_used} in {processing_time_ms}ms");
                self.credential.mark_valid();
                (PageOutcome::Succeeded { transcript }, None)
            }
            OcrReply::RateLimited {
                wait_seconds,
                available_slots,
            } => (
                PageOutcome::Failed(ErrorKind::RateLimited {
                    wait_seconds,
                    available_slots: available_slots.unwrap_or(0),
                }),
                None,
            ),
            OcrReply::InvalidKey => {
                self.credential.mark_invalid();
                (
                    PageOutcome::Failed(ErrorKind::InvalidCredential),
                    Some(HaltSignal::InvalidCredential),
                )
            }
            OcrReply::Error { message } => {
                let kind = classify_message(&message);
                let halt = match kind {
                    ErrorKind::InvalidCredential => {
                        self.credential.mark_invalid();
                        Some(HaltSignal::InvalidCredential)
                    }
                    ErrorKind::QuotaExhausted => Some(HaltSignal::QuotaExhausted),
                    _ => None,
                };
                (PageOutcome::Failed(kind), halt)
            }
        }
    }
}

/// Merge halt signals from two results; a credential failure outranks a
/// quota failure.
fn prefer_halt(a: Option<HaltSignal>, b: Option<HaltSignal>) -> Option<HaltSignal> {
    match (a, b) {
        (Some(HaltSignal::InvalidCredential), _)
        | (_, Some(HaltSignal::InvalidCredential)) => Some(HaltSignal::InvalidCredential),
        (Some(halt), _) | (_, Some(halt)) => Some(halt),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        credential::{ApiKey, Validity},
        manifest::PageEntry,
        store::PageState,
        transport::{DEFAULT_MODEL, RateStatus, mock::MockTransport},
    };

    struct Fixture {
        store: Arc<PageStore>,
        transport: Arc<MockTransport>,
        credential: Arc<Credential>,
        dispatcher: BatchDispatcher,
    }

    fn fixture(page_ids: &[u32]) -> Fixture {
        let store = Arc::new(PageStore::with_pages(page_ids.iter().map(|&id| {
            PageEntry {
                id,
                path: PathBuf::from(format!("p{id}.png")),
            }
        })));
        let transport = Arc::new(MockTransport::always_ok());
        let credential = Arc::new(Credential::new(
            ApiKey::new("AIzaSyExample1234567890abcdef").unwrap(),
        ));
        let dispatcher = BatchDispatcher::new(
            store.clone(),
            transport.clone(),
            credential.clone(),
            RateBudget::new(transport.clone(), 5),
            DEFAULT_MODEL.to_owned(),
        );
        Fixture {
            store,
            transport,
            credential,
            dispatcher,
        }
    }

    fn ready_budget(slots: u64) -> BudgetSnapshot {
        BudgetSnapshot::from_fields(slots, 0)
    }

    #[tokio::test]
    async fn test_selection_is_lowest_id_first() {
        let f = fixture(&[3, 1, 4, 5]);
        let candidates = f.store.pending_ids();
        assert_eq!(candidates, vec![1, 3, 4, 5]);

        let report = f
            .dispatcher
            .dispatch(&candidates, 2, &ready_budget(10))
            .await
            .unwrap();
        assert_eq!(report.run.page_ids, vec![1, 3]);
        assert_eq!(f.transport.dispatch_log(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_capacity_clamp_never_exceeds_slots() {
        let f = fixture(&[1, 2, 3, 4]);
        let report = f
            .dispatcher
            .dispatch(&[1, 2, 3, 4], 4, &ready_budget(2))
            .await
            .unwrap();
        assert_eq!(report.run.page_ids, vec![1, 2]);
        assert_eq!(f.transport.dispatch_log().len(), 2);
        assert_eq!(f.store.pending_ids(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_an_empty_run() {
        let f = fixture(&[0, 1]);
        let report = f
            .dispatcher
            .dispatch(&[0, 1], 3, &ready_budget(0))
            .await
            .unwrap();
        assert!(report.run.is_empty());
        assert!(report.budget.is_none());
        assert!(f.transport.dispatch_log().is_empty());
        assert_eq!(f.store.pending_ids(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_per_page_failure_does_not_affect_others() {
        let f = fixture(&[0, 1, 2]);
        f.transport.script_page_error(1, "something odd happened");
        let report = f
            .dispatcher
            .dispatch(&[0, 1, 2], 3, &ready_budget(10))
            .await
            .unwrap();
        assert_eq!(report.resolved, 3);
        assert!(report.halt.is_none());
        assert_eq!(f.store.view(0).unwrap().status, PageState::Succeeded);
        assert_eq!(f.store.view(1).unwrap().status, PageState::Failed);
        assert_eq!(f.store.view(2).unwrap().status, PageState::Succeeded);
    }

    #[tokio::test]
    async fn test_systemic_failure_reverts_to_pending() {
        let f = fixture(&[0, 1]);
        f.transport.script_page_transport_error(0, "connection refused");
        f.transport.script_page_transport_error(1, "connection refused");
        let result = f.dispatcher.dispatch(&[0, 1], 2, &ready_budget(10)).await;
        assert!(result.is_err());
        // Both pages are eligible again, not failed.
        assert_eq!(f.store.pending_ids(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_envelope_rejection_reverts_and_reports_wait() {
        let f = fixture(&[0, 1]);
        for id in [0, 1] {
            f.transport.script_page_reply(
                id,
                OcrReply::RateLimited {
                    wait_seconds: 9,
                    available_slots: Some(0),
                },
            );
        }
        let report = f
            .dispatcher
            .dispatch(&[0, 1], 2, &ready_budget(10))
            .await
            .unwrap();
        assert!(report.reverted);
        assert_eq!(report.resolved, 0);
        let budget = report.budget.unwrap();
        assert!(!budget.ready);
        assert_eq!(budget.wait_seconds, 9);
        assert_eq!(f.store.pending_ids(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_invalid_key_halts_and_invalidates_credential() {
        let f = fixture(&[0, 1]);
        f.transport.script_page_reply(0, OcrReply::InvalidKey);
        let report = f
            .dispatcher
            .dispatch(&[0, 1], 2, &ready_budget(10))
            .await
            .unwrap();
        assert_eq!(report.halt, Some(HaltSignal::InvalidCredential));
        assert_eq!(f.credential.validity(), Validity::Invalid);
        assert_eq!(f.store.view(0).unwrap().status, PageState::Failed);
    }

    #[tokio::test]
    async fn test_quota_error_halts_without_touching_credential() {
        let f = fixture(&[0, 1]);
        f.transport
            .script_page_error(0, "QUOTA_EXCEEDED: daily limit reached");
        let report = f
            .dispatcher
            .dispatch(&[0, 1], 2, &ready_budget(10))
            .await
            .unwrap();
        assert_eq!(report.halt, Some(HaltSignal::QuotaExhausted));
        assert_ne!(f.credential.validity(), Validity::Invalid);
    }

    #[tokio::test]
    async fn test_successful_cycle_refreshes_budget() {
        let f = fixture(&[0]);
        f.transport.set_status_fallback(RateStatus {
            ready: false,
            wait_seconds: 4,
            available_slots: Some(0),
        });
        let report = f
            .dispatcher
            .dispatch(&[0], 1, &ready_budget(10))
            .await
            .unwrap();
        let budget = report.budget.unwrap();
        assert!(!budget.ready);
        assert_eq!(budget.wait_seconds, 4);
    }
}
