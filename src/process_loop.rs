//! The auto-processing control loop.
//!
//! One logical loop per session walks the pending set: consult the rate
//! budget, dispatch a bounded cycle, merge results, repeat. While the budget
//! is exhausted it polls on a fixed interval; a bounded number of fruitless
//! polls is read as a long-horizon (daily) limit rather than a short
//! cooldown, and the loop halts instead of polling forever.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::time::sleep;

use crate::{
    budget::{BudgetSnapshot, RateBudget},
    credential::{Credential, Validity},
    dispatch::{BatchDispatcher, HaltSignal},
    prelude::*,
    store::{PageStore, PageView},
    transport::{DEFAULT_MODEL, OcrTransport},
};

/// Why the loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Every page reached a final state.
    Completed,

    /// The user disabled auto-processing.
    UserCancelled,

    /// The key was explicitly rejected. The user must re-enter or re-verify
    /// it before retrying.
    InvalidCredential,

    /// A long-horizon quota is exhausted, or the budget never recovered
    /// within the poll-retry bound.
    DailyLimitReached,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::UserCancelled => write!(f, "cancelled by user"),
            StopReason::InvalidCredential => write!(f, "invalid API key"),
            StopReason::DailyLimitReached => write!(f, "daily limit reached"),
        }
    }
}

/// Where the loop is right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Not yet started.
    Idle,

    /// A dispatch cycle is running.
    Dispatching,

    /// Out of capacity; polling the budget.
    Waiting,

    /// Halted.
    Stopped(StopReason),
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Idle => write!(f, "idle"),
            LoopState::Dispatching => write!(f, "dispatching"),
            LoopState::Waiting => write!(f, "waiting for capacity"),
            LoopState::Stopped(reason) => write!(f, "stopped: {reason}"),
        }
    }
}

/// Loop tuning knobs.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Most pages per dispatch cycle.
    pub max_batch_size: usize,

    /// Delay between budget polls while waiting for capacity.
    pub poll_interval: Duration,

    /// Fruitless polls to attempt before concluding a long-horizon limit.
    pub poll_retry_limit: u32,

    /// Pause between consecutive dispatch cycles. A debounce against tight
    /// re-trigger loops, not a rate-limit wait.
    pub settle_delay: Duration,

    /// Slots to assume when the status authority is unreachable.
    pub fail_open_slots: u64,

    /// Model to request.
    pub model: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 3,
            poll_interval: Duration::from_secs(2),
            poll_retry_limit: 30,
            settle_delay: Duration::from_millis(500),
            fail_open_slots: 5,
            model: DEFAULT_MODEL.to_owned(),
        }
    }
}

/// What happened while waiting for capacity.
enum WaitOutcome {
    /// Capacity came back.
    Ready(BudgetSnapshot),

    /// The user disabled auto-processing.
    Cancelled,

    /// The poll-retry bound was reached without capacity returning.
    RetriesExhausted,
}

/// Drives pages through the OCR backend until done, cancelled, or halted.
#[derive(Debug)]
pub struct AutoProcessor {
    store: Arc<PageStore>,
    credential: Arc<Credential>,
    dispatcher: BatchDispatcher,
    budget: RateBudget,
    config: LoopConfig,

    /// Is auto-processing enabled? Cleared by [`AutoProcessor::disable`].
    enabled: AtomicBool,

    /// Guards against overlapping dispatch cycles. Exactly one cycle may be
    /// in flight, whichever path (loop or manual) started it.
    run_guard: AtomicBool,

    /// Serializes concurrent `run` callers into a single logical loop.
    run_lock: tokio::sync::Mutex<()>,

    state: Mutex<LoopState>,
    last_error: Mutex<Option<String>>,

    /// Monotonic: set on the first quota-exhaustion signal, never cleared
    /// within a session.
    daily_limit: AtomicBool,
}

impl AutoProcessor {
    /// Create a processor over `store`, talking through `transport`.
    pub fn new(
        store: Arc<PageStore>,
        transport: Arc<dyn OcrTransport>,
        credential: Arc<Credential>,
        config: LoopConfig,
    ) -> Self {
        let budget = RateBudget::new(transport.clone(), config.fail_open_slots);
        let dispatcher = BatchDispatcher::new(
            store.clone(),
            transport,
            credential.clone(),
            budget.clone(),
            config.model.clone(),
        );
        Self {
            store,
            credential,
            dispatcher,
            budget,
            config,
            enabled: AtomicBool::new(false),
            run_guard: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(LoopState::Idle),
            last_error: Mutex::new(None),
            daily_limit: AtomicBool::new(false),
        }
    }

    /// The page store this processor works over.
    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    /// Current loop state.
    pub fn state(&self) -> LoopState {
        *self.state.lock().expect("lock poisoned")
    }

    /// The most recent session-level error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("lock poisoned").clone()
    }

    /// Has a quota-exhaustion signal been seen this session?
    pub fn daily_limit_reached(&self) -> bool {
        self.daily_limit.load(Ordering::SeqCst)
    }

    /// Disable auto-processing.
    ///
    /// Takes effect at the loop's next check; no further cycles are
    /// dispatched. Requests already on the wire are not aborted, and their
    /// results still merge into the store when they arrive. Bookkeeping
    /// flags are cleared here so a later enable starts clean.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.run_guard.store(false, Ordering::SeqCst);
    }

    /// Enable auto-processing and drive it until it stops.
    ///
    /// Concurrent callers share one logical loop: later callers wait for
    /// the current one, then observe completion instead of re-dispatching.
    pub async fn run(&self) -> StopReason {
        self.enabled.store(true, Ordering::SeqCst);
        let _serialize = self.run_lock.lock().await;
        let reason = self.drive().await;
        self.set_state(LoopState::Stopped(reason));
        match reason {
            StopReason::Completed | StopReason::UserCancelled => {}
            StopReason::InvalidCredential | StopReason::DailyLimitReached => {
                self.set_last_error(reason.to_string());
            }
        }
        if reason == StopReason::DailyLimitReached {
            self.daily_limit.store(true, Ordering::SeqCst);
        }
        info!("auto-processing stopped: {reason}");
        reason
    }

    /// Process one page outside the loop.
    ///
    /// Gated by the same budget check as the loop, and by the same
    /// one-cycle-at-a-time guard. The page must currently be pending.
    pub async fn process_one(&self, page_id: u32) -> Result<PageView> {
        if !self.store.is_pending(page_id) {
            return Err(anyhow!("page {page_id} is not pending"));
        }

        let snapshot = self.budget.query().await;
        if !snapshot.ready {
            return Err(anyhow!(
                "rate budget exhausted; retry in {}s",
                snapshot.wait_seconds.max(1)
            ));
        }

        if self
            .run_guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(anyhow!("another dispatch cycle is in flight"));
        }
        let result = self.dispatcher.dispatch(&[page_id], 1, &snapshot).await;
        self.run_guard.store(false, Ordering::SeqCst);

        let report = result?;
        if let Some(halt) = report.halt {
            match halt {
                HaltSignal::InvalidCredential => {
                    self.set_last_error(StopReason::InvalidCredential.to_string());
                }
                HaltSignal::QuotaExhausted => {
                    self.daily_limit.store(true, Ordering::SeqCst);
                    self.set_last_error(StopReason::DailyLimitReached.to_string());
                }
            }
        }
        self.store
            .view(page_id)
            .ok_or_else(|| anyhow!("page {page_id} disappeared from the store"))
    }

    /// The loop body. Returns why it stopped.
    async fn drive(&self) -> StopReason {
        loop {
            if !self.enabled.load(Ordering::SeqCst) {
                return StopReason::UserCancelled;
            }
            if self.credential.validity() == Validity::Invalid {
                return StopReason::InvalidCredential;
            }
            if self.daily_limit.load(Ordering::SeqCst) {
                return StopReason::DailyLimitReached;
            }
            if self.store.is_complete() {
                return StopReason::Completed;
            }

            let mut snapshot = self.budget.query().await;
            if !snapshot.ready {
                match self.wait_for_capacity().await {
                    WaitOutcome::Ready(ready_snapshot) => snapshot = ready_snapshot,
                    WaitOutcome::Cancelled => return StopReason::UserCancelled,
                    WaitOutcome::RetriesExhausted => return StopReason::DailyLimitReached,
                }
            }

            // Exactly one cycle in flight. A lost race here means a manual
            // dispatch is running; settle and re-evaluate.
            if self
                .run_guard
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                sleep(self.config.settle_delay).await;
                continue;
            }
            self.set_state(LoopState::Dispatching);
            let pending = self.store.pending_ids();
            let result = self
                .dispatcher
                .dispatch(&pending, self.config.max_batch_size, &snapshot)
                .await;
            self.run_guard.store(false, Ordering::SeqCst);

            match result {
                Err(err) => {
                    // Systemic failure; the pages were reverted. Pause one
                    // settle interval and let a fresh budget query decide.
                    warn!("dispatch cycle failed: {err:#}");
                    self.set_last_error(format!("{err:#}"));
                    sleep(self.config.settle_delay).await;
                }
                Ok(report) => {
                    if let Some(halt) = report.halt {
                        return match halt {
                            HaltSignal::InvalidCredential => StopReason::InvalidCredential,
                            HaltSignal::QuotaExhausted => StopReason::DailyLimitReached,
                        };
                    }
                    if report.run.is_empty() {
                        // No capacity after all; go straight back to a
                        // fresh budget query, which will put us in Waiting.
                        continue;
                    }
                    if report.reverted {
                        debug!("cycle rejected upstream; pages reverted for retry");
                    }
                    debug!(
                        "cycle of {} page(s) took {:?}, resolved {}, {} still pending",
                        report.run.page_ids.len(),
                        report.run.completed_at.duration_since(report.run.started_at),
                        report.resolved,
                        self.store.counts().pending,
                    );
                    // Debounce before the next cycle.
                    sleep(self.config.settle_delay).await;
                }
            }
        }
    }

    /// Poll the budget until capacity returns, the user cancels, or the
    /// retry bound is reached.
    async fn wait_for_capacity(&self) -> WaitOutcome {
        self.set_state(LoopState::Waiting);
        for poll in 0..self.config.poll_retry_limit {
            if !self.enabled.load(Ordering::SeqCst) {
                return WaitOutcome::Cancelled;
            }
            sleep(self.config.poll_interval).await;
            let snapshot = self.budget.query().await;
            if snapshot.ready {
                debug!("capacity returned after {} poll(s)", poll + 1);
                return WaitOutcome::Ready(snapshot);
            }
        }
        WaitOutcome::RetriesExhausted
    }

    fn set_state(&self, state: LoopState) {
        *self.state.lock().expect("lock poisoned") = state;
    }

    fn set_last_error(&self, message: String) {
        *self.last_error.lock().expect("lock poisoned") = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        credential::ApiKey,
        manifest::PageEntry,
        store::PageState,
        transport::{OcrReply, RateStatus, mock::MockTransport},
    };

    /// Millisecond-scale config so tests run fast. Counts and bounds match
    /// the defaults' semantics exactly.
    fn test_config() -> LoopConfig {
        LoopConfig {
            max_batch_size: 2,
            poll_interval: Duration::from_millis(1),
            poll_retry_limit: 30,
            settle_delay: Duration::from_millis(1),
            fail_open_slots: 5,
            ..LoopConfig::default()
        }
    }

    fn processor_with(
        page_ids: &[u32],
        transport: Arc<MockTransport>,
        config: LoopConfig,
    ) -> Arc<AutoProcessor> {
        let store = Arc::new(PageStore::with_pages(page_ids.iter().map(|&id| {
            PageEntry {
                id,
                path: PathBuf::from(format!("p{id}.png")),
            }
        })));
        let credential = Arc::new(Credential::new(
            ApiKey::new("AIzaSyExample1234567890abcdef").unwrap(),
        ));
        Arc::new(AutoProcessor::new(store, transport, credential, config))
    }

    fn not_ready() -> RateStatus {
        RateStatus {
            ready: false,
            wait_seconds: 2,
            available_slots: Some(0),
        }
    }

    #[tokio::test]
    async fn test_runs_to_completion_in_id_order() {
        let transport = Arc::new(MockTransport::always_ok());
        let processor = processor_with(&[0, 1, 2, 3, 4], transport.clone(), test_config());

        let reason = processor.run().await;
        assert_eq!(reason, StopReason::Completed);
        assert_eq!(processor.state(), LoopState::Stopped(StopReason::Completed));
        assert_eq!(transport.dispatch_log(), vec![0, 1, 2, 3, 4]);
        let counts = processor.store().counts();
        assert_eq!(counts.succeeded, 5);
        assert!(processor.store().is_complete());
    }

    #[tokio::test]
    async fn test_reenable_after_completion_is_a_no_op() {
        let transport = Arc::new(MockTransport::always_ok());
        let processor = processor_with(&[0, 1], transport.clone(), test_config());

        assert_eq!(processor.run().await, StopReason::Completed);
        let calls_after_first = transport.dispatch_log().len();

        // Enabling again performs zero dispatch cycles.
        assert_eq!(processor.run().await, StopReason::Completed);
        assert_eq!(transport.dispatch_log().len(), calls_after_first);
    }

    #[tokio::test]
    async fn test_overlapping_triggers_dispatch_each_page_once() {
        let transport = Arc::new(MockTransport::always_ok());
        let processor = processor_with(&[0, 1, 2], transport.clone(), test_config());

        let (a, b) = tokio::join!(processor.run(), processor.run());
        assert_eq!(a, StopReason::Completed);
        assert_eq!(b, StopReason::Completed);

        let mut log = transport.dispatch_log();
        log.sort_unstable();
        assert_eq!(log, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_invalid_key_halts_loop() {
        let transport = Arc::new(MockTransport::always_ok());
        transport.script_page_reply(0, OcrReply::InvalidKey);
        let processor = processor_with(&[0, 1, 2], transport, test_config());

        let reason = processor.run().await;
        assert_eq!(reason, StopReason::InvalidCredential);
        assert!(!processor.daily_limit_reached());
        assert_eq!(processor.last_error().unwrap(), "invalid API key");

        // Halted permanently: re-running dispatches nothing further.
        let store = processor.store().clone();
        let pending_before = store.pending_ids();
        assert_eq!(processor.run().await, StopReason::InvalidCredential);
        assert_eq!(store.pending_ids(), pending_before);
    }

    #[tokio::test]
    async fn test_quota_error_halts_without_invalidating_credential() {
        let transport = Arc::new(MockTransport::always_ok());
        transport.script_page_error(0, "error: RESOURCE_EXHAUSTED for model");
        let processor = processor_with(&[0, 1], transport, test_config());

        let reason = processor.run().await;
        assert_eq!(reason, StopReason::DailyLimitReached);
        assert!(processor.daily_limit_reached());
        // Quota exhaustion must not flip credential validity.
        assert_ne!(
            crate::credential::Validity::Invalid,
            processor.credential.validity()
        );
    }

    #[tokio::test]
    async fn test_poll_retry_bound_stops_loop() {
        let transport = Arc::new(MockTransport::default());
        transport.set_status_fallback(not_ready());
        let mut config = test_config();
        config.poll_retry_limit = 30;
        let processor = processor_with(&[0], transport.clone(), config);

        let reason = processor.run().await;
        assert_eq!(reason, StopReason::DailyLimitReached);
        assert!(processor.daily_limit_reached());
        // One initial consult plus exactly the configured poll bound.
        assert_eq!(transport.status_calls(), 31);
        // No page was dispatched, and none was lost: the page is still
        // visibly pending with the loop stopped.
        assert!(transport.dispatch_log().is_empty());
        assert_eq!(processor.store().pending_ids(), vec![0]);
    }

    #[tokio::test]
    async fn test_waiting_recovers_when_capacity_returns() {
        let transport = Arc::new(MockTransport::always_ok());
        // Two unready statuses, then the ready fallback takes over.
        transport.push_status(not_ready());
        transport.push_status(not_ready());
        let processor = processor_with(&[0, 1], transport.clone(), test_config());

        let reason = processor.run().await;
        assert_eq!(reason, StopReason::Completed);
        assert_eq!(processor.store().counts().succeeded, 2);
    }

    #[tokio::test]
    async fn test_transient_page_failure_does_not_halt() {
        let transport = Arc::new(MockTransport::always_ok());
        transport.script_page_error(1, "model produced garbage");
        let processor = processor_with(&[0, 1, 2], transport, test_config());

        let reason = processor.run().await;
        assert_eq!(reason, StopReason::Completed);
        let store = processor.store();
        assert_eq!(store.view(0).unwrap().status, PageState::Succeeded);
        assert_eq!(store.view(1).unwrap().status, PageState::Failed);
        assert_eq!(store.view(2).unwrap().status, PageState::Succeeded);
    }

    #[tokio::test]
    async fn test_systemic_failure_retries_reverted_pages() {
        let transport = Arc::new(MockTransport::always_ok());
        transport.script_page_transport_error(0, "connection refused");
        transport.script_page_transport_error(1, "connection refused");
        let processor = processor_with(&[0, 1], transport.clone(), test_config());

        let reason = processor.run().await;
        assert_eq!(reason, StopReason::Completed);
        // Both pages were dispatched twice: the failed cycle, then the retry.
        assert_eq!(transport.dispatch_log(), vec![0, 1, 0, 1]);
        assert_eq!(processor.store().counts().succeeded, 2);
    }

    #[tokio::test]
    async fn test_disable_stops_loop_while_waiting() {
        let transport = Arc::new(MockTransport::default());
        transport.set_status_fallback(not_ready());
        let mut config = test_config();
        config.poll_interval = Duration::from_millis(5);
        config.poll_retry_limit = 10_000;
        let processor = processor_with(&[0], transport.clone(), config);

        let handle = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        processor.disable();
        let reason = handle.await.unwrap();
        assert_eq!(reason, StopReason::UserCancelled);
        assert!(transport.dispatch_log().is_empty());
        // The page remains pending: visibly incomplete, not falsely done.
        assert_eq!(processor.store().pending_ids(), vec![0]);
    }

    #[tokio::test]
    async fn test_process_one_is_gated_by_budget() {
        let transport = Arc::new(MockTransport::default());
        transport.set_status_fallback(not_ready());
        let processor = processor_with(&[0], transport.clone(), test_config());

        let err = processor.process_one(0).await.unwrap_err();
        assert!(err.to_string().contains("rate budget exhausted"));
        assert!(transport.dispatch_log().is_empty());
        assert!(processor.store().is_pending(0));
    }

    #[tokio::test]
    async fn test_process_one_success_and_non_pending_rejection() {
        let transport = Arc::new(MockTransport::always_ok());
        let processor = processor_with(&[0, 1], transport, test_config());

        let view = processor.process_one(0).await.unwrap();
        assert_eq!(view.status, PageState::Succeeded);
        assert_eq!(view.transcript.as_deref(), Some("transcript for page 0"));

        // Already resolved; not eligible again.
        let err = processor.process_one(0).await.unwrap_err();
        assert!(err.to_string().contains("not pending"));
    }
}
