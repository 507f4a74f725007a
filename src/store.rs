//! Per-page outcome tracking.
//!
//! The store is the single source of truth for what has happened to each
//! page. Results of concurrent requests arrive asynchronously and
//! independently, so every mutation holds a sync lock just for an instant;
//! there is no multi-page transaction and none is needed.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use crate::{classify::ErrorKind, manifest::PageEntry, prelude::*};

/// Where one page is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    /// Registered, not yet dispatched.
    Pending,

    /// Included in a dispatch cycle whose result has not arrived.
    InFlight,

    /// Transcribed.
    Succeeded,

    /// The request for this page failed.
    Failed,
}

/// The final result of one page's request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageOutcome {
    /// A transcript was produced.
    Succeeded {
        /// The transcript text.
        transcript: String,
    },

    /// The request failed.
    Failed(ErrorKind),
}

/// Everything the store knows about one page.
#[derive(Clone, Debug)]
struct PageRecord {
    entry: PageEntry,
    state: PageState,
    transcript: Option<String>,
    error: Option<ErrorKind>,
    last_attempt_at: Option<Instant>,
}

impl PageRecord {
    fn new(entry: PageEntry) -> Self {
        Self {
            entry,
            state: PageState::Pending,
            transcript: None,
            error: None,
            last_attempt_at: None,
        }
    }
}

/// A read-only view of one page, for output and display.
#[derive(Clone, Debug, Serialize)]
pub struct PageView {
    /// Page id.
    pub id: u32,

    /// Page image path.
    pub path: PathBuf,

    /// Current state.
    pub status: PageState,

    /// Transcript text, present only when `Succeeded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,

    /// Failure reason, present only when `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counts of pages by state, for progress display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl PageCounts {
    /// Total registered pages.
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.succeeded + self.failed
    }

    /// Pages that have reached a final state.
    pub fn resolved(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Page ids in registration order. This ordering decides which pages are
    /// processed first and must stay stable.
    order: Vec<u32>,

    /// Records by page id.
    records: HashMap<u32, PageRecord>,
}

/// The task-outcome store.
#[derive(Debug, Default)]
pub struct PageStore {
    inner: Mutex<StoreInner>,
}

impl PageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store and register `entries` in order.
    pub fn with_pages(entries: impl IntoIterator<Item = PageEntry>) -> Self {
        let store = Self::new();
        for entry in entries {
            store.register(entry);
        }
        store
    }

    /// Register one page as `Pending`. Duplicate ids are ignored, keeping
    /// the first registration.
    pub fn register(&self, entry: PageEntry) {
        let mut inner = self.lock();
        if inner.records.contains_key(&entry.id) {
            debug!("ignoring duplicate registration of page {}", entry.id);
            return;
        }
        inner.order.push(entry.id);
        inner.records.insert(entry.id, PageRecord::new(entry));
    }

    /// Transition the listed pages from `Pending` to `InFlight`.
    ///
    /// Including a non-`Pending` page here is a dispatcher bug; in release
    /// builds the page is skipped with a warning rather than corrupted.
    pub fn mark_in_flight(&self, page_ids: &[u32]) {
        let now = Instant::now();
        let mut inner = self.lock();
        for &id in page_ids {
            let Some(record) = inner.records.get_mut(&id) else {
                debug_assert!(false, "unknown page {id}");
                warn!("cannot mark unknown page {id} in flight");
                continue;
            };
            if record.state != PageState::Pending {
                debug_assert!(false, "page {id} is not pending");
                warn!("cannot mark page {id} in flight from {:?}", record.state);
                continue;
            }
            record.state = PageState::InFlight;
            record.last_attempt_at = Some(now);
        }
    }

    /// Record the result of one page's request.
    ///
    /// Idempotent: a stale result overwrites the previous one (last write
    /// wins). Late results from a cancelled cycle still land here, so no
    /// work is silently lost.
    pub fn resolve(&self, page_id: u32, outcome: PageOutcome) {
        let mut inner = self.lock();
        let Some(record) = inner.records.get_mut(&page_id) else {
            warn!("dropping result for unknown page {page_id}");
            return;
        };
        if let Some(started) = record.last_attempt_at {
            debug!("page {page_id} resolved after {:?}", started.elapsed());
        }
        match outcome {
            PageOutcome::Succeeded { transcript } => {
                record.state = PageState::Succeeded;
                record.transcript = Some(transcript);
                record.error = None;
            }
            PageOutcome::Failed(kind) => {
                record.state = PageState::Failed;
                record.transcript = None;
                record.error = Some(kind);
            }
        }
    }

    /// Transition the listed pages from `InFlight` back to `Pending`, making
    /// them eligible for a later cycle. Used when a whole dispatch cycle
    /// failed before producing per-page results. Pages that have since
    /// resolved are left alone.
    pub fn revert_to_pending(&self, page_ids: &[u32]) {
        let mut inner = self.lock();
        for &id in page_ids {
            if let Some(record) = inner.records.get_mut(&id) {
                if record.state == PageState::InFlight {
                    record.state = PageState::Pending;
                }
            }
        }
    }

    /// Ids of all `Pending` pages, lowest page index first. Earlier pages
    /// are dispatched first; this ordering keeps cycle selection stable and
    /// deterministic regardless of how results arrive.
    pub fn pending_ids(&self) -> Vec<u32> {
        let inner = self.lock();
        let mut ids = inner
            .records
            .values()
            .filter(|r| r.state == PageState::Pending)
            .map(|r| r.entry.id)
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// True once no page is `Pending` or `InFlight`.
    pub fn is_complete(&self) -> bool {
        let inner = self.lock();
        inner
            .records
            .values()
            .all(|r| matches!(r.state, PageState::Succeeded | PageState::Failed))
    }

    /// Is this page currently `Pending`?
    pub fn is_pending(&self, page_id: u32) -> bool {
        self.lock()
            .records
            .get(&page_id)
            .is_some_and(|r| r.state == PageState::Pending)
    }

    /// The image path for a page.
    pub fn page_path(&self, page_id: u32) -> Option<PathBuf> {
        self.lock()
            .records
            .get(&page_id)
            .map(|r| r.entry.path.clone())
    }

    /// Counts of pages by state.
    pub fn counts(&self) -> PageCounts {
        let inner = self.lock();
        let mut counts = PageCounts::default();
        for record in inner.records.values() {
            match record.state {
                PageState::Pending => counts.pending += 1,
                PageState::InFlight => counts.in_flight += 1,
                PageState::Succeeded => counts.succeeded += 1,
                PageState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// A view of one page.
    pub fn view(&self, page_id: u32) -> Option<PageView> {
        let inner = self.lock();
        inner.records.get(&page_id).map(Self::view_record)
    }

    /// Views of all pages, in registration order.
    pub fn views(&self) -> Vec<PageView> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id))
            .map(Self::view_record)
            .collect()
    }

    /// Assemble the transcripts of all succeeded pages into one document,
    /// with `page_N` separators, in page-id order.
    pub fn combined_transcript(&self) -> String {
        let inner = self.lock();
        let mut ids = inner
            .records
            .values()
            .filter(|r| r.state == PageState::Succeeded)
            .map(|r| r.entry.id)
            .collect::<Vec<_>>();
        ids.sort_unstable();

        ids.iter()
            .filter_map(|id| inner.records.get(id))
            .map(|record| {
                format!(
                    "page_{}\n{}\n{}",
                    record.entry.id,
                    "─".repeat(20),
                    record.transcript.as_deref().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn view_record(record: &PageRecord) -> PageView {
        PageView {
            id: record.entry.id,
            path: record.entry.path.clone(),
            status: record.state,
            transcript: record.transcript.clone(),
            error: record.error.as_ref().map(|e| e.to_string()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // Hold the sync lock just for an instant; never across an await.
        self.inner.lock().expect("lock poisoned")
    }
}
