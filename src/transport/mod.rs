//! OCR backend transports.
//!
//! The control loop talks to the backend through [`OcrTransport`], which
//! mirrors the reference gateway's HTTP surface: a rate-status authority, a
//! single-page OCR endpoint, key validation and a model catalog. Keeping this
//! behind a trait lets the tests drive the loop with scripted responses.

use std::fmt;

use async_trait::async_trait;
use futures::future::join_all;

use crate::{credential::ApiKey, prelude::*};

pub mod http;
pub mod mock;

/// The model used when the caller does not pick one.
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";

/// A snapshot from the rate-status authority.
///
/// This is advisory data: it is refreshed by polling and is never assumed
/// authoritative between polls. The dispatcher still has to handle a
/// rejection from the OCR endpoint even when the last status said "ready".
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RateStatus {
    /// May we dispatch right now?
    pub ready: bool,

    /// Seconds until the next request is allowed.
    #[serde(default)]
    pub wait_seconds: u64,

    /// Request slots currently available. Older gateways omit this field.
    #[serde(default)]
    pub available_slots: Option<u64>,
}

/// One page we want transcribed.
#[derive(Clone, Debug)]
pub struct OcrRequest {
    /// Stable page index, echoed back with the reply.
    pub page_id: u32,

    /// Where the page image lives.
    pub image: PathBuf,
}

/// The backend's verdict on one page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OcrReply {
    /// The page was transcribed.
    Success {
        /// The transcript text.
        transcript: String,
        /// The model that produced it.
        model_used: String,
        /// Backend-side processing time.
        processing_time_ms: u64,
    },

    /// The request was rejected at the envelope level with a 429.
    RateLimited {
        /// Seconds the backend asked us to wait.
        wait_seconds: u64,
        /// Slots the backend reported as available, if it said.
        available_slots: Option<u64>,
    },

    /// The key was explicitly rejected with a 401-equivalent.
    InvalidKey,

    /// The request failed for some other reason. The message gets run
    /// through the error classifier; quota exhaustion often hides here.
    Error {
        /// The raw error message.
        message: String,
    },
}

/// One page's reply within a batch.
#[derive(Clone, Debug)]
pub struct BatchItemReply {
    /// The page this reply belongs to.
    pub page_id: u32,

    /// What the backend said.
    pub reply: OcrReply,
}

/// Results of a completed batch call.
#[derive(Clone, Debug)]
pub struct BatchOutput {
    /// Per-page replies, in request order.
    pub items: Vec<BatchItemReply>,

    /// How many pages succeeded.
    pub succeeded: usize,

    /// How many pages did not.
    pub failed: usize,

    /// Rate-status metadata piggybacked on the response, when present. Saves
    /// the caller a follow-up status query.
    pub rate_status: Option<RateStatus>,
}

/// Outcome of a batch call.
#[derive(Clone, Debug)]
pub enum BatchReply {
    /// The batch ran; individual pages may still have failed.
    Completed(BatchOutput),

    /// The whole batch was rejected with a 429 before any page was
    /// processed.
    RateLimited {
        /// Seconds the backend asked us to wait.
        wait_seconds: u64,
        /// Slots the backend reported as available, if it said.
        available_slots: Option<u64>,
    },
}

/// Result of a key pre-flight check.
#[derive(Clone, Debug, Deserialize)]
pub struct KeyCheck {
    /// Did the key pass the format check?
    pub valid: bool,

    /// Human-readable explanation.
    #[serde(default)]
    pub message: String,
}

/// One OCR model the backend offers.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelInfo {
    /// Model identifier, as passed in requests.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Short description.
    #[serde(default)]
    pub description: String,
}

/// The backend's model catalog.
#[derive(Clone, Debug, Deserialize)]
pub struct ModelCatalog {
    /// Available models.
    pub models: Vec<ModelInfo>,

    /// The backend's default model id.
    pub default: String,
}

impl ModelCatalog {
    /// Does the catalog offer this model?
    pub fn contains(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m.id == model_id)
    }
}

/// Interface trait for OCR backends.
#[async_trait]
pub trait OcrTransport: fmt::Debug + Send + Sync + 'static {
    /// Query the rate-status authority. Callers must poll this; it is never
    /// cached indefinitely.
    async fn rate_status(&self) -> Result<RateStatus>;

    /// Fetch the model catalog.
    async fn models(&self) -> Result<ModelCatalog>;

    /// Pre-flight check of a key's format. This does not spend quota; real
    /// validation happens on the first OCR call.
    async fn validate_key(&self, key: &ApiKey) -> Result<KeyCheck>;

    /// Transcribe one page.
    async fn ocr_page(
        &self,
        request: &OcrRequest,
        model: &str,
        key: &ApiKey,
    ) -> Result<OcrReply>;

    /// Transcribe a batch of pages.
    ///
    /// The default implementation fans out one concurrent [`ocr_page`] call
    /// per page and demultiplexes the results, which is the right shape for
    /// gateways (like the reference backend) that only expose a single-page
    /// endpoint. Transports with a native batch endpoint can override this.
    ///
    /// Returns `Err` only when the backend was unreachable for the whole
    /// batch; individual page failures appear as per-item replies.
    ///
    /// [`ocr_page`]: OcrTransport::ocr_page
    async fn ocr_batch(
        &self,
        requests: &[OcrRequest],
        model: &str,
        key: &ApiKey,
    ) -> Result<BatchReply> {
        let results = join_all(
            requests
                .iter()
                .map(|request| self.ocr_page(request, model, key)),
        )
        .await;

        // If the backend was unreachable for every page, report that as a
        // batch-level failure so the caller can revert and retry later.
        if !results.is_empty() && results.iter().all(|r| r.is_err()) {
            let first = results
                .into_iter()
                .next()
                .expect("checked non-empty")
                .expect_err("checked all errors");
            return Err(first.context("OCR backend unreachable for entire batch"));
        }

        let items = requests
            .iter()
            .zip(results)
            .map(|(request, result)| BatchItemReply {
                page_id: request.page_id,
                reply: match result {
                    Ok(reply) => reply,
                    Err(err) => OcrReply::Error {
                        message: format!("{:#}", err),
                    },
                },
            })
            .collect::<Vec<_>>();

        // An envelope-level 429 from a fanned-out batch shows up as every
        // page being rejected identically.
        if !items.is_empty()
            && items
                .iter()
                .all(|item| matches!(item.reply, OcrReply::RateLimited { .. }))
        {
            let mut wait_seconds = 0;
            let mut available_slots: Option<u64> = None;
            for item in &items {
                if let OcrReply::RateLimited {
                    wait_seconds: wait,
                    available_slots: slots,
                } = &item.reply
                {
                    wait_seconds = wait_seconds.max(*wait);
                    available_slots = match (available_slots, *slots) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
            }
            return Ok(BatchReply::RateLimited {
                wait_seconds,
                available_slots,
            });
        }

        let succeeded = items
            .iter()
            .filter(|item| matches!(item.reply, OcrReply::Success { .. }))
            .count();
        let failed = items.len() - succeeded;
        Ok(BatchReply::Completed(BatchOutput {
            items,
            succeeded,
            failed,
            rate_status: None,
        }))
    }
}
