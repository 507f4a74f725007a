//! Scripted in-memory transport, for tests and offline smoke runs.
//!
//! Each page id gets a queue of scripted replies, consumed in order; once a
//! queue runs dry the transport falls back to a canned success. The
//! rate-status authority is scripted the same way. Call counters and a
//! dispatch log let tests assert on exactly what the control loop did.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;

use super::{
    DEFAULT_MODEL, KeyCheck, ModelCatalog, ModelInfo, OcrReply, OcrRequest,
    OcrTransport, RateStatus,
};
use crate::{credential::ApiKey, prelude::*};

/// One scripted response for a page.
#[derive(Clone, Debug)]
enum ScriptedReply {
    /// Return this reply.
    Reply(OcrReply),

    /// Fail at the transport level (connection refused, DNS, ...).
    TransportError(String),
}

#[derive(Debug, Default)]
struct MockState {
    /// Scripted statuses, consumed front to back.
    status_script: VecDeque<RateStatus>,

    /// Status returned once the script runs dry. `None` simulates a
    /// permanently unreachable status endpoint.
    status_fallback: Option<RateStatus>,

    /// Scripted replies per page id.
    page_scripts: HashMap<u32, VecDeque<ScriptedReply>>,

    /// Total `rate_status` calls.
    status_calls: usize,

    /// Page ids in the order `ocr_page` was called.
    dispatch_log: Vec<u32>,
}

/// A scripted [`OcrTransport`].
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// A transport that always reports a wide-open budget and transcribes
    /// every page successfully.
    pub fn always_ok() -> Self {
        let transport = Self::default();
        transport.set_status_fallback(RateStatus {
            ready: true,
            wait_seconds: 0,
            available_slots: Some(10),
        });
        transport
    }

    /// Set the status returned when the status script is empty. Passing a
    /// not-ready status here simulates a budget that never recovers.
    pub fn set_status_fallback(&self, status: RateStatus) {
        self.lock().status_fallback = Some(status);
    }

    /// Simulate an unreachable status endpoint once the script runs dry.
    pub fn set_status_outage(&self) {
        self.lock().status_fallback = None;
    }

    /// Queue a scripted status.
    pub fn push_status(&self, status: RateStatus) {
        self.lock().status_script.push_back(status);
    }

    /// Queue a scripted reply for a page.
    pub fn script_page_reply(&self, page_id: u32, reply: OcrReply) {
        self.lock()
            .page_scripts
            .entry(page_id)
            .or_default()
            .push_back(ScriptedReply::Reply(reply));
    }

    /// Queue a backend error string for a page.
    pub fn script_page_error(&self, page_id: u32, message: &str) {
        self.script_page_reply(
            page_id,
            OcrReply::Error {
                message: message.to_owned(),
            },
        );
    }

    /// Queue a transport-level failure for a page.
    pub fn script_page_transport_error(&self, page_id: u32, message: &str) {
        self.lock()
            .page_scripts
            .entry(page_id)
            .or_default()
            .push_back(ScriptedReply::TransportError(message.to_owned()));
    }

    /// How many times the status authority was queried.
    pub fn status_calls(&self) -> usize {
        self.lock().status_calls
    }

    /// Page ids in dispatch order.
    pub fn dispatch_log(&self) -> Vec<u32> {
        self.lock().dispatch_log.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl OcrTransport for MockTransport {
    async fn rate_status(&self) -> Result<RateStatus> {
        let mut state = self.lock();
        state.status_calls += 1;
        if let Some(status) = state.status_script.pop_front() {
            return Ok(status);
        }
        match &state.status_fallback {
            Some(status) => Ok(status.clone()),
            None => Err(anyhow!("status endpoint unreachable")),
        }
    }

    async fn models(&self) -> Result<ModelCatalog> {
        Ok(ModelCatalog {
            models: vec![ModelInfo {
                id: DEFAULT_MODEL.to_owned(),
                name: "Scripted model".to_owned(),
                description: "Canned transcripts for testing".to_owned(),
            }],
            default: DEFAULT_MODEL.to_owned(),
        })
    }

    async fn validate_key(&self, _key: &ApiKey) -> Result<KeyCheck> {
        Ok(KeyCheck {
            valid: true,
            message: "API key format is valid.".to_owned(),
        })
    }

    async fn ocr_page(
        &self,
        request: &OcrRequest,
        model: &str,
        _key: &ApiKey,
    ) -> Result<OcrReply> {
        let scripted = {
            let mut state = self.lock();
            state.dispatch_log.push(request.page_id);
            state
                .page_scripts
                .get_mut(&request.page_id)
                .and_then(|queue| queue.pop_front())
        };
        match scripted {
            Some(ScriptedReply::Reply(reply)) => Ok(reply),
            Some(ScriptedReply::TransportError(message)) => Err(anyhow!(message)),
            None => Ok(OcrReply::Success {
                transcript: format!("transcript for page {}", request.page_id),
                model_used: model.to_owned(),
                processing_time_ms: 1,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ApiKey {
        ApiKey::new("AIzaSyExample1234567890abcdef").unwrap()
    }

    #[tokio::test]
    async fn test_script_consumed_in_order_then_fallback() {
        let transport = MockTransport::always_ok();
        transport.script_page_error(3, "first call fails");
        let request = OcrRequest {
            page_id: 3,
            image: PathBuf::from("p3.png"),
        };

        let first = transport
            .ocr_page(&request, DEFAULT_MODEL, &key())
            .await
            .unwrap();
        assert!(matches!(first, OcrReply::Error { .. }));

        let second = transport
            .ocr_page(&request, DEFAULT_MODEL, &key())
            .await
            .unwrap();
        assert!(matches!(second, OcrReply::Success { .. }));

        assert_eq!(transport.dispatch_log(), vec![3, 3]);
    }

    #[tokio::test]
    async fn test_status_outage() {
        let transport = MockTransport::default();
        transport.set_status_outage();
        assert!(transport.rate_status().await.is_err());
        assert_eq!(transport.status_calls(), 1);
    }
}
