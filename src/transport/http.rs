//! HTTP transport for the reference OCR gateway.
//!
//! Wire format notes: the gateway authenticates with an `X-Gemini-API-Key`
//! header, takes page images as base64 `data:` URLs in a JSON body (the JSON
//! endpoint avoids multipart size limits), and reports rate limiting as a 429
//! whose `detail` object carries `wait_seconds`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{KeyCheck, ModelCatalog, OcrReply, OcrRequest, OcrTransport, RateStatus};
use crate::{credential::ApiKey, data_url::page_data_url, prelude::*};

/// Header carrying the API key.
const API_KEY_HEADER: &str = "X-Gemini-API-Key";

/// How long to wait when a 429 arrives without a usable `wait_seconds`. This
/// matches the reference gateway's fixed request interval.
const FALLBACK_WAIT_SECONDS: u64 = 12;

/// Overall per-request timeout. OCR of a dense page can take a while.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Body of a single-page OCR request.
#[derive(Debug, Serialize)]
struct OcrRequestWire<'a> {
    /// Base64 data URL of the page image.
    image_data: String,

    /// Model to use.
    model: &'a str,
}

/// Body of a successful (HTTP 200) OCR response. The gateway reports
/// model-level failures with `success: false` and an error string.
#[derive(Debug, Deserialize)]
struct OcrResponseWire {
    success: bool,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    error: Option<String>,
    model_used: String,
    #[serde(default)]
    processing_time_ms: u64,
}

/// The `detail` payload of a 429 rejection.
#[derive(Debug, Default, Deserialize)]
struct RateLimitDetailWire {
    #[serde(default)]
    wait_seconds: Option<u64>,
    #[serde(default)]
    available_slots: Option<u64>,
}

/// Error envelope used by the gateway (`{"detail": ...}`), where `detail` is
/// either a string or a structured object.
#[derive(Debug, Deserialize)]
struct ErrorEnvelopeWire {
    #[serde(default)]
    detail: Value,
}

/// An [`OcrTransport`] that talks to the reference gateway over HTTP.
#[derive(Debug)]
pub struct HttpTransport {
    /// Base URL, e.g. `http://localhost:8000`.
    base_url: String,

    /// Shared HTTP client.
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport for the gateway at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    /// Build a full endpoint URL.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Pull `wait_seconds`/`available_slots` out of a 429 response body.
    async fn parse_rate_limit(response: reqwest::Response) -> OcrReply {
        let detail = match response.json::<ErrorEnvelopeWire>().await {
            Ok(envelope) => {
                serde_json::from_value::<RateLimitDetailWire>(envelope.detail)
                    .unwrap_or_default()
            }
            Err(_) => RateLimitDetailWire::default(),
        };
        OcrReply::RateLimited {
            wait_seconds: detail.wait_seconds.unwrap_or(FALLBACK_WAIT_SECONDS),
            available_slots: detail.available_slots,
        }
    }

    /// Extract a display message from an error envelope body.
    async fn error_message(response: reqwest::Response) -> String {
        let status = response.status();
        match response.json::<ErrorEnvelopeWire>().await {
            Ok(envelope) => match envelope.detail {
                Value::String(message) => message,
                Value::Null => format!("HTTP {status}"),
                other => other.to_string(),
            },
            Err(_) => format!("HTTP {status}"),
        }
    }
}

#[async_trait]
impl OcrTransport for HttpTransport {
    async fn rate_status(&self) -> Result<RateStatus> {
        let response = self
            .client
            .get(self.url("/api/rate-limit-status"))
            .send()
            .await
            .context("rate-status request failed")?;
        response
            .error_for_status()
            .context("rate-status request rejected")?
            .json::<RateStatus>()
            .await
            .context("failed to parse rate status")
    }

    async fn models(&self) -> Result<ModelCatalog> {
        let response = self
            .client
            .get(self.url("/api/models"))
            .send()
            .await
            .context("model catalog request failed")?;
        response
            .error_for_status()
            .context("model catalog request rejected")?
            .json::<ModelCatalog>()
            .await
            .context("failed to parse model catalog")
    }

    async fn validate_key(&self, key: &ApiKey) -> Result<KeyCheck> {
        let response = self
            .client
            .post(self.url("/api/validate-key"))
            .header(API_KEY_HEADER, key.expose())
            .send()
            .await
            .context("key validation request failed")?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(KeyCheck {
                valid: false,
                message: Self::error_message(response).await,
            });
        }
        response
            .error_for_status()
            .context("key validation request rejected")?
            .json::<KeyCheck>()
            .await
            .context("failed to parse key validation response")
    }

    #[instrument(level = "debug", skip_all, fields(page = %request.page_id))]
    async fn ocr_page(
        &self,
        request: &OcrRequest,
        model: &str,
        key: &ApiKey,
    ) -> Result<OcrReply> {
        let image_data = page_data_url(&request.image).await?;
        let body = OcrRequestWire { image_data, model };

        let response = self
            .client
            .post(self.url("/api/gemini-ocr-json"))
            .header(API_KEY_HEADER, key.expose())
            .json(&body)
            .send()
            .await
            .context("OCR request failed")?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Ok(Self::parse_rate_limit(response).await),
            StatusCode::UNAUTHORIZED => Ok(OcrReply::InvalidKey),
            status if status.is_success() => {
                let wire = response
                    .json::<OcrResponseWire>()
                    .await
                    .context("failed to parse OCR response")?;
                if wire.success {
                    Ok(OcrReply::Success {
                        transcript: wire.transcript.unwrap_or_default(),
                        model_used: wire.model_used,
                        processing_time_ms: wire.processing_time_ms,
                    })
                } else {
                    Ok(OcrReply::Error {
                        message: wire
                            .error
                            .unwrap_or_else(|| "unspecified OCR failure".to_owned()),
                    })
                }
            }
            _ => Ok(OcrReply::Error {
                message: Self::error_message(response).await,
            }),
        }
    }
}
