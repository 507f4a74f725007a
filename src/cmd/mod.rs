//! Command-line entry points.

use std::{sync::Arc, time::Duration};

use clap::Args;

use crate::{
    credential::{ApiKey, Credential},
    prelude::*,
    process_loop::LoopConfig,
    transport::{DEFAULT_MODEL, OcrTransport, http::HttpTransport, mock::MockTransport},
};

pub mod models;
pub mod page;
pub mod run;
pub mod status;

/// Options for reaching the OCR backend.
#[derive(Args, Clone, Debug)]
pub struct BackendOpts {
    /// Base URL of the OCR backend.
    #[clap(
        long,
        env = "OCR_PILOT_API_BASE",
        default_value = "http://localhost:8000"
    )]
    pub api_base: String,

    /// API key for the OCR backend.
    #[clap(long, env = "OCR_PILOT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Use a scripted in-memory backend instead of HTTP. For smoke tests.
    #[clap(long, hide = true)]
    pub mock_backend: bool,
}

impl BackendOpts {
    /// Build the transport these options describe.
    pub fn transport(&self) -> Result<Arc<dyn OcrTransport>> {
        if self.mock_backend {
            Ok(Arc::new(MockTransport::always_ok()))
        } else {
            Ok(Arc::new(HttpTransport::new(&self.api_base)?))
        }
    }

    /// Build the session credential.
    pub fn credential(&self) -> Result<Arc<Credential>> {
        let raw = match &self.api_key {
            Some(key) => key.clone(),
            // The mock backend never checks the key, but the rest of the
            // pipeline still expects one.
            None if self.mock_backend => "mock-backend-placeholder-key".to_owned(),
            None => {
                return Err(anyhow!(
                    "no API key; pass --api-key or set OCR_PILOT_API_KEY"
                ));
            }
        };
        Ok(Arc::new(Credential::new(ApiKey::new(&raw)?)))
    }
}

/// Pre-flight the API key's format against the backend.
///
/// Only the format is checked; real validation happens on the first OCR
/// call, where a bad key fails loudly. An unreachable validation endpoint is
/// therefore not an error here.
pub async fn preflight_key(
    transport: &Arc<dyn OcrTransport>,
    credential: &Credential,
) -> Result<()> {
    match transport.validate_key(credential.key()).await {
        Ok(check) if !check.valid => {
            Err(anyhow!("API key rejected: {}", check.message))
        }
        Ok(_) => Ok(()),
        Err(err) => {
            debug!("key pre-flight unavailable, continuing: {err:#}");
            Ok(())
        }
    }
}

/// Loop tuning options shared by subcommands that dispatch OCR work.
#[derive(Args, Clone, Debug)]
pub struct LoopOpts {
    /// Max pages per dispatch cycle.
    #[clap(long, default_value = "3")]
    pub max_batch_size: usize,

    /// Seconds between budget polls while waiting for capacity.
    #[clap(long, default_value = "2")]
    pub poll_interval_secs: u64,

    /// How many fruitless polls to attempt before concluding that a
    /// long-horizon limit was hit.
    #[clap(long, default_value = "30")]
    pub poll_retry_limit: u32,

    /// Milliseconds to settle between consecutive dispatch cycles.
    #[clap(long, default_value = "500")]
    pub settle_delay_ms: u64,

    /// Request slots to assume when the rate-status endpoint is unreachable.
    #[clap(long, default_value = "5")]
    pub fail_open_slots: u64,

    /// Model to use. Defaults to the backend's default model.
    #[clap(long)]
    pub model: Option<String>,
}

impl LoopOpts {
    /// Convert to a [`LoopConfig`] using the already-resolved `model`.
    pub fn to_config(&self, model: String) -> LoopConfig {
        LoopConfig {
            max_batch_size: self.max_batch_size.max(1),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poll_retry_limit: self.poll_retry_limit,
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            fail_open_slots: self.fail_open_slots,
            model,
        }
    }

    /// Resolve the model to use against the backend's catalog.
    ///
    /// A requested model that the catalog does not offer is an error. An
    /// unreachable catalog is not: we fall back to the requested or default
    /// model and let the OCR endpoint be the judge.
    pub async fn resolve_model(&self, transport: &Arc<dyn OcrTransport>) -> Result<String> {
        match transport.models().await {
            Ok(catalog) => match &self.model {
                Some(model) if !catalog.contains(model) => Err(anyhow!(
                    "unknown model {model:?}; run `ocr-pilot models` to list choices"
                )),
                Some(model) => Ok(model.clone()),
                None => Ok(catalog.default),
            },
            Err(err) => {
                warn!("could not fetch model catalog: {err:#}");
                Ok(self
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_MODEL.to_owned()))
            }
        }
    }
}
