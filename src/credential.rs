//! API key handling.

use std::{fmt, sync::Mutex};

use crate::prelude::*;

/// The shortest key we will even bother sending to the backend. Gemini-style
/// keys are ~39 characters; we stay lenient and only reject obvious typos.
const MIN_KEY_LEN: usize = 20;

/// What we currently know about the key.
///
/// `Invalid` is only ever set from an explicit authentication-failure response.
/// Rate limits, quota exhaustion and transient errors never touch validity, so
/// a valid key cannot be falsely marked bad by a busy backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

/// An API key for the OCR backend.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a raw key string, rejecting keys that are too short to be real.
    pub fn new(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() < MIN_KEY_LEN {
            return Err(anyhow!(
                "API key appears too short ({} characters, need at least {})",
                raw.len(),
                MIN_KEY_LEN
            ));
        }
        Ok(Self(raw.to_owned()))
    }

    /// The raw key, for inclusion in a request header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

// Keep keys out of logs and error messages.
impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(…{} chars)", self.0.len())
    }
}

/// Session-wide credential state: the key plus what we have learned about it.
#[derive(Debug)]
pub struct Credential {
    key: ApiKey,
    validity: Mutex<Validity>,
}

impl Credential {
    /// Create a credential whose validity is not yet known.
    pub fn new(key: ApiKey) -> Self {
        Self {
            key,
            validity: Mutex::new(Validity::Unknown),
        }
    }

    /// The key itself.
    pub fn key(&self) -> &ApiKey {
        &self.key
    }

    /// Current validity.
    pub fn validity(&self) -> Validity {
        *self.validity.lock().expect("lock poisoned")
    }

    /// Record a successful authenticated call.
    pub fn mark_valid(&self) {
        let mut validity = self.validity.lock().expect("lock poisoned");
        // Invalid is sticky for the session; the user must re-verify.
        if *validity != Validity::Invalid {
            *validity = Validity::Valid;
        }
    }

    /// Record an explicit authentication failure.
    pub fn mark_invalid(&self) {
        *self.validity.lock().expect("lock poisoned") = Validity::Invalid;
    }
}
