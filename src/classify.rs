//! Classification of OCR backend errors.
//!
//! Remote OCR gateways are sloppy about error reporting: a daily-quota
//! exhaustion may arrive as a generic per-page error string, and only the
//! wording distinguishes it from an ordinary short-window rate limit. We keep
//! the classification rules in one explicit, testable table instead of
//! scattering substring checks through the dispatch code.

use std::{fmt, sync::LazyLock};

use regex::Regex;

/// What went wrong with one page, or with the session as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The short-window rate budget was exceeded. Always retryable once the
    /// budget recovers. Never escalates credential or daily-limit state.
    RateLimited {
        /// How long the backend asked us to wait.
        wait_seconds: u64,
        /// How many request slots the backend reported as available.
        available_slots: u64,
    },

    /// The API key was explicitly rejected. Fatal for the session.
    InvalidCredential,

    /// A long-horizon quota (typically daily) is exhausted. Halts
    /// auto-processing but does not invalidate the credential.
    QuotaExhausted,

    /// A single page's request failed for an uncategorized reason. Recorded
    /// for that page only; other pages are unaffected.
    TransientItemFailure {
        /// The raw error message, for display.
        message: String,
    },
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::RateLimited { wait_seconds, .. } => {
                write!(f, "rate limited (retry in {wait_seconds}s)")
            }
            ErrorKind::InvalidCredential => write!(f, "invalid API key"),
            ErrorKind::QuotaExhausted => write!(f, "API quota exhausted"),
            ErrorKind::TransientItemFailure { message } => {
                write!(f, "request failed: {message}")
            }
        }
    }
}

/// The category a marker pattern maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Auth,
    Quota,
}

/// Marker patterns observed in real backend error strings, in match order.
/// Auth markers are checked before quota markers so that a message mentioning
/// both (rare, but seen from proxy gateways) is treated as a credential
/// problem, which is the more conservative outcome.
const MARKER_RULES: &[(&str, Marker)] = &[
    (r"(?i)api[_\s-]?key[_\s-]?invalid", Marker::Auth),
    (r"(?i)invalid[_\s-]?api[_\s-]?key", Marker::Auth),
    (r"(?i)\bunauthorized\b", Marker::Auth),
    (r"\b401\b", Marker::Auth),
    (r"(?i)\bquota\b", Marker::Quota),
    (r"(?i)resource[_\s-]?exhausted", Marker::Quota),
    (r"\b429\b", Marker::Quota),
];

/// Compiled versions of [`MARKER_RULES`].
static COMPILED_RULES: LazyLock<Vec<(Regex, Marker)>> = LazyLock::new(|| {
    MARKER_RULES
        .iter()
        .map(|(pattern, marker)| {
            let re = Regex::new(pattern).expect("failed to compile marker pattern");
            (re, *marker)
        })
        .collect()
});

/// Classify a raw per-page error message from the OCR backend.
///
/// Messages carrying an explicit auth marker become
/// [`ErrorKind::InvalidCredential`]; quota and resource-exhaustion markers
/// become [`ErrorKind::QuotaExhausted`], even when the backend wrapped them in
/// a generic failure. Everything else is a [`ErrorKind::TransientItemFailure`]
/// for that page alone. Note that credential failures are never *inferred*:
/// timeouts and connection errors do not reach this function as auth markers.
pub fn classify_message(message: &str) -> ErrorKind {
    for (re, marker) in COMPILED_RULES.iter() {
        if re.is_match(message) {
            return match marker {
                Marker::Auth => ErrorKind::InvalidCredential,
                Marker::Quota => ErrorKind::QuotaExhausted,
            };
        }
    }
    ErrorKind::TransientItemFailure {
        message: message.to_owned(),
    }
}
