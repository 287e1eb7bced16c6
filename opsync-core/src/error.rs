//! Error taxonomy and normalization
//!
//! Remote failures arrive in many shapes: backend error bodies with codes,
//! transport failures, elapsed deadlines, opaque values. [`normalize`] turns
//! every one of them into a [`NormalizedError`] with a closed [`ErrorKind`],
//! a user-facing message and machine-readable metadata. Normalization
//! happens once, at the boundary where the raw failure is caught.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Unique-constraint violation.
pub const CODE_UNIQUE_VIOLATION: &str = "23505";
/// Foreign-key violation.
pub const CODE_FOREIGN_KEY_VIOLATION: &str = "23503";
/// Insufficient privilege.
pub const CODE_INSUFFICIENT_PRIVILEGE: &str = "42501";
/// Single-row query returned no rows.
pub const CODE_NO_ROWS: &str = "PGRST116";

const PERMISSION_FRAGMENTS: &[&str] = &[
    "permission denied",
    "not authorized",
    "row-level security",
    "forbidden",
];

const AUTH_FRAGMENTS: &[&str] = &[
    "jwt expired",
    "token expired",
    "token has expired",
    "invalid jwt",
    "invalid token",
    "not authenticated",
    "refresh token",
];

const NETWORK_FRAGMENTS: &[&str] = &["failed to fetch", "network error", "networkerror", "load failed"];

// ============================================================================
// ERROR KIND
// ============================================================================

/// Closed classification of every failure the store surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Auth,
    Validation,
    NotFound,
    Permission,
    Conflict,
    Offline,
    Unknown,
}

impl ErrorKind {
    /// Default user-facing message for this kind.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Unable to reach the server. Check your connection and try again.",
            ErrorKind::Auth => "Your session has expired. Please sign in again.",
            ErrorKind::Validation => "Some of the submitted data is invalid.",
            ErrorKind::NotFound => "The requested record could not be found.",
            ErrorKind::Permission => "You do not have permission to perform this action.",
            ErrorKind::Conflict => "A record with the same identity already exists.",
            ErrorKind::Offline => "You appear to be offline.",
            ErrorKind::Unknown => "An unexpected error occurred.",
        }
    }

    /// Recovery action the UI should offer alongside the message.
    pub fn suggested_action(&self) -> Option<RecoveryAction> {
        match self {
            ErrorKind::Auth => Some(RecoveryAction::Reauthenticate),
            ErrorKind::Network | ErrorKind::Offline => Some(RecoveryAction::Retry),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Reauthenticate,
    Retry,
}

// ============================================================================
// NORMALIZED ERROR
// ============================================================================

/// Machine-readable context kept alongside a normalized error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Message as the backend or transport phrased it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// The raw failure, kept when nothing else could be extracted from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_error: Option<Value>,
}

/// A failure in the closed taxonomy, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub meta: ErrorMeta,
}

impl NormalizedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            meta: ErrorMeta::default(),
        }
    }

    /// Create an error of the given kind with its default message.
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }

    pub fn with_meta(mut self, meta: ErrorMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Create a Validation error, used for locally rejected candidates.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Create a Network error for an elapsed deadline.
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::new(
            ErrorKind::Network,
            format!(
                "Operation '{}' timed out after {}ms",
                operation,
                after.as_millis()
            ),
        )
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Message to show in a transient notification.
    pub fn user_message(&self) -> &str {
        &self.message
    }

    pub fn suggested_action(&self) -> Option<RecoveryAction> {
        self.kind.suggested_action()
    }
}

impl fmt::Display for NormalizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for NormalizedError {}

// ============================================================================
// RAW FAILURES
// ============================================================================

/// A failure as caught at a remote boundary, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFailure {
    /// Already classified; normalization passes it through.
    Normalized(NormalizedError),
    /// Error body returned by the backend.
    Backend {
        status: Option<u16>,
        code: Option<String>,
        message: Option<String>,
        details: Option<Value>,
        hint: Option<String>,
    },
    /// The request never produced a response.
    Transport { message: String, offline: bool },
    /// The per-operation deadline elapsed.
    Timeout { operation: String, after: Duration },
    /// Anything else, kept verbatim.
    Other(Value),
}

impl RawFailure {
    pub fn backend(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            status: None,
            code: Some(code.into()),
            message: Some(message.into()),
            details: None,
            hint: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Backend {
            status: Some(status),
            code: None,
            message: Some(message.into()),
            details: None,
            hint: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            offline: false,
        }
    }

    pub fn offline(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            offline: true,
        }
    }

    fn message(&self) -> Option<&str> {
        match self {
            Self::Normalized(err) => Some(&err.message),
            Self::Backend { message, .. } => message.as_deref(),
            Self::Transport { message, .. } => Some(message),
            Self::Timeout { .. } => None,
            Self::Other(Value::String(message)) => Some(message),
            Self::Other(Value::Object(map)) => map.get("message").and_then(Value::as_str),
            Self::Other(_) => None,
        }
    }

    fn code(&self) -> Option<&str> {
        match self {
            Self::Backend { code, .. } => code.as_deref(),
            Self::Other(Value::Object(map)) => map.get("code").and_then(Value::as_str),
            _ => None,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Self::Backend { status, .. } => *status,
            Self::Other(Value::Object(map)) => map
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok()),
            _ => None,
        }
    }

    /// JSON rendering kept in `meta.original_error` for unclassifiable input.
    fn to_value(&self) -> Value {
        match self {
            Self::Other(value) => value.clone(),
            Self::Normalized(err) => serde_json::to_value(err).unwrap_or(Value::Null),
            Self::Backend {
                status,
                code,
                message,
                details,
                hint,
            } => serde_json::json!({
                "status": status,
                "code": code,
                "message": message,
                "details": details,
                "hint": hint,
            }),
            Self::Transport { message, offline } => serde_json::json!({
                "message": message,
                "offline": offline,
            }),
            Self::Timeout { operation, after } => serde_json::json!({
                "operation": operation,
                "after_ms": after.as_millis() as u64,
            }),
        }
    }

    fn meta(&self) -> ErrorMeta {
        match self {
            Self::Backend {
                status,
                code,
                message,
                details,
                hint,
            } => ErrorMeta {
                code: code.clone(),
                status: *status,
                raw_message: message.clone(),
                details: details.clone(),
                hint: hint.clone(),
                original_error: None,
            },
            other => ErrorMeta {
                code: other.code().map(str::to_string),
                status: other.status(),
                raw_message: other.message().map(str::to_string),
                ..ErrorMeta::default()
            },
        }
    }
}

impl From<NormalizedError> for RawFailure {
    fn from(err: NormalizedError) -> Self {
        Self::Normalized(err)
    }
}

impl From<Value> for RawFailure {
    fn from(value: Value) -> Self {
        Self::Other(value)
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Classify a raw failure. Rules are checked in order; the first match wins.
pub fn normalize(raw: RawFailure) -> NormalizedError {
    if let RawFailure::Normalized(err) = raw {
        return err;
    }

    let code = raw.code();
    let status = raw.status();
    let lowered = raw.message().map(str::to_lowercase);
    let mentions = |fragments: &[&str]| {
        lowered
            .as_deref()
            .is_some_and(|m| fragments.iter().any(|f| m.contains(f)))
    };

    let kind = if code == Some(CODE_UNIQUE_VIOLATION) {
        Some(ErrorKind::Conflict)
    } else if code == Some(CODE_FOREIGN_KEY_VIOLATION) {
        Some(ErrorKind::Validation)
    } else if code == Some(CODE_NO_ROWS) {
        Some(ErrorKind::NotFound)
    } else if code == Some(CODE_INSUFFICIENT_PRIVILEGE)
        || status == Some(403)
        || mentions(PERMISSION_FRAGMENTS)
    {
        Some(ErrorKind::Permission)
    } else if status == Some(401) || mentions(AUTH_FRAGMENTS) {
        Some(ErrorKind::Auth)
    } else {
        match &raw {
            RawFailure::Transport { offline: true, .. } => Some(ErrorKind::Offline),
            RawFailure::Transport { .. } | RawFailure::Timeout { .. } => Some(ErrorKind::Network),
            _ if mentions(NETWORK_FRAGMENTS) => Some(ErrorKind::Network),
            _ => None,
        }
    };

    let meta = raw.meta();
    match (kind, raw) {
        (Some(ErrorKind::Network), RawFailure::Timeout { operation, after }) => {
            NormalizedError::timeout(&operation, after).with_meta(meta)
        }
        (Some(kind), _) => NormalizedError::from_kind(kind).with_meta(meta),
        (None, raw) => match raw.message() {
            Some(message) if !message.trim().is_empty() => {
                NormalizedError::new(ErrorKind::Unknown, message).with_meta(meta)
            }
            _ => {
                let original_error = raw.to_value();
                NormalizedError::from_kind(ErrorKind::Unknown).with_meta(ErrorMeta {
                    original_error: Some(original_error),
                    ..meta
                })
            }
        },
    }
}
