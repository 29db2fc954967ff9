//! Stable error taxonomy for the session server.
//!
//! Every error the core can produce is surfaced to the originating connection
//! as an `ERROR{code, message, details?}` frame, never broadcast. `FollowError`
//! is the single enum that carries both the stable machine-readable code and a
//! human-readable message; collaborator-specific errors (setlist loading, STT)
//! convert into it via `From`.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::messages::ServerMessage;

/// Trait for error types that provide machine-readable, stable error codes.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

#[derive(Debug, Error)]
pub enum FollowError {
    #[error("frame was not valid JSON: {0}")]
    InvalidJson(String),

    #[error("frame failed schema validation: {0}")]
    ValidationError(String),

    #[error("unrecognised message type: {0}")]
    UnknownType(String),

    #[error("rate limit exceeded for {kind} messages")]
    RateLimited { kind: &'static str },

    #[error("connection already owns a session")]
    SessionExists,

    #[error("message requires an active session")]
    NoSession,

    #[error("event {0} was not found")]
    EventNotFound(String),

    #[error("event {0} has an empty setlist")]
    EmptySetlist(String),

    #[error("audio format unsupported: observed {observed}, expected {expected}")]
    AudioFormatUnsupported { observed: String, expected: String },

    #[error("streaming STT reported a stream-level error: {0}")]
    SttError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorCode for FollowError {
    fn code(&self) -> &'static str {
        match self {
            FollowError::InvalidJson(_) => "INVALID_JSON",
            FollowError::ValidationError(_) => "VALIDATION_ERROR",
            FollowError::UnknownType(_) => "UNKNOWN_TYPE",
            FollowError::RateLimited { .. } => "RATE_LIMITED",
            FollowError::SessionExists => "SESSION_EXISTS",
            FollowError::NoSession => "NO_SESSION",
            FollowError::EventNotFound(_) => "EVENT_NOT_FOUND",
            FollowError::EmptySetlist(_) => "EMPTY_SETLIST",
            FollowError::AudioFormatUnsupported { .. } => "AUDIO_FORMAT_UNSUPPORTED",
            FollowError::SttError(_) => "STT_ERROR",
            FollowError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl FollowError {
    /// True when this error, raised inside `START_SESSION`, must prevent
    /// session creation. Per spec §7: "None of the above error codes
    /// terminate the session except `INTERNAL_ERROR` when raised inside
    /// `START_SESSION`".
    pub fn aborts_session_start(&self) -> bool {
        matches!(self, FollowError::Internal(_))
    }

    /// Structured `details` payload attached to the wire `ERROR` frame, when
    /// the variant carries machine-readable detail beyond the message text.
    fn details(&self) -> Option<Value> {
        match self {
            FollowError::AudioFormatUnsupported { observed, expected } => Some(serde_json::json!({
                "observed": observed,
                "expected": expected,
            })),
            FollowError::RateLimited { kind } => Some(serde_json::json!({ "kind": kind })),
            _ => None,
        }
    }

    /// Wrap this error into the wire `ERROR` server message.
    pub fn to_ws_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code().to_string(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

/// Error surface for the external setlist-loader collaborator (spec §4.5,
/// "External-collaborator adapters").
#[derive(Debug, Error, Serialize)]
pub enum SetlistLoadError {
    #[error("event {0} was not found")]
    NotFound(String),

    #[error("setlist loader failed: {0}")]
    Backend(String),
}

impl From<SetlistLoadError> for FollowError {
    fn from(err: SetlistLoadError) -> Self {
        match err {
            SetlistLoadError::NotFound(id) => FollowError::EventNotFound(id),
            SetlistLoadError::Backend(msg) => FollowError::Internal(msg),
        }
    }
}

/// Error surface for the streaming/chunk STT collaborator adapters.
#[derive(Debug, Error, Serialize)]
pub enum SttAdapterError {
    #[error("STT stream error: {0}")]
    StreamFailed(String),

    #[error("STT transcription request failed: {0}")]
    TranscribeFailed(String),
}

impl From<SttAdapterError> for FollowError {
    fn from(err: SttAdapterError) -> Self {
        match err {
            SttAdapterError::StreamFailed(msg) => FollowError::SttError(msg),
            SttAdapterError::TranscribeFailed(msg) => FollowError::SttError(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_error_returns_correct_code() {
        let err = FollowError::RateLimited { kind: "audio" };
        assert_eq!(err.code(), "RATE_LIMITED");
    }

    #[test]
    fn audio_format_unsupported_returns_correct_code_and_details() {
        let err = FollowError::AudioFormatUnsupported {
            observed: "pcm_f32le/44100/2".into(),
            expected: "pcm_s16le/16000/1".into(),
        };
        assert_eq!(err.code(), "AUDIO_FORMAT_UNSUPPORTED");
        assert!(err.details().is_some());
    }

    #[test]
    fn only_internal_error_aborts_session_start() {
        assert!(FollowError::Internal("boom".into()).aborts_session_start());
        assert!(!FollowError::EventNotFound("e1".into()).aborts_session_start());
        assert!(!FollowError::SttError("stream reset".into()).aborts_session_start());
    }

    #[test]
    fn setlist_not_found_maps_to_event_not_found() {
        let err: FollowError = SetlistLoadError::NotFound("e1".into()).into();
        assert_eq!(err.code(), "EVENT_NOT_FOUND");
    }

    #[test]
    fn to_ws_message_carries_stable_code() {
        let err = FollowError::NoSession;
        match err.to_ws_message() {
            ServerMessage::Error { code, .. } => assert_eq!(code, "NO_SESSION"),
            _ => panic!("expected Error variant"),
        }
    }
}
