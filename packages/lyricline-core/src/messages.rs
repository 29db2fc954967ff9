//! Wire message schema and validator.
//!
//! Tagged-union client and server message types: a `type` discriminant plus
//! a payload. Parsing goes through [`parse_client_message`], which turns a raw
//! JSON text frame into either a validated [`ClientMessage`] or a
//! [`crate::error::FollowError`] carrying one of the stable `INVALID_JSON` /
//! `VALIDATION_ERROR` / `UNKNOWN_TYPE` codes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FollowError;
use crate::slides::Song;

/// An opaque, URL-safe session identifier. Implementer's choice of shape; we
/// use UUID v4 by convention.
pub type SessionId = String;
pub type EventId = String;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub server_received_at: u64,
    pub server_sent_at: u64,
    pub processing_time_ms: u64,
}

/// Client-originated frame catalogue.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    StartSession {
        #[serde(rename = "payload")]
        payload: StartSessionPayload,
    },
    UpdateEventSettings {
        #[serde(default)]
        payload: UpdateEventSettingsPayload,
    },
    AudioData {
        payload: AudioDataPayload,
    },
    ManualOverride {
        payload: ManualOverridePayload,
    },
    StopSession,
    Ping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionPayload {
    pub event_id: EventId,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEventSettingsPayload {
    pub projector_font: Option<String>,
    pub bible_mode: Option<bool>,
    pub bible_version_id: Option<String>,
    pub bible_follow: Option<bool>,
}

/// Resting event-level settings a session carries forward, built by
/// successively merging `UPDATE_EVENT_SETTINGS` payloads (spec §4.1). The
/// bible-reference parser and passage fetcher these flags gate are external
/// collaborators (spec §1, explicitly out of scope); this crate only tracks
/// and echoes the flags themselves.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSettings {
    pub projector_font: Option<String>,
    pub bible_mode: bool,
    pub bible_version_id: Option<String>,
    pub bible_follow: bool,
}

impl EventSettings {
    /// Apply only the fields the client actually sent, leaving the rest at
    /// their current value.
    pub fn merge(&mut self, update: &UpdateEventSettingsPayload) {
        if let Some(font) = &update.projector_font {
            self.projector_font = Some(font.clone());
        }
        if let Some(bible_mode) = update.bible_mode {
            self.bible_mode = bible_mode;
        }
        if let Some(version_id) = &update.bible_version_id {
            self.bible_version_id = Some(version_id.clone());
        }
        if let Some(bible_follow) = update.bible_follow {
            self.bible_follow = bible_follow;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDataPayload {
    /// Base64-encoded audio bytes.
    pub data: String,
    #[serde(default)]
    pub format: Option<AudioFormatDeclaration>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormatDeclaration {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: String,
}

impl std::fmt::Display for AudioFormatDeclaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.encoding, self.sample_rate, self.channels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverrideAction {
    NextSlide,
    PrevSlide,
    GoToSlide,
    GoToItem,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOverridePayload {
    pub action: OverrideAction,
    pub slide_index: Option<usize>,
    pub song_id: Option<String>,
    pub item_index: Option<usize>,
    pub item_id: Option<String>,
}

/// Server-originated frame catalogue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SessionStarted {
        session_id: SessionId,
        event_id: EventId,
        event_name: String,
        total_songs: usize,
        current_song_index: usize,
        current_slide_index: usize,
        setlist: Vec<Song>,
        #[serde(skip_serializing_if = "Option::is_none")]
        initial_display: Option<Box<ServerMessage>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timing: Option<Timing>,
    },
    EventSettingsUpdated {
        #[serde(flatten)]
        settings: EventSettings,
        #[serde(skip_serializing_if = "Option::is_none")]
        timing: Option<Timing>,
    },
    TranscriptUpdate {
        text: String,
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timing: Option<Timing>,
    },
    DisplayUpdate {
        line_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        slide_text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        slide_lines: Option<Vec<String>>,
        slide_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        line_index: Option<usize>,
        song_id: String,
        song_title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        match_confidence: Option<f64>,
        is_auto_advance: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        timing: Option<Timing>,
    },
    SongChanged {
        song_id: String,
        song_title: String,
        song_index: usize,
        total_slides: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        timing: Option<Timing>,
    },
    SongSuggestion {
        suggested_song_id: String,
        suggested_song_title: String,
        suggested_song_index: usize,
        confidence: f64,
        matched_line: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timing: Option<Timing>,
    },
    SessionEnded {
        session_id: SessionId,
        reason: SessionEndReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        timing: Option<Timing>,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Pong {
        timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        timing: Option<Timing>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    UserStopped,
    Error,
    Timeout,
}

/// True for a non-empty, opaque, URL-safe id (spec §4.1's `eventId` contract,
/// spec §6: "an opaque, URL-safe string format") — unreserved characters per
/// RFC 3986 (`ALPHA / DIGIT / "-" / "." / "_" / "~"`), nothing else.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
}

/// Parse and validate a single inbound text frame.
///
/// Returns the stable error codes `INVALID_JSON` (frame is not valid JSON) or
/// `VALIDATION_ERROR` (well-formed JSON that fails the tagged-union schema,
/// including an unrecognised `type`, which we fold into `VALIDATION_ERROR`'s
/// sibling `UNKNOWN_TYPE` by inspecting the raw `type` field first, and
/// including a malformed `eventId` on `START_SESSION`).
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, FollowError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| FollowError::InvalidJson(e.to_string()))?;

    let Some(type_value) = value.get("type").and_then(Value::as_str) else {
        return Err(FollowError::ValidationError(
            "missing required `type` field".to_string(),
        ));
    };

    const KNOWN_TYPES: &[&str] = &[
        "START_SESSION",
        "UPDATE_EVENT_SETTINGS",
        "AUDIO_DATA",
        "MANUAL_OVERRIDE",
        "STOP_SESSION",
        "PING",
    ];
    if !KNOWN_TYPES.contains(&type_value) {
        return Err(FollowError::UnknownType(type_value.to_string()));
    }

    let message: ClientMessage = serde_json::from_value(value).map_err(|e| FollowError::ValidationError(e.to_string()))?;

    if let ClientMessage::StartSession { payload } = &message {
        if !is_valid_id(&payload.event_id) {
            return Err(FollowError::ValidationError(format!(
                "eventId {:?} is not a valid opaque, URL-safe id",
                payload.event_id
            )));
        }
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_json_yields_invalid_json_code() {
        let err = parse_client_message("{not json").unwrap_err();
        assert_eq!(err.code(), "INVALID_JSON");
    }

    #[test]
    fn unknown_type_yields_unknown_type_code() {
        let err = parse_client_message(r#"{"type":"NONSENSE"}"#).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_TYPE");
    }

    #[test]
    fn missing_type_yields_validation_error() {
        let err = parse_client_message(r#"{"payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn start_session_missing_payload_yields_validation_error() {
        let err = parse_client_message(r#"{"type":"START_SESSION"}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn start_session_parses_event_id() {
        let msg = parse_client_message(r#"{"type":"START_SESSION","payload":{"eventId":"e1"}}"#).unwrap();
        match msg {
            ClientMessage::StartSession { payload } => assert_eq!(payload.event_id, "e1"),
            _ => panic!("expected StartSession"),
        }
    }

    #[test]
    fn start_session_rejects_malformed_event_id() {
        let err = parse_client_message(r#"{"type":"START_SESSION","payload":{"eventId":""}}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = parse_client_message(r#"{"type":"START_SESSION","payload":{"eventId":"not a valid id/"}}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn start_session_accepts_url_safe_event_id() {
        let msg = parse_client_message(r#"{"type":"START_SESSION","payload":{"eventId":"event-2026.07_31~a"}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::StartSession { .. }));
    }

    #[test]
    fn stop_session_has_no_payload() {
        let msg = parse_client_message(r#"{"type":"STOP_SESSION"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::StopSession));
    }

    #[test]
    fn ping_round_trips() {
        let msg = parse_client_message(r#"{"type":"PING"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn audio_data_parses_base64_and_format() {
        let msg = parse_client_message(
            r#"{"type":"AUDIO_DATA","payload":{"data":"AAAA","format":{"sampleRate":16000,"channels":1,"encoding":"pcm_s16le"}}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::AudioData { payload } => {
                assert_eq!(payload.data, "AAAA");
                assert_eq!(payload.format.unwrap().sample_rate, 16000);
            }
            _ => panic!("expected AudioData"),
        }
    }

    #[test]
    fn error_message_serialises_stable_code() {
        let msg = ServerMessage::Error {
            code: "RATE_LIMITED".to_string(),
            message: "too many frames".to_string(),
            details: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["code"], "RATE_LIMITED");
    }
}
