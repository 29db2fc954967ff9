//! External-collaborator adapters.
//!
//! Thin trait contracts to the systems this crate doesn't own: the
//! persistent setlist/song store and the STT vendor. The session follow
//! pipeline depends only on these traits, never on a concrete backend —
//! adapters are injected into `bootstrap_services` rather than constructed
//! inline by the services that use them.
//!
//! Design note on partial-vs-cumulative transcripts: the mode is an explicit
//! property of the adapter ([`TranscriptMode`]), never sniffed from provider
//! identity anywhere outside the adapter factory that builds a
//! [`SttProvider`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{SetlistLoadError, SttAdapterError};
use crate::messages::{AudioFormatDeclaration, EventId};
use crate::slides::Song;

/// Immutable snapshot of an event's setlist, loaded once at session start.
#[derive(Debug, Clone)]
pub struct EventSnapshot {
    pub event_id: EventId,
    pub event_name: String,
    pub setlist: Vec<Song>,
}

/// Loads the compiled setlist snapshot for an event id.
#[async_trait]
pub trait SetlistLoader: Send + Sync {
    async fn load_event(&self, event_id: &str) -> Result<EventSnapshot, SetlistLoadError>;
}

/// A single transcript observation delivered by an STT adapter.
#[derive(Debug, Clone)]
pub struct TranscriptUpdate {
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f64>,
}

/// Whether a provider emits transcripts that replace the rolling buffer
/// wholesale (cumulative) or that must be appended and trimmed (delta).
/// Spec §9: "Pass the mode as an explicit adapter property; the session must
/// not sniff provider identity anywhere other than the adapter factory."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptMode {
    Cumulative,
    Delta,
}

/// Callback through which a streaming handle delivers transcripts. Boxed so
/// it can be shared across every session subscribed to the same handle (spec
/// §3, "Ownership": "Multiple sessions bound to the same event id may share
/// a single STT handle").
pub type TranscriptSink = Arc<dyn Fn(TranscriptUpdate) + Send + Sync>;

/// Error callback invoked when a streaming STT connection fails at the
/// stream level (spec §4.7: "STT adapter error callback").
pub type SttErrorSink = Arc<dyn Fn(SttAdapterError) + Send + Sync>;

/// A live streaming-STT connection. Created lazily by the follow pipeline on
/// the first audio chunk (spec §4.5, "Lazy init").
#[async_trait]
pub trait StreamingSttHandle: Send + Sync {
    async fn send_audio(&self, data: Bytes) -> Result<(), SttAdapterError>;
    async fn close(&self);
}

/// Factory for streaming STT connections. `required_audio_format` returns
/// `Some` when the vendor needs a specific PCM format (spec §4.5, "Format
/// gate"); `None` means no format precondition is enforced.
#[async_trait]
pub trait StreamingSttProvider: Send + Sync {
    fn required_audio_format(&self) -> Option<AudioFormatDeclaration>;
    fn transcript_mode(&self) -> TranscriptMode;
    async fn open(
        &self,
        on_transcript: TranscriptSink,
        on_error: SttErrorSink,
    ) -> Result<Arc<dyn StreamingSttHandle>, SttAdapterError>;
}

/// One-shot transcription for chunk-based (non-streaming) providers (spec
/// §4.5: "the handler calls a one-shot transcribe function").
#[async_trait]
pub trait ChunkSttProvider: Send + Sync {
    async fn transcribe(
        &self,
        data: Bytes,
        format: Option<AudioFormatDeclaration>,
    ) -> Result<Option<TranscriptUpdate>, SttAdapterError>;
}

/// The two STT adapter shapes a session can be configured with. A session
/// branches on this enum exactly once, at audio-handling time — never on any
/// vendor-specific type.
#[derive(Clone)]
pub enum SttProvider {
    Streaming(Arc<dyn StreamingSttProvider>),
    Chunk(Arc<dyn ChunkSttProvider>),
}

/// In-memory [`SetlistLoader`] used when the "fallback to mock setlist" knob
/// is enabled, or in tests.
#[derive(Default)]
pub struct MockSetlistLoader {
    events: HashMap<String, EventSnapshot>,
}

impl MockSetlistLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event(mut self, snapshot: EventSnapshot) -> Self {
        self.events.insert(snapshot.event_id.clone(), snapshot);
        self
    }
}

#[async_trait]
impl SetlistLoader for MockSetlistLoader {
    async fn load_event(&self, event_id: &str) -> Result<EventSnapshot, SetlistLoadError> {
        self.events
            .get(event_id)
            .cloned()
            .ok_or_else(|| SetlistLoadError::NotFound(event_id.to_string()))
    }
}

/// A [`ChunkSttProvider`] that never transcribes anything, for standalone
/// deployments with no STT vendor wired in yet. Lets the server binary boot
/// and exercise the rest of the pipeline (sessions, slide navigation via
/// `MANUAL_OVERRIDE`) without a real speech-to-text integration.
#[derive(Default)]
pub struct NullSttProvider;

#[async_trait]
impl ChunkSttProvider for NullSttProvider {
    async fn transcribe(
        &self,
        _data: bytes::Bytes,
        _format: Option<AudioFormatDeclaration>,
    ) -> Result<Option<TranscriptUpdate>, SttAdapterError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slides::{compile, SlideCompileConfig};

    #[tokio::test]
    async fn mock_setlist_loader_returns_registered_event() {
        let song = compile("s1".into(), "Song".into(), None, "line one", &SlideCompileConfig::default());
        let loader = MockSetlistLoader::new().with_event(EventSnapshot {
            event_id: "e1".into(),
            event_name: "Sunday Service".into(),
            setlist: vec![song],
        });

        let snapshot = loader.load_event("e1").await.unwrap();
        assert_eq!(snapshot.event_name, "Sunday Service");
        assert_eq!(snapshot.setlist.len(), 1);
    }

    #[tokio::test]
    async fn mock_setlist_loader_reports_not_found() {
        let loader = MockSetlistLoader::new();
        let err = loader.load_event("missing").await.unwrap_err();
        assert!(matches!(err, SetlistLoadError::NotFound(_)));
    }
}
