//! Session registry and broadcast fabric.
//!
//! A primary `DashMap` keyed by connection, plus a secondary index for O(1)
//! reverse lookup by event id. Mutations go through a single owner (this
//! struct); readers enumerate a given event's connections without blocking
//! writers on unrelated connections.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::adapters::StreamingSttHandle;
use crate::error::FollowError;
use crate::matcher::{MatcherConfig, SongContext};
use crate::messages::{EventId, EventSettings, ServerMessage, SessionId};
use crate::slides::Song;

/// Identifies one transport connection for as long as it is open. Assigned
/// by [`SessionRegistry::register_connection`].
pub type ConnectionId = u64;

/// Debounce state for a candidate other-song switch target (spec §4.5,
/// "Suggested song switch").
#[derive(Debug, Clone, Default)]
pub struct PendingSwitchCandidate {
    pub song_index: usize,
    pub song_id: String,
    pub hits: usize,
}

/// Debounce state for the end-words advance trigger (spec §4.5,
/// "End-trigger debounce").
#[derive(Debug, Clone, Default)]
pub struct EndTriggerState {
    pub line_index: Option<usize>,
    pub hits: usize,
    pub first_hit_at_ms: u64,
}

/// Per-connection session state (spec §3, entity "Session"). A session
/// exclusively owns its matching state, buffer, and debounce counters.
pub struct Session {
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub event_id: EventId,
    pub event_name: String,
    /// Shared by reference across sessions of the same event; read-only for
    /// a session's entire lifetime.
    pub setlist: Arc<Vec<Song>>,
    pub current_song_index: usize,
    pub current_slide_index: usize,
    pub current_line_index: usize,
    pub rolling_buffer: String,
    pub auto_following: bool,
    pub matcher_config: MatcherConfig,
    pub song_context: SongContext,
    pub pending_switch: Option<PendingSwitchCandidate>,
    pub end_trigger: EndTriggerState,
    pub last_switch_at_ms: Option<u64>,
    pub last_match_confidence: Option<f64>,
    /// Whether this session has subscribed to its event's shared streaming
    /// STT handle (spec §3, "Ownership": refcounted by the set of sessions
    /// subscribed). Set on the first successful `AUDIO_DATA` frame for a
    /// streaming provider; used at `STOP_SESSION` to decide whether to
    /// release a subscription at all.
    pub stt_subscribed: bool,
}

impl Session {
    pub fn current_song(&self) -> &Song {
        &self.setlist[self.current_song_index]
    }
}

/// Refcounted handle to a shared streaming-STT connection (spec §3,
/// "Ownership": "lifetime = until the last owner session releases it or the
/// stream errors"; spec §9: "implement as an explicit handle struct with an
/// atomic subscriber count rather than a bidirectional reference").
pub struct SttHandleEntry {
    pub handle: Arc<dyn StreamingSttHandle>,
    subscribers: AtomicUsize,
    pub last_transcript_at_ms: AtomicU64,
    pub last_restart_at_ms: AtomicU64,
    /// [SUPPLEMENT, open question (c), resolved in DESIGN.md] The session
    /// whose audio frame most recently drove this handle — the recipient of
    /// a stream-level `STT_ERROR`.
    driving_connection: Mutex<Option<ConnectionId>>,
}

impl SttHandleEntry {
    pub fn new(handle: Arc<dyn StreamingSttHandle>, created_at_ms: u64) -> Self {
        Self {
            handle,
            subscribers: AtomicUsize::new(0),
            last_transcript_at_ms: AtomicU64::new(created_at_ms),
            last_restart_at_ms: AtomicU64::new(created_at_ms),
            driving_connection: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> usize {
        self.subscribers.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the resulting subscriber count; zero means the caller must
    /// tear the handle down.
    pub fn unsubscribe(&self) -> usize {
        self.subscribers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub fn mark_driving(&self, connection_id: ConnectionId) {
        *self.driving_connection.lock() = Some(connection_id);
    }

    pub fn driving_connection(&self) -> Option<ConnectionId> {
        *self.driving_connection.lock()
    }
}

/// Single owner of connection → session and event id → connections mappings
/// (spec §9: "isolate it behind a single owner that serialises mutations and
/// produces snapshots for broadcast").
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Arc<Mutex<Session>>>,
    event_index: DashMap<EventId, DashSet<ConnectionId>>,
    outbound: DashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>,
    stt_handles: DashMap<EventId, Arc<SttHandleEntry>>,
    /// Resting `UPDATE_EVENT_SETTINGS` state, one entry per event rather than
    /// per session, so a second connection's update builds on every prior
    /// connection's update instead of starting from that connection's own
    /// stale copy (spec §4.1).
    event_settings: DashMap<EventId, EventSettings>,
    next_connection_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new connection, returning the id subsequent calls use.
    pub fn register_connection(&self, outbound_tx: mpsc::UnboundedSender<ServerMessage>) -> ConnectionId {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.outbound.insert(id, outbound_tx);
        id
    }

    /// Drop a connection's outbound channel and any session it owned.
    pub fn unregister_connection(&self, id: ConnectionId) -> Option<Arc<Mutex<Session>>> {
        self.outbound.remove(&id);
        self.remove_session(id)
    }

    pub fn has_session(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Create a session for `id`. Errs with `SESSION_EXISTS` if the
    /// connection already owns one (spec §4.5: "Reject if the connection
    /// already owns a session").
    pub fn create_session(&self, id: ConnectionId, session: Session) -> Result<(), FollowError> {
        if self.sessions.contains_key(&id) {
            return Err(FollowError::SessionExists);
        }
        let event_id = session.event_id.clone();
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        self.event_index.entry(event_id).or_default().insert(id);
        Ok(())
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(&id).map(|entry| entry.clone())
    }

    pub fn remove_session(&self, id: ConnectionId) -> Option<Arc<Mutex<Session>>> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        if let Some(session) = &removed {
            let event_id = session.lock().event_id.clone();
            if let Some(set) = self.event_index.get(&event_id) {
                set.remove(&id);
            }
        }
        removed
    }

    /// Connections currently bound to `event_id`.
    pub fn connections_for_event(&self, event_id: &str) -> Vec<ConnectionId> {
        self.event_index
            .get(event_id)
            .map(|set| set.iter().map(|id| *id).collect())
            .unwrap_or_default()
    }

    /// Another still-open connection already running a session on
    /// `event_id`, used by `START_SESSION`'s sync-to-existing rule (spec
    /// §4.5). [SUPPLEMENT, open question (b), resolved in DESIGN.md]:
    /// ties are broken by taking the first encountered.
    pub fn existing_session_for_event(
        &self,
        event_id: &str,
        exclude: ConnectionId,
    ) -> Option<Arc<Mutex<Session>>> {
        let set = self.event_index.get(event_id)?;
        let other_id = set.iter().map(|id| *id).find(|id| *id != exclude)?;
        self.sessions.get(&other_id).map(|entry| entry.clone())
    }

    /// Best-effort, at-most-once delivery to every connection bound to
    /// `event_id`. A closed outbound channel is silently
    /// skipped; failures never propagate to the sender.
    pub fn broadcast(&self, event_id: &str, message: ServerMessage) {
        for id in self.connections_for_event(event_id) {
            if let Some(tx) = self.outbound.get(&id) {
                let _ = tx.send(message.clone());
            }
        }
    }

    pub fn send_to(&self, id: ConnectionId, message: ServerMessage) {
        if let Some(tx) = self.outbound.get(&id) {
            let _ = tx.send(message);
        }
    }

    pub fn stt_handle_for_event(&self, event_id: &str) -> Option<Arc<SttHandleEntry>> {
        self.stt_handles.get(event_id).map(|entry| entry.clone())
    }

    pub fn install_stt_handle(&self, event_id: EventId, entry: Arc<SttHandleEntry>) {
        self.stt_handles.insert(event_id, entry);
    }

    pub fn remove_stt_handle(&self, event_id: &str) -> Option<Arc<SttHandleEntry>> {
        self.stt_handles.remove(event_id).map(|(_, entry)| entry)
    }

    /// Current resting settings for `event_id`, or the default if no
    /// `UPDATE_EVENT_SETTINGS` has ever been applied — used both to answer a
    /// merge and to sync a newly-started session to the event's existing
    /// state.
    pub fn event_settings_for(&self, event_id: &str) -> EventSettings {
        self.event_settings.get(event_id).map(|entry| entry.clone()).unwrap_or_default()
    }

    /// Applies a partial update to `event_id`'s resting settings and returns
    /// the merged result.
    pub fn merge_event_settings(&self, event_id: &str, update: &crate::messages::UpdateEventSettingsPayload) -> EventSettings {
        let mut entry = self.event_settings.entry(event_id.to_string()).or_default();
        entry.merge(update);
        entry.clone()
    }

    /// Force-close every connection and release every shared resource, used
    /// by graceful shutdown. This is the only path by which sessions are
    /// ever torn down for a reason other than disconnect/stop, and it is
    /// never driven by a timeout.
    pub fn close_all(&self) {
        self.sessions.clear();
        self.event_index.clear();
        self.outbound.clear();
        self.stt_handles.clear();
        self.event_settings.clear();
    }

    pub fn connection_count(&self) -> usize {
        self.outbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::matcher::SongContext;
    use crate::slides::{compile, SlideCompileConfig};
    use tokio::sync::mpsc::unbounded_channel;

    fn test_session(connection_id: ConnectionId, event_id: &str) -> Session {
        let song = compile("s1".into(), "Song".into(), None, "line one\nline two", &SlideCompileConfig::default());
        let song_context = SongContext::new(&song, 0);
        Session {
            connection_id,
            session_id: "sess-1".into(),
            event_id: event_id.to_string(),
            event_name: "Test Event".into(),
            setlist: Arc::new(vec![song]),
            current_song_index: 0,
            current_slide_index: 0,
            current_line_index: 0,
            rolling_buffer: String::new(),
            auto_following: true,
            matcher_config: MatcherConfig::default(),
            song_context,
            pending_switch: None,
            end_trigger: EndTriggerState::default(),
            last_switch_at_ms: None,
            last_match_confidence: None,
            stt_subscribed: false,
        }
    }

    #[test]
    fn register_and_create_session_indexes_by_event() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let id = registry.register_connection(tx);
        registry.create_session(id, test_session(id, "e1")).unwrap();

        assert!(registry.has_session(id));
        assert_eq!(registry.connections_for_event("e1"), vec![id]);
    }

    #[test]
    fn creating_second_session_on_same_connection_errs() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let id = registry.register_connection(tx);
        registry.create_session(id, test_session(id, "e1")).unwrap();

        let err = registry.create_session(id, test_session(id, "e1")).unwrap_err();
        assert_eq!(err.code(), "SESSION_EXISTS");
    }

    #[test]
    fn removing_session_clears_event_index() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let id = registry.register_connection(tx);
        registry.create_session(id, test_session(id, "e1")).unwrap();

        registry.remove_session(id);
        assert!(!registry.has_session(id));
        assert!(registry.connections_for_event("e1").is_empty());
    }

    #[test]
    fn unregister_connection_removes_outbound_and_session() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let id = registry.register_connection(tx);
        registry.create_session(id, test_session(id, "e1")).unwrap();

        registry.unregister_connection(id);
        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.has_session(id));
    }

    #[test]
    fn existing_session_for_event_excludes_self_and_finds_other() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();
        let id1 = registry.register_connection(tx1);
        let id2 = registry.register_connection(tx2);
        registry.create_session(id1, test_session(id1, "e1")).unwrap();

        assert!(registry.existing_session_for_event("e1", id1).is_none());

        registry.create_session(id2, test_session(id2, "e1")).unwrap();
        let found = registry.existing_session_for_event("e1", id2).unwrap();
        assert_eq!(found.lock().connection_id, id1);
    }

    #[tokio::test]
    async fn broadcast_delivers_to_all_connections_on_event_only() {
        let registry = SessionRegistry::new();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        let id1 = registry.register_connection(tx1);
        let id2 = registry.register_connection(tx2);
        registry.create_session(id1, test_session(id1, "e1")).unwrap();
        registry.create_session(id2, test_session(id2, "e2")).unwrap();

        registry.broadcast("e1", ServerMessage::Pong { timestamp: 1, timing: None });

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn stt_handle_subscriber_count_tracks_subscribe_unsubscribe() {
        struct NoopHandle;
        #[async_trait::async_trait]
        impl StreamingSttHandle for NoopHandle {
            async fn send_audio(&self, _data: bytes::Bytes) -> Result<(), crate::error::SttAdapterError> {
                Ok(())
            }
            async fn close(&self) {}
        }

        let entry = SttHandleEntry::new(Arc::new(NoopHandle), 0);
        assert_eq!(entry.subscribe(), 1);
        assert_eq!(entry.subscribe(), 2);
        assert_eq!(entry.unsubscribe(), 1);
        assert_eq!(entry.subscriber_count(), 1);
    }

    #[test]
    fn event_settings_accumulate_across_separate_merges() {
        use crate::messages::UpdateEventSettingsPayload;

        let registry = SessionRegistry::new();
        assert!(!registry.event_settings_for("e1").bible_mode);

        let first = UpdateEventSettingsPayload {
            projector_font: Some("Inter".to_string()),
            bible_mode: Some(true),
            bible_version_id: None,
            bible_follow: None,
        };
        registry.merge_event_settings("e1", &first);

        let second = UpdateEventSettingsPayload {
            projector_font: None,
            bible_mode: None,
            bible_version_id: Some("kjv".to_string()),
            bible_follow: None,
        };
        let merged = registry.merge_event_settings("e1", &second);

        assert_eq!(merged.projector_font.as_deref(), Some("Inter"));
        assert!(merged.bible_mode);
        assert_eq!(merged.bible_version_id.as_deref(), Some("kjv"));
    }

    #[test]
    fn close_all_clears_every_index() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let id = registry.register_connection(tx);
        registry.create_session(id, test_session(id, "e1")).unwrap();

        registry.close_all();
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.connections_for_event("e1").is_empty());
    }
}
