//! Session follow pipeline. The heart of the system.
//!
//! Per session: ingests transcript updates, maintains the rolling buffer,
//! invokes the matcher, applies debouncing and cooldowns, enforces
//! forward-only slide motion, and owns the streaming-STT handle lifecycle.
//! [`FollowPipeline::dispatch`] is the single entry point the transport layer
//! calls for every inbound frame, matched as an explicit variant against one
//! dispatch surface.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use uuid::Uuid;

use crate::adapters::{
    SetlistLoader, SttErrorSink, SttProvider, StreamingSttProvider, TranscriptMode, TranscriptSink, TranscriptUpdate,
};
use crate::error::{FollowError, SttAdapterError};
use crate::matcher::{clean_buffer, find_best_match_across_all_songs, AdvanceReason, MatchResult, MatcherConfig, SongContext, SuggestedSongSwitch};
use crate::messages::{
    AudioDataPayload, ClientMessage, ManualOverridePayload, OverrideAction, ServerMessage, SessionEndReason,
    UpdateEventSettingsPayload,
};
use crate::protocol_constants::DELTA_BUFFER_MAX_WORDS;
use crate::registry::{ConnectionId, EndTriggerState, PendingSwitchCandidate, Session, SessionRegistry, SttHandleEntry};
use crate::slides::Song;
use crate::state::Config;
use crate::utils::now_millis;

struct FollowPipelineInner {
    registry: Arc<SessionRegistry>,
    setlist_loader: Arc<dyn SetlistLoader>,
    stt_provider: SttProvider,
    config: Config,
}

/// Cheaply cloneable handle to the follow pipeline; clones share the same
/// registry, config, and collaborator adapters. Cloned into transcript/error
/// callbacks so the STT adapter can drive matching without knowing anything
/// about sessions.
#[derive(Clone)]
pub struct FollowPipeline(Arc<FollowPipelineInner>);

impl FollowPipeline {
    pub fn new(
        registry: Arc<SessionRegistry>,
        setlist_loader: Arc<dyn SetlistLoader>,
        stt_provider: SttProvider,
        config: Config,
    ) -> Self {
        Self(Arc::new(FollowPipelineInner {
            registry,
            setlist_loader,
            stt_provider,
            config,
        }))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.0.registry
    }

    /// Single dispatch surface for every inbound client message.
    pub async fn dispatch(&self, connection_id: ConnectionId, message: ClientMessage) -> Result<(), FollowError> {
        match message {
            ClientMessage::StartSession { payload } => self.handle_start_session(connection_id, &payload.event_id).await,
            ClientMessage::UpdateEventSettings { payload } => self.handle_update_event_settings(connection_id, &payload),
            ClientMessage::AudioData { payload } => self.handle_audio_data(connection_id, &payload).await,
            ClientMessage::ManualOverride { payload } => self.handle_manual_override(connection_id, &payload),
            ClientMessage::StopSession => {
                self.handle_stop_session(connection_id).await;
                Ok(())
            }
            ClientMessage::Ping => {
                self.handle_ping(connection_id);
                Ok(())
            }
        }
    }

    /// Disconnect cleanup — same release semantics as an explicit
    /// `STOP_SESSION`, minus the `SESSION_ENDED` reply. A session is
    /// destroyed on connection close.
    pub async fn handle_disconnect(&self, connection_id: ConnectionId) {
        let Some(session_arc) = self.0.registry.unregister_connection(connection_id) else {
            return;
        };
        let (event_id, was_subscribed) = {
            let session = session_arc.lock();
            (session.event_id.clone(), session.stt_subscribed)
        };
        if was_subscribed {
            self.release_stt_subscription(&event_id).await;
        }
    }

    async fn handle_start_session(&self, connection_id: ConnectionId, event_id: &str) -> Result<(), FollowError> {
        if self.0.registry.has_session(connection_id) {
            let err = FollowError::SessionExists;
            self.0.registry.send_to(connection_id, err.to_ws_message());
            return Err(err);
        }

        if !crate::messages::is_valid_id(event_id) {
            let err = FollowError::ValidationError(format!("eventId {event_id:?} is not a valid opaque, URL-safe id"));
            self.0.registry.send_to(connection_id, err.to_ws_message());
            return Err(err);
        }

        let snapshot = match self.0.setlist_loader.load_event(event_id).await {
            Ok(snapshot) => snapshot,
            Err(load_err) => {
                let err: FollowError = load_err.into();
                self.0.registry.send_to(connection_id, err.to_ws_message());
                return Err(err);
            }
        };

        if snapshot.setlist.is_empty() {
            let err = FollowError::EmptySetlist(event_id.to_string());
            self.0.registry.send_to(connection_id, err.to_ws_message());
            return Err(err);
        }

        let setlist = Arc::new(snapshot.setlist);

        let (song_index, slide_index, line_index, rolling_buffer, last_confidence) =
            match self.0.registry.existing_session_for_event(event_id, connection_id) {
                Some(existing) => {
                    let existing = existing.lock();
                    (
                        existing.current_song_index,
                        existing.current_slide_index,
                        existing.current_line_index,
                        existing.rolling_buffer.clone(),
                        existing.last_match_confidence,
                    )
                }
                None => (0, 0, 0, String::new(), None),
            };

        let song_context = SongContext::new(&setlist[song_index], line_index);
        let matcher_config = MatcherConfig::new(
            self.0.config.matcher_similarity_threshold,
            self.0.config.matcher_min_buffer_words,
            self.0.config.matcher_buffer_window,
            self.0.config.use_bigram_end_of_slide,
            false,
        );

        let session_id = Uuid::new_v4().to_string();
        let session = Session {
            connection_id,
            session_id: session_id.clone(),
            event_id: event_id.to_string(),
            event_name: snapshot.event_name.clone(),
            setlist: setlist.clone(),
            current_song_index: song_index,
            current_slide_index: slide_index,
            current_line_index: line_index,
            rolling_buffer,
            auto_following: true,
            matcher_config,
            song_context,
            pending_switch: None,
            end_trigger: EndTriggerState::default(),
            last_switch_at_ms: None,
            last_match_confidence: last_confidence,
            stt_subscribed: false,
        };

        self.0.registry.create_session(connection_id, session)?;

        let display = {
            let session_arc = self.0.registry.get(connection_id).expect("just created");
            let session = session_arc.lock();
            Self::display_update_for(&session, false)
        };

        self.0.registry.send_to(
            connection_id,
            ServerMessage::SessionStarted {
                session_id,
                event_id: event_id.to_string(),
                event_name: snapshot.event_name,
                total_songs: setlist.len(),
                current_song_index: song_index,
                current_slide_index: slide_index,
                setlist: (*setlist).clone(),
                initial_display: Some(Box::new(display.clone())),
                timing: None,
            },
        );
        self.0.registry.send_to(connection_id, display);

        let settings = self.0.registry.event_settings_for(event_id);
        self.0.registry.send_to(connection_id, ServerMessage::EventSettingsUpdated { settings, timing: None });

        Ok(())
    }

    fn handle_update_event_settings(&self, connection_id: ConnectionId, payload: &UpdateEventSettingsPayload) -> Result<(), FollowError> {
        let session_arc = self.0.registry.get(connection_id).ok_or(FollowError::NoSession)?;
        let event_id = session_arc.lock().event_id.clone();
        let settings = self.0.registry.merge_event_settings(&event_id, payload);
        self.0.registry.broadcast(&event_id, ServerMessage::EventSettingsUpdated { settings, timing: None });
        Ok(())
    }

    async fn handle_audio_data(&self, connection_id: ConnectionId, payload: &AudioDataPayload) -> Result<(), FollowError> {
        let session_arc = self.0.registry.get(connection_id).ok_or(FollowError::NoSession)?;
        let event_id = session_arc.lock().event_id.clone();

        let data = BASE64
            .decode(&payload.data)
            .map_err(|e| FollowError::ValidationError(format!("invalid base64 audio data: {e}")))?;

        match self.0.stt_provider.clone() {
            SttProvider::Chunk(provider) => {
                let transcript = provider
                    .transcribe(Bytes::from(data), payload.format.clone())
                    .await
                    .map_err(FollowError::from)?;
                if let Some(transcript) = transcript {
                    self.process_transcript(&event_id, transcript);
                }
                Ok(())
            }
            SttProvider::Streaming(provider) => {
                if let Some(required) = provider.required_audio_format() {
                    if let Some(observed) = &payload.format {
                        if observed != &required {
                            return Err(FollowError::AudioFormatUnsupported {
                                observed: observed.to_string(),
                                expected: required.to_string(),
                            });
                        }
                    }
                }

                let entry = self.ensure_stt_handle(&event_id, provider.clone()).await?;
                let entry = self.maybe_restart_stale_handle(&event_id, provider, entry).await?;
                entry.mark_driving(connection_id);
                entry.handle.send_audio(Bytes::from(data)).await.map_err(FollowError::from)?;

                let mut session = session_arc.lock();
                if !session.stt_subscribed {
                    entry.subscribe();
                    session.stt_subscribed = true;
                }
                Ok(())
            }
        }
    }

    fn handle_manual_override(&self, connection_id: ConnectionId, payload: &ManualOverridePayload) -> Result<(), FollowError> {
        let session_arc = self.0.registry.get(connection_id).ok_or(FollowError::NoSession)?;
        let mut session = session_arc.lock();

        let (target_song_index, target_slide_index) = Self::resolve_override_target(&session, payload)?;

        if target_song_index == session.current_song_index && target_slide_index == session.current_slide_index {
            return Ok(());
        }

        let song_changed = target_song_index != session.current_song_index;
        if song_changed {
            session.rolling_buffer.clear();
            session.pending_switch = None;
            session.auto_following = false;
        }

        let song = session.setlist[target_song_index].clone();
        let first_line = song
            .slides
            .as_ref()
            .and_then(|slides| slides.get(target_slide_index))
            .map(|slide| slide.start_line)
            .unwrap_or(0);

        session.current_song_index = target_song_index;
        session.current_slide_index = target_slide_index;
        session.current_line_index = first_line;
        session.song_context = SongContext::new(&song, first_line);
        session.end_trigger = EndTriggerState::default();

        if song_changed {
            self.0.registry.broadcast(
                &session.event_id,
                ServerMessage::SongChanged {
                    song_id: song.id.clone(),
                    song_title: song.title.clone(),
                    song_index: target_song_index,
                    total_slides: song.slides.as_ref().map(|s| s.len()).unwrap_or(song.lines.len()),
                    timing: None,
                },
            );
        }

        let display = Self::display_update_for(&session, false);
        self.0.registry.broadcast(&session.event_id, display);

        Ok(())
    }

    async fn handle_stop_session(&self, connection_id: ConnectionId) {
        let Some(session_arc) = self.0.registry.remove_session(connection_id) else {
            return;
        };
        let (event_id, session_id, was_subscribed) = {
            let session = session_arc.lock();
            (session.event_id.clone(), session.session_id.clone(), session.stt_subscribed)
        };
        if was_subscribed {
            self.release_stt_subscription(&event_id).await;
        }
        self.0.registry.send_to(
            connection_id,
            ServerMessage::SessionEnded {
                session_id,
                reason: SessionEndReason::UserStopped,
                timing: None,
            },
        );
    }

    fn handle_ping(&self, connection_id: ConnectionId) {
        self.0.registry.send_to(connection_id, ServerMessage::Pong { timestamp: now_millis(), timing: None });
    }

    fn resolve_override_target(session: &Session, payload: &ManualOverridePayload) -> Result<(usize, usize), FollowError> {
        match payload.action {
            OverrideAction::NextSlide => {
                let song = session.current_song();
                let total_slides = song.slides.as_ref().map(|s| s.len()).unwrap_or(song.lines.len());
                if session.current_slide_index + 1 < total_slides {
                    Ok((session.current_song_index, session.current_slide_index + 1))
                } else if session.current_song_index + 1 < session.setlist.len() {
                    Ok((session.current_song_index + 1, 0))
                } else {
                    // Boundary: NEXT_SLIDE at the last slide of the last song is a no-op.
                    Ok((session.current_song_index, session.current_slide_index))
                }
            }
            OverrideAction::PrevSlide => {
                if session.current_slide_index > 0 {
                    Ok((session.current_song_index, session.current_slide_index - 1))
                } else if session.current_song_index > 0 {
                    let prev_song = &session.setlist[session.current_song_index - 1];
                    let last_slide = prev_song.slides.as_ref().map(|s| s.len().saturating_sub(1)).unwrap_or(0);
                    Ok((session.current_song_index - 1, last_slide))
                } else {
                    Ok((session.current_song_index, session.current_slide_index))
                }
            }
            OverrideAction::GoToSlide => {
                let slide_index = payload
                    .slide_index
                    .ok_or_else(|| FollowError::ValidationError("slideIndex required for GO_TO_SLIDE".to_string()))?;
                let song = session.current_song();
                let total_slides = song.slides.as_ref().map(|s| s.len()).unwrap_or(song.lines.len());
                if slide_index >= total_slides {
                    return Err(FollowError::ValidationError("slideIndex out of range".to_string()));
                }
                Ok((session.current_song_index, slide_index))
            }
            OverrideAction::GoToItem => {
                let item_index = payload
                    .item_index
                    .or_else(|| payload.item_id.as_ref().and_then(|id| session.setlist.iter().position(|s| &s.id == id)))
                    .ok_or_else(|| FollowError::ValidationError("itemIndex or itemId required for GO_TO_ITEM".to_string()))?;
                if item_index >= session.setlist.len() {
                    return Err(FollowError::ValidationError("itemIndex out of range".to_string()));
                }
                Ok((item_index, 0))
            }
        }
    }

    fn display_update_for(session: &Session, is_auto_advance: bool) -> ServerMessage {
        let song = session.current_song();
        let slide = song.slides.as_ref().and_then(|slides| slides.get(session.current_slide_index));
        ServerMessage::DisplayUpdate {
            line_text: song.lines.get(session.current_line_index).cloned().unwrap_or_default(),
            slide_text: slide.map(|s| s.slide_text.clone()),
            slide_lines: slide.map(|s| s.lines.clone()),
            slide_index: session.current_slide_index,
            line_index: Some(session.current_line_index),
            song_id: song.id.clone(),
            song_title: song.title.clone(),
            match_confidence: session.last_match_confidence,
            is_auto_advance,
            timing: None,
        }
    }

    /// Process one transcript observation for every session bound to
    /// `event_id`. Called either inline (chunk providers) or from a
    /// streaming handle's transcript callback — the latter may be invoked
    /// from a different connection's audio frame than the one observing the
    /// resulting broadcasts, since a streaming handle can be shared across
    /// every session bound to the same event.
    fn process_transcript(&self, event_id: &str, transcript: TranscriptUpdate) {
        if let Some(entry) = self.0.registry.stt_handle_for_event(event_id) {
            entry.last_transcript_at_ms.store(now_millis(), Ordering::SeqCst);
        }

        self.0.registry.broadcast(
            event_id,
            ServerMessage::TranscriptUpdate {
                text: transcript.text.clone(),
                is_final: transcript.is_final,
                confidence: transcript.confidence,
                timing: None,
            },
        );

        let should_match = transcript.is_final || self.0.config.allow_partial_matching;
        if !should_match {
            return;
        }

        let mode = match &self.0.stt_provider {
            SttProvider::Streaming(provider) => provider.transcript_mode(),
            SttProvider::Chunk(_) => TranscriptMode::Delta,
        };

        for connection_id in self.0.registry.connections_for_event(event_id) {
            if let Some(session_arc) = self.0.registry.get(connection_id) {
                let mut session = session_arc.lock();
                if !session.auto_following {
                    continue;
                }
                self.apply_transcript_to_session(&mut session, &transcript, mode);
            }
        }
    }

    fn apply_transcript_to_session(&self, session: &mut Session, transcript: &TranscriptUpdate, mode: TranscriptMode) {
        match mode {
            TranscriptMode::Cumulative => {
                session.rolling_buffer = transcript.text.clone();
            }
            TranscriptMode::Delta => {
                if session.rolling_buffer.is_empty() {
                    session.rolling_buffer = transcript.text.clone();
                } else {
                    session.rolling_buffer.push(' ');
                    session.rolling_buffer.push_str(&transcript.text);
                }
                let words: Vec<&str> = session.rolling_buffer.split_whitespace().collect();
                if words.len() > DELTA_BUFFER_MAX_WORDS {
                    let start = words.len() - DELTA_BUFFER_MAX_WORDS;
                    session.rolling_buffer = words[start..].join(" ");
                }
            }
        }

        let cleaned = clean_buffer(&session.rolling_buffer);
        let song_index = session.current_song_index;
        let others: Vec<(&Song, usize)> = session
            .setlist
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != song_index)
            .map(|(i, s)| (s, i))
            .collect();

        let match_result = find_best_match_across_all_songs(&cleaned, &session.song_context, &others, &session.matcher_config);
        session.last_match_confidence = Some(match_result.current.confidence);

        let now_ms = now_millis();
        self.process_suggested_switch(session, &match_result.suggested_song_switch, now_ms);
        self.process_advance(session, &match_result.current, now_ms);
    }

    fn process_suggested_switch(&self, session: &mut Session, suggestion: &Option<SuggestedSongSwitch>, now_ms: u64) {
        let Some(candidate) = suggestion else {
            session.pending_switch = None;
            return;
        };

        let hits = match &session.pending_switch {
            Some(pending) if pending.song_index == candidate.song_index => pending.hits + 1,
            _ => 1,
        };
        session.pending_switch = Some(PendingSwitchCandidate {
            song_index: candidate.song_index,
            song_id: candidate.song_id.clone(),
            hits,
        });

        if hits < self.0.config.song_switch_debounce_matches {
            return;
        }

        if let Some(last) = session.last_switch_at_ms {
            if now_ms.saturating_sub(last) < self.0.config.song_switch_cooldown_ms {
                return;
            }
        }

        if candidate.confidence < self.0.config.song_switch_auto_floor {
            self.0.registry.send_to(
                session.connection_id,
                ServerMessage::SongSuggestion {
                    suggested_song_id: candidate.song_id.clone(),
                    suggested_song_title: candidate.song_title.clone(),
                    suggested_song_index: candidate.song_index,
                    confidence: candidate.confidence,
                    matched_line: candidate.matched_line.clone(),
                    timing: None,
                },
            );
            return;
        }

        let song = session.setlist[candidate.song_index].clone();
        session.current_song_index = candidate.song_index;
        session.current_line_index = candidate.matched_line_index;
        session.current_slide_index = song
            .line_to_slide_index
            .as_ref()
            .and_then(|mapping| mapping.get(candidate.matched_line_index).copied())
            .unwrap_or(0);
        session.song_context = SongContext::new(&song, candidate.matched_line_index);
        session.rolling_buffer.clear();
        session.pending_switch = None;
        session.end_trigger = EndTriggerState::default();
        session.last_switch_at_ms = Some(now_ms);

        self.0.registry.broadcast(
            &session.event_id,
            ServerMessage::SongChanged {
                song_id: song.id.clone(),
                song_title: song.title.clone(),
                song_index: candidate.song_index,
                total_slides: song.slides.as_ref().map(|s| s.len()).unwrap_or(song.lines.len()),
                timing: None,
            },
        );
        let display = Self::display_update_for(session, true);
        self.0.registry.broadcast(&session.event_id, display);
    }

    fn process_advance(&self, session: &mut Session, result: &MatchResult, now_ms: u64) {
        if !result.match_found {
            return;
        }

        let matched_line_index = if result.is_line_end {
            result.next_line_index.unwrap_or(result.line_index)
        } else {
            result.line_index
        };

        if result.advance_reason == Some(AdvanceReason::EndWords) {
            let same_line = session.end_trigger.line_index == Some(result.line_index);
            let within_window = now_ms.saturating_sub(session.end_trigger.first_hit_at_ms) <= self.0.config.end_trigger_debounce_window_ms;

            if same_line && within_window {
                session.end_trigger.hits += 1;
            } else {
                session.end_trigger.hits = 1;
                session.end_trigger.line_index = Some(result.line_index);
                session.end_trigger.first_hit_at_ms = now_ms;
            }

            if session.end_trigger.hits < self.0.config.end_trigger_debounce_matches {
                return;
            }
        } else if !result.is_line_end {
            // A plain same-line match without an end-trigger resets the
            // debounce window so a later end-words hit starts fresh.
            session.end_trigger = EndTriggerState::default();
        }

        let song = session.current_song().clone();
        let new_slide_index = song
            .line_to_slide_index
            .as_ref()
            .and_then(|mapping| mapping.get(matched_line_index).copied())
            .unwrap_or(session.current_slide_index);

        // Forward-only protection.
        if new_slide_index < session.current_slide_index {
            return;
        }

        session.current_line_index = matched_line_index;
        session.song_context = session.song_context.with_line_index(matched_line_index);

        let slide_changed = new_slide_index != session.current_slide_index;
        session.current_slide_index = new_slide_index;

        if slide_changed {
            let display = Self::display_update_for(session, true);
            self.0.registry.broadcast(&session.event_id, display);
            session.rolling_buffer = song.lines.get(matched_line_index).cloned().unwrap_or_default();
            session.end_trigger = EndTriggerState::default();
        }
    }

    async fn ensure_stt_handle(&self, event_id: &str, provider: Arc<dyn StreamingSttProvider>) -> Result<Arc<SttHandleEntry>, FollowError> {
        if let Some(entry) = self.0.registry.stt_handle_for_event(event_id) {
            return Ok(entry);
        }
        let entry = self.open_streaming_handle(event_id, provider).await?;
        self.0.registry.install_stt_handle(event_id.to_string(), entry.clone());
        Ok(entry)
    }

    async fn maybe_restart_stale_handle(
        &self,
        event_id: &str,
        provider: Arc<dyn StreamingSttProvider>,
        entry: Arc<SttHandleEntry>,
    ) -> Result<Arc<SttHandleEntry>, FollowError> {
        let now_ms = now_millis();
        let last_transcript = entry.last_transcript_at_ms.load(Ordering::SeqCst);
        let last_restart = entry.last_restart_at_ms.load(Ordering::SeqCst);

        let stale = now_ms.saturating_sub(last_transcript) >= self.0.config.stt_stale_ms;
        let cooldown_elapsed = now_ms.saturating_sub(last_restart) >= self.0.config.stt_restart_cooldown_ms;

        if !(stale && cooldown_elapsed) {
            return Ok(entry);
        }

        entry.handle.close().await;
        let subscriber_count = entry.subscriber_count();
        let replacement = self.open_streaming_handle(event_id, provider).await?;
        replacement.last_restart_at_ms.store(now_ms, Ordering::SeqCst);
        for _ in 0..subscriber_count {
            replacement.subscribe();
        }
        self.0.registry.install_stt_handle(event_id.to_string(), replacement.clone());
        Ok(replacement)
    }

    async fn open_streaming_handle(&self, event_id: &str, provider: Arc<dyn StreamingSttProvider>) -> Result<Arc<SttHandleEntry>, FollowError> {
        let on_transcript: TranscriptSink = {
            let pipeline = self.clone();
            let event_id = event_id.to_string();
            Arc::new(move |transcript| pipeline.process_transcript(&event_id, transcript))
        };
        let on_error: SttErrorSink = {
            let pipeline = self.clone();
            let event_id = event_id.to_string();
            Arc::new(move |err| pipeline.handle_stt_error(&event_id, err))
        };

        let handle = provider.open(on_transcript, on_error).await.map_err(FollowError::from)?;
        Ok(Arc::new(SttHandleEntry::new(handle, now_millis())))
    }

    /// Stream-level STT failure: notify the driving session and
    /// force the watchdog to restart the handle on the next audio frame.
    fn handle_stt_error(&self, event_id: &str, err: SttAdapterError) {
        if let Some(entry) = self.0.registry.stt_handle_for_event(event_id) {
            entry.last_transcript_at_ms.store(0, Ordering::SeqCst);
            if let Some(driving) = entry.driving_connection() {
                let follow_err: FollowError = err.into();
                self.0.registry.send_to(driving, follow_err.to_ws_message());
            }
        }
    }

    async fn release_stt_subscription(&self, event_id: &str) {
        if let Some(entry) = self.0.registry.stt_handle_for_event(event_id) {
            if entry.unsubscribe() == 0 {
                self.0.registry.remove_stt_handle(event_id);
                entry.handle.close().await;
            }
        }
    }
}
