//! WebSocket handler for the live-lyric-follow session protocol.
//!
//! A thin transport shim: parse inbound JSON text frames, rate-limit them,
//! hand them to [`FollowPipeline::dispatch`], and forward whatever the
//! pipeline and the broadcast fabric push onto this connection's outbound
//! channel back out over the socket. All session-state decisions live in
//! [`crate::follow`] — this module owns connection lifecycle only and
//! delegates everything else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::error::FollowError;
use crate::messages::{parse_client_message, ServerMessage, Timing};
use crate::protocol_constants::{client_message_type, HEARTBEAT_TICK_SECS};
use crate::rate_limiter::RateLimitState;
use crate::registry::ConnectionId;
use crate::utils::now_millis;

/// Which of the two rate-limiter budgets a frame consumes.
enum MessageKind {
    Audio,
    Control,
}

/// Sniffs the `type` field without fully validating the frame, so a
/// would-be `AUDIO_DATA` frame is charged to the audio budget even if it
/// later turns out to be malformed. Anything else — including frames that
/// aren't even valid JSON — is charged to the control budget, where
/// `parse_client_message` reports the precise validation failure.
fn sniff_message_kind(raw: &str) -> MessageKind {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.get("type").and_then(Value::as_str) == Some(client_message_type::AUDIO_DATA) => {
            MessageKind::Audio
        }
        _ => MessageKind::Control,
    }
}

/// Fills in the telemetry-only `timing` block — never a control input — for
/// any outbound message whose handler left it unset. `received_at_ms` is the
/// receive time of the most
/// recent inbound frame on this connection, used as a reasonable proxy for
/// "what this reply is responding to" even for messages that arrive via the
/// broadcast fabric rather than as a direct reply.
fn stamp_timing(message: ServerMessage, received_at_ms: u64) -> ServerMessage {
    let sent_at_ms = now_millis();
    let timing = Timing {
        server_received_at: received_at_ms,
        server_sent_at: sent_at_ms,
        processing_time_ms: sent_at_ms.saturating_sub(received_at_ms),
    };

    match message {
        ServerMessage::SessionStarted { timing: None, .. } => with_timing(message, timing),
        ServerMessage::EventSettingsUpdated { timing: None, .. } => with_timing(message, timing),
        ServerMessage::TranscriptUpdate { timing: None, .. } => with_timing(message, timing),
        ServerMessage::DisplayUpdate { timing: None, .. } => with_timing(message, timing),
        ServerMessage::SongChanged { timing: None, .. } => with_timing(message, timing),
        ServerMessage::SongSuggestion { timing: None, .. } => with_timing(message, timing),
        ServerMessage::SessionEnded { timing: None, .. } => with_timing(message, timing),
        ServerMessage::Pong { timing: None, .. } => with_timing(message, timing),
        other => other,
    }
}

/// Sets the `timing` field on a `ServerMessage` already known to have it
/// unset. Kept separate from `stamp_timing`'s match so each arm above stays
/// a one-liner.
fn with_timing(message: ServerMessage, timing: Timing) -> ServerMessage {
    match message {
        ServerMessage::SessionStarted {
            session_id,
            event_id,
            event_name,
            total_songs,
            current_song_index,
            current_slide_index,
            setlist,
            initial_display,
            ..
        } => ServerMessage::SessionStarted {
            session_id,
            event_id,
            event_name,
            total_songs,
            current_song_index,
            current_slide_index,
            setlist,
            initial_display,
            timing: Some(timing),
        },
        ServerMessage::EventSettingsUpdated { settings, .. } => {
            ServerMessage::EventSettingsUpdated { settings, timing: Some(timing) }
        }
        ServerMessage::TranscriptUpdate { text, is_final, confidence, .. } => ServerMessage::TranscriptUpdate {
            text,
            is_final,
            confidence,
            timing: Some(timing),
        },
        ServerMessage::DisplayUpdate {
            line_text,
            slide_text,
            slide_lines,
            slide_index,
            line_index,
            song_id,
            song_title,
            match_confidence,
            is_auto_advance,
            ..
        } => ServerMessage::DisplayUpdate {
            line_text,
            slide_text,
            slide_lines,
            slide_index,
            line_index,
            song_id,
            song_title,
            match_confidence,
            is_auto_advance,
            timing: Some(timing),
        },
        ServerMessage::SongChanged { song_id, song_title, song_index, total_slides, .. } => ServerMessage::SongChanged {
            song_id,
            song_title,
            song_index,
            total_slides,
            timing: Some(timing),
        },
        ServerMessage::SongSuggestion {
            suggested_song_id,
            suggested_song_title,
            suggested_song_index,
            confidence,
            matched_line,
            ..
        } => ServerMessage::SongSuggestion {
            suggested_song_id,
            suggested_song_title,
            suggested_song_index,
            confidence,
            matched_line,
            timing: Some(timing),
        },
        ServerMessage::SessionEnded { session_id, reason, .. } => ServerMessage::SessionEnded {
            session_id,
            reason,
            timing: Some(timing),
        },
        ServerMessage::Pong { timestamp, .. } => ServerMessage::Pong { timestamp, timing: Some(timing) },
        other => other,
    }
}

/// Entry point wired into the router.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Sends one `ERROR` frame to `connection_id` via the registry's outbound
/// channel, so errors raised before a session exists still reach the client.
fn send_error(state: &AppState, connection_id: ConnectionId, err: &FollowError) {
    state.pipeline.registry().send_to(connection_id, err.to_ws_message());
}

async fn handle_inbound_frame(
    state: &AppState,
    connection_id: ConnectionId,
    rate_limits: &RateLimitState,
    last_received_at: &AtomicU64,
    raw: &str,
) {
    let now = now_millis();
    last_received_at.store(now, Ordering::Relaxed);

    let kind = sniff_message_kind(raw);
    let within_budget = match kind {
        MessageKind::Audio => rate_limits.try_acquire_audio(now, &state.audio_rate_rule),
        MessageKind::Control => rate_limits.try_acquire_control(now, &state.control_rate_rule),
    };
    if !within_budget {
        let kind_label = match kind {
            MessageKind::Audio => "audio",
            MessageKind::Control => "control",
        };
        send_error(state, connection_id, &FollowError::RateLimited { kind: kind_label });
        return;
    }

    let message = match parse_client_message(raw) {
        Ok(message) => message,
        Err(err) => {
            send_error(state, connection_id, &err);
            return;
        }
    };

    if let Err(err) = state.pipeline.dispatch(connection_id, message).await {
        send_error(state, connection_id, &err);
    }
}

/// Main WebSocket connection handler: one `tokio::select!` loop per
/// connection driving inbound frames, this connection's outbound channel,
/// and a heartbeat tick used for rate-limiter bookkeeping.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let conn_guard = state.ws_manager.register();
    let force_close = conn_guard.cancel_token().clone();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection_id = state.pipeline.registry().register_connection(outbound_tx);
    let rate_limits = RateLimitState::new();
    let last_received_at = AtomicU64::new(now_millis());

    log::info!("[WS] connection {} established ({})", connection_id, conn_guard.id());

    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_TICK_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = force_close.cancelled() => {
                log::info!("[WS] connection {} force-closed", connection_id);
                break;
            }
            _ = state.cancel_token.cancelled() => {
                log::info!("[WS] connection {} closing for server shutdown", connection_id);
                break;
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(message) => {
                        let received_at = last_received_at.load(Ordering::Relaxed);
                        let message = stamp_timing(message, received_at);
                        let Ok(json) = serde_json::to_string(&message) else { continue };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_frame(&state, connection_id, &rate_limits, &last_received_at, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {}
        }
    }

    state.pipeline.handle_disconnect(connection_id).await;
    log::info!("[WS] connection {} closed", connection_id);
}
