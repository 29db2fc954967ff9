//! LyricLine Core - shared library for the LyricLine live-lyric-follow
//! session server.
//!
//! A WebSocket session server that ingests a live speech-to-text transcript
//! and tells connected display clients which slide of which song to show,
//! following along with what's actually being sung or spoken rather than
//! requiring a human operator to advance slides manually.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`follow`]: the session follow pipeline — the heart of the system
//! - [`matcher`]: fuzzy line/song matching against a live transcript buffer
//! - [`registry`]: per-connection session state and the event→connections index
//! - [`messages`]: the wire message schema and frame validator
//! - [`slides`]: the pure lyrics-to-slides compiler
//! - [`adapters`]: trait contracts to the external setlist store and STT vendor
//! - [`rate_limiter`]: per-connection sliding-window rate limiting
//! - [`state`]: tunable runtime configuration
//! - [`error`]: the stable error code taxonomy
//! - [`api`]: the Axum WebSocket transport and HTTP server startup
//! - [`bootstrap`]: the composition root wiring everything together
//!
//! [`follow::FollowPipeline`] is the single entry point the transport layer
//! calls for every inbound client message, and knows nothing about
//! WebSockets, Axum, or Tokio's networking stack.

pub mod adapters;
pub mod api;
pub mod bootstrap;
pub mod error;
pub mod follow;
pub mod matcher;
pub mod messages;
pub mod protocol_constants;
pub mod rate_limiter;
pub mod registry;
pub mod slides;
pub mod state;
pub mod utils;

pub use adapters::{
    ChunkSttProvider, EventSnapshot, MockSetlistLoader, NullSttProvider, SetlistLoader, SttErrorSink, SttProvider,
    StreamingSttHandle, StreamingSttProvider, TranscriptMode, TranscriptSink, TranscriptUpdate,
};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use error::{ErrorCode, FollowError, SetlistLoadError, SttAdapterError};
pub use follow::FollowPipeline;
pub use matcher::{MatcherConfig, SongContext};
pub use messages::{ClientMessage, EventId, EventSettings, ServerMessage, SessionId, Timing, UpdateEventSettingsPayload};
pub use rate_limiter::{RateLimitRule, RateLimitState};
pub use registry::{ConnectionId, Session, SessionRegistry};
pub use slides::{compile, compile_song, Slide, SlideCompileConfig, Song};
pub use state::Config;

pub use api::{start_server, AppState, ServerError};
