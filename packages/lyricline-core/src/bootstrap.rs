//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. This pattern provides:
//!
//! - **Clarity**: All dependency relationships are visible in one place
//! - **Testability**: Easy to swap implementations for testing
//! - **Maintainability**: Service creation logic is isolated from usage

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::adapters::{MockSetlistLoader, SetlistLoader, SttProvider};
use crate::api::ws_connection::WsConnectionManager;
use crate::error::{ErrorCode, FollowError};
use crate::follow::FollowPipeline;
use crate::rate_limiter::{RateLimitRule, RateLimitState};
use crate::registry::SessionRegistry;
use crate::state::Config;

/// Container for all bootstrapped services.
///
/// This struct holds all the wired services created during bootstrap. It's
/// consumed by [`crate::api::AppState`] to build the final application
/// state.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// The session follow pipeline — the single dispatch surface for every
    /// inbound client message.
    pub pipeline: FollowPipeline,
    /// Control-message rate-limit rule, derived from [`Config`].
    pub control_rate_rule: RateLimitRule,
    /// Audio-frame rate-limit rule, derived from [`Config`].
    pub audio_rate_rule: RateLimitRule,
    /// Manages WebSocket connections for graceful force-close on shutdown.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Initiates graceful shutdown of all services (spec §4.7 ambient note).
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        let closed = self.ws_manager.close_all();
        self.pipeline.registry().close_all();
        log::info!("[Bootstrap] Force-closed {} connection(s)", closed);
        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Builds the [`SetlistLoader`] configured for this run.
///
/// Real external setlist-store integration is out of scope for this crate:
/// the only adapter shipped here is the in-memory [`MockSetlistLoader`],
/// gated behind the `fallback_to_mock_setlist` knob so a misconfigured
/// server fails loudly rather than silently serving fixtures.
fn build_setlist_loader(config: &Config) -> Result<Arc<dyn SetlistLoader>, FollowError> {
    if config.fallback_to_mock_setlist {
        log::warn!("[Bootstrap] fallback_to_mock_setlist enabled — serving the in-memory fixture setlist");
        Ok(Arc::new(MockSetlistLoader::new()))
    } else {
        Err(FollowError::Internal(
            "no setlist loader configured: enable fallback_to_mock_setlist or wire a real \
             SetlistLoader before calling bootstrap_services"
                .to_string(),
        ))
    }
}

/// Bootstraps all application services with their dependencies.
///
/// This is the composition root where all services are instantiated and
/// wired together:
///
/// 1. Session registry (the shared connection/session index)
/// 2. Setlist loader (external collaborator adapter)
/// 3. STT provider (external collaborator adapter, injected by the caller
///    since the server binary is the one place that knows which vendor is
///    configured)
/// 4. The follow pipeline itself, composed from the above
/// 5. Rate-limit rules derived from the tunable `Config`
/// 6. Connection tracking and the shutdown cancellation token
///
/// # Errors
///
/// Returns [`FollowError::Internal`] if no setlist loader can be configured.
pub fn bootstrap_services(config: Config, stt_provider: SttProvider) -> Result<BootstrappedServices, FollowError> {
    let registry = Arc::new(SessionRegistry::new());
    let setlist_loader = build_setlist_loader(&config)?;

    let control_rate_rule = RateLimitRule::new(
        std::time::Duration::from_millis(config.control_rate_window_ms),
        config.control_rate_limit,
    );
    let audio_rate_rule = RateLimitRule::new(
        std::time::Duration::from_millis(config.audio_rate_window_ms),
        config.audio_rate_limit,
    );

    let pipeline = FollowPipeline::new(registry, setlist_loader, stt_provider, config);

    let ws_manager = Arc::new(WsConnectionManager::new());
    let cancel_token = CancellationToken::new();

    Ok(BootstrappedServices {
        pipeline,
        control_rate_rule,
        audio_rate_rule,
        ws_manager,
        cancel_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::NullSttProvider;

    fn null_stt() -> SttProvider {
        SttProvider::Chunk(Arc::new(NullSttProvider))
    }

    #[test]
    fn bootstrap_fails_without_a_configured_setlist_loader() {
        let config = Config::default();
        let err = bootstrap_services(config, null_stt()).unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn bootstrap_succeeds_with_mock_setlist_fallback_enabled() {
        let config = Config {
            fallback_to_mock_setlist: true,
            ..Config::default()
        };
        let services = bootstrap_services(config, null_stt()).unwrap();
        assert_eq!(services.pipeline.registry().connection_count(), 0);
    }
}
