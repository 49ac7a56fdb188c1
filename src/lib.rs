mod commands;
pub use commands::{CommandGateway, PlaybackCommand};
pub mod credentials;
pub use credentials::{
    Credential, CredentialCache, RefreshTokenExchanger, TokenExchanger, TokenGrant,
};
mod error;
pub use error::{AuthError, ConfigError, ControlError, FetchError, MessagingError, SyncError};
mod events;
pub use events::SyncEvent;
mod messaging;
pub use messaging::{DiscordSurface, MessagingSurface};
pub mod models;
pub use models::{Channel, Message, MessagePayload};
mod playback;
pub use playback::{Playback, PlaybackSource, PlaybackState, SpotifyPlayer};
pub mod render;
pub mod scheduler;
pub use scheduler::{CycleOutcome, PollHandle, ScheduleConfig, ScheduleState, Scheduler};
mod settings;
pub use settings::{Settings, SpotifyCredentials};
mod state;
pub use state::EngineState;
mod sync;
pub use sync::{MessageSync, SyncTarget};
pub mod utils;
pub use utils::normalize_display;

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use scheduler::Cycle;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Keeps one chat message in sync with the playback service for a single
/// target.
///
/// The engine owns the credential cache, the status fetcher, the message
/// reconciler and the poll loop. Several engines can run side by side
/// without sharing anything unless they are built from shared components.
///
/// # Logging
///
/// This library uses the `tracing` crate for logging. To see logs, install a
/// subscriber in your application, for example:
///
/// ```no_run
/// tracing_subscriber::fmt()
///     .with_env_filter(tracing_subscriber::EnvFilter::new("now_playing_sync=debug"))
///     .init();
/// ```
///
/// - `DEBUG`/`TRACE`: individual requests and scheduling decisions
/// - `INFO`: lifecycle, token refreshes, messages posted
/// - `WARN`: transient failures, lost messages
/// - `ERROR`: rejected token exchanges and permanent fetch failures
pub struct SyncEngine {
    source: Arc<dyn PlaybackSource>,
    gateway: Arc<dyn CommandGateway>,
    // Held only by the single in-flight cycle, so the lock is never contended
    // by reconciles.
    sync: Arc<Mutex<MessageSync>>,
    schedule: ScheduleConfig,
    event_sender: broadcast::Sender<SyncEvent>,
    state_tx: Arc<watch::Sender<EngineState>>,
    state_rx: watch::Receiver<EngineState>,
    poll_task: StdMutex<Option<PollHandle>>,
}

impl SyncEngine {
    /// Build an engine talking to the real services described by `settings`.
    pub fn new(settings: &Settings) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.request_timeout)
            .pool_idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .build()?;

        let exchanger = Arc::new(RefreshTokenExchanger::new(
            client.clone(),
            &settings.spotify_accounts_base,
            &settings.spotify,
        ));
        let credentials = CredentialCache::new(exchanger, settings.token_safety_factor);
        let player = Arc::new(SpotifyPlayer::new(
            client.clone(),
            &settings.spotify_api_base,
            credentials,
        ));
        let surface = Arc::new(DiscordSurface::new(
            client,
            &settings.discord_api_base,
            &settings.discord_token,
        ));

        let target = match &settings.initial_message_id {
            Some(message_id) => SyncTarget::with_artifact(&settings.channel_id, message_id),
            None => SyncTarget::new(&settings.channel_id),
        };

        Ok(Self::with_components(
            player.clone(),
            player,
            surface,
            target,
            settings.schedule,
        ))
    }

    /// Build an engine from already constructed components.
    pub fn with_components(
        source: Arc<dyn PlaybackSource>,
        gateway: Arc<dyn CommandGateway>,
        surface: Arc<dyn MessagingSurface>,
        target: SyncTarget,
        schedule: ScheduleConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (state_tx, state_rx) = watch::channel(EngineState::Stopped);
        let sync = MessageSync::new(surface, target, event_tx.clone());

        Self {
            source,
            gateway,
            sync: Arc::new(Mutex::new(sync)),
            schedule,
            event_sender: event_tx,
            state_tx: Arc::new(state_tx),
            state_rx,
            poll_task: StdMutex::new(None),
        }
    }

    pub fn event_receiver(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_sender.subscribe()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Get the current state of the poll loop.
    pub fn current_state(&self) -> EngineState {
        self.state_rx.borrow().clone()
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    /// Id of the synced message, if one is known.
    pub async fn artifact_id(&self) -> Option<String> {
        self.sync.lock().await.artifact_id().map(ToString::to_string)
    }

    pub async fn target(&self) -> SyncTarget {
        self.sync.lock().await.target().clone()
    }

    fn poll_task(&self) -> std::sync::MutexGuard<'_, Option<PollHandle>> {
        self.poll_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.poll_task()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start the poll loop. Returns `false` if it is already running.
    ///
    /// Each start begins from the idle schedule with no memory of an earlier
    /// run; the synced message id is kept.
    pub async fn start(&self) -> bool {
        if self.is_running() {
            warn!("Sync engine already running");
            return false;
        }

        self.sync.lock().await.verify_surface().await;

        let mut task = self.poll_task();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("Sync engine was started concurrently");
            return false;
        }
        let cycle = SyncCycle {
            source: Arc::clone(&self.source),
            sync: Arc::clone(&self.sync),
            event_sender: self.event_sender.clone(),
            last_seen: None,
        };
        *task = Some(scheduler::arm(self.schedule, cycle, Arc::clone(&self.state_tx)));
        info!("Sync engine started");
        true
    }

    /// Stop the poll loop and wait for it to exit.
    ///
    /// A cycle already in flight is allowed to finish; no further cycle is
    /// armed.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let handle = self.poll_task().take();
        match handle {
            Some(handle) => {
                let _ = self.state_tx.send_replace(EngineState::Stopping);
                debug!("Awaiting poll loop termination...");
                handle.stop().await?;
                let _ = self.state_tx.send_replace(EngineState::Stopped);
                info!("Sync engine stopped");
            }
            None => debug!("Sync engine was not running"),
        }
        Ok(())
    }

    /// Forward a control action to the playback service, once.
    pub async fn execute(&self, command: PlaybackCommand) -> Result<(), ControlError> {
        info!(command = command.name(), "Executing playback command");
        let result = self.gateway.execute(command).await;
        if let Err(ref e) = result {
            warn!(command = command.name(), error = %e, "Playback command failed");
        }
        result
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("schedule", &self.schedule)
            .field("state", &self.current_state())
            .finish()
    }
}

// Ensure the engine stops its poll loop on drop
impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.poll_task().as_ref() {
            debug!("Dropping SyncEngine, cancelling poll loop.");
            handle.cancel();
        }
    }
}

/// One fetch-then-reconcile pass of the engine.
struct SyncCycle {
    source: Arc<dyn PlaybackSource>,
    sync: Arc<Mutex<MessageSync>>,
    event_sender: broadcast::Sender<SyncEvent>,
    // (track id, playing) of the previous observation
    last_seen: Option<(Option<String>, bool)>,
}

impl SyncCycle {
    fn note_observation(&mut self, playback: &Playback) {
        let seen = (playback.track_id().map(ToString::to_string), playback.is_active());
        if self.last_seen.as_ref() != Some(&seen) {
            debug!(track_id = ?seen.0, playing = seen.1, "Playback state changed");
            let _ = self
                .event_sender
                .send(SyncEvent::StateChanged(playback.clone()));
            self.last_seen = Some(seen);
        }
    }
}

#[async_trait]
impl Cycle for SyncCycle {
    async fn run(&mut self) -> CycleOutcome {
        let playback = match self.source.fetch().await {
            Ok(playback) => playback,
            Err(e) if e.is_permanent() => {
                error!(error = %e, "Unusable playback status, treating as idle");
                Playback::Idle
            }
            Err(e) => {
                warn!(error = %e, "Playback fetch failed");
                let _ = self.event_sender.send(SyncEvent::CycleFailed(e.to_string()));
                return CycleOutcome::Failure;
            }
        };

        self.note_observation(&playback);
        self.sync.lock().await.reconcile(&playback).await;
        CycleOutcome::Success(playback)
    }
}
