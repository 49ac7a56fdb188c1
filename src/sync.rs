use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::MessagingError;
use crate::events::SyncEvent;
use crate::models::MessagePayload;
use crate::messaging::MessagingSurface;
use crate::playback::Playback;
use crate::render::render;

/// Where the synced message lives and which message it currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub surface_id: String,
    pub artifact_id: Option<String>,
}

impl SyncTarget {
    pub fn new(surface_id: impl Into<String>) -> Self {
        Self {
            surface_id: surface_id.into(),
            artifact_id: None,
        }
    }

    /// Start from a message posted by a previous run.
    pub fn with_artifact(surface_id: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        Self {
            surface_id: surface_id.into(),
            artifact_id: Some(artifact_id.into()),
        }
    }
}

/// Keeps exactly one message on the surface mirroring the playback state.
///
/// `reconcile` takes `&mut self`; callers must not run two reconciles for
/// the same target at once.
pub struct MessageSync {
    surface: Arc<dyn MessagingSurface>,
    target: SyncTarget,
    // False for an id supplied from outside until it has been seen to exist.
    confirmed: bool,
    event_sender: broadcast::Sender<SyncEvent>,
}

impl MessageSync {
    pub fn new(
        surface: Arc<dyn MessagingSurface>,
        target: SyncTarget,
        event_sender: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            surface,
            target,
            confirmed: false,
            event_sender,
        }
    }

    pub fn target(&self) -> &SyncTarget {
        &self.target
    }

    pub fn artifact_id(&self) -> Option<&str> {
        self.target.artifact_id.as_deref()
    }

    /// Helper method to send events - discards send errors
    #[inline]
    fn send_event(&self, event: SyncEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Check that the surface exists. Failures are only logged.
    pub async fn verify_surface(&self) -> bool {
        match self.surface.fetch_surface(&self.target.surface_id).await {
            Ok(channel) => {
                info!(
                    channel_id = %channel.id,
                    name = channel.name.as_deref().unwrap_or("<unnamed>"),
                    "Sync channel found"
                );
                true
            }
            Err(e) => {
                warn!(
                    channel_id = %self.target.surface_id,
                    error = %e,
                    "Could not fetch sync channel"
                );
                false
            }
        }
    }

    /// Bring the synced message in line with `playback` and return its id.
    ///
    /// 1. render the state;
    /// 2. update the stored message if there is one;
    /// 3. forget it if it no longer exists;
    /// 4. otherwise (or then) post a new one and remember it.
    ///
    /// Messaging errors never propagate: `None` means no message exists
    /// after this call and the next cycle will try again.
    pub async fn reconcile(&mut self, playback: &Playback) -> Option<String> {
        let payload = render(playback);

        if let Some(artifact_id) = self.target.artifact_id.clone() {
            match self.update(&artifact_id, &payload).await {
                Ok(()) => return Some(artifact_id),
                Err(MessagingError::NotFound) => {
                    warn!(message_id = %artifact_id, "Synced message is gone, posting a new one");
                    self.target.artifact_id = None;
                    self.confirmed = false;
                    self.send_event(SyncEvent::ArtifactLost(artifact_id));
                }
                Err(e) => {
                    warn!(message_id = %artifact_id, error = %e, "Failed to update synced message");
                    return Some(artifact_id);
                }
            }
        }

        match self
            .surface
            .create_message(&self.target.surface_id, &payload)
            .await
        {
            Ok(message) => {
                info!(message_id = %message.id, "Posted synced message");
                self.target.artifact_id = Some(message.id.clone());
                self.confirmed = true;
                self.send_event(SyncEvent::ArtifactCreated(message.id.clone()));
                Some(message.id)
            }
            Err(e) => {
                warn!(
                    channel_id = %self.target.surface_id,
                    error = %e,
                    "Failed to post synced message"
                );
                None
            }
        }
    }

    async fn update(
        &mut self,
        artifact_id: &str,
        payload: &MessagePayload,
    ) -> Result<(), MessagingError> {
        if !self.confirmed {
            self.surface
                .fetch_message(&self.target.surface_id, artifact_id)
                .await?;
            debug!(message_id = artifact_id, "Located existing synced message");
            self.confirmed = true;
        }
        self.surface
            .edit_message(&self.target.surface_id, artifact_id, payload)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for MessageSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSync")
            .field("target", &self.target)
            .field("confirmed", &self.confirmed)
            .finish()
    }
}
