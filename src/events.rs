use crate::playback::Playback;

// Event types broadcast by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The observed track changed, or playback became idle / resumed.
    StateChanged(Playback),
    /// A new message was posted and is now the synced one.
    ArtifactCreated(String),
    /// The synced message could not be found any more.
    ArtifactLost(String),
    /// A cycle failed and the loop is backing off.
    CycleFailed(String),
}

impl SyncEvent {
    // Get the name of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::StateChanged(_) => "stateChanged",
            SyncEvent::ArtifactCreated(_) => "artifactCreated",
            SyncEvent::ArtifactLost(_) => "artifactLost",
            SyncEvent::CycleFailed(_) => "cycleFailed",
        }
    }

    /// The message id carried by artifact events.
    pub fn artifact_id(&self) -> Option<&str> {
        match self {
            SyncEvent::ArtifactCreated(id) | SyncEvent::ArtifactLost(id) => Some(id),
            _ => None,
        }
    }
}
