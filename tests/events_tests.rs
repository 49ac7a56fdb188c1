use now_playing_sync::{Playback, SyncEvent};
use tokio::sync::broadcast;

// Test event type names
#[test]
fn test_event_types() {
    assert_eq!(
        SyncEvent::StateChanged(Playback::Idle).event_type(),
        "stateChanged"
    );
    assert_eq!(
        SyncEvent::ArtifactCreated("m1".to_string()).event_type(),
        "artifactCreated"
    );
    assert_eq!(
        SyncEvent::ArtifactLost("m1".to_string()).event_type(),
        "artifactLost"
    );
    assert_eq!(
        SyncEvent::CycleFailed("HTTP 503".to_string()).event_type(),
        "cycleFailed"
    );
}

// Test that only artifact events carry a message id
#[test]
fn test_event_artifact_id() {
    assert_eq!(
        SyncEvent::ArtifactCreated("m1".to_string()).artifact_id(),
        Some("m1")
    );
    assert_eq!(
        SyncEvent::ArtifactLost("m2".to_string()).artifact_id(),
        Some("m2")
    );
    assert_eq!(SyncEvent::StateChanged(Playback::Idle).artifact_id(), None);
    assert_eq!(
        SyncEvent::CycleFailed("timeout".to_string()).artifact_id(),
        None
    );
}

// Test that every subscriber sees every event in order
#[tokio::test]
async fn test_event_broadcast() {
    let (tx, mut first) = broadcast::channel(16);
    let mut second = tx.subscribe();

    tx.send(SyncEvent::ArtifactLost("m1".to_string())).unwrap();
    tx.send(SyncEvent::ArtifactCreated("m2".to_string()))
        .unwrap();

    for rx in [&mut first, &mut second] {
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::ArtifactLost("m1".to_string())
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::ArtifactCreated("m2".to_string())
        );
    }
}
