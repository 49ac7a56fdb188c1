use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use mockall::mock;
use now_playing_sync::{
    Channel, CommandGateway, ControlError, EngineState, FetchError, Message, MessageSync,
    MessagePayload, MessagingError, MessagingSurface, Playback, PlaybackCommand, PlaybackSource,
    PlaybackState, ScheduleConfig, SyncEngine, SyncEvent, SyncTarget,
};
use tokio::sync::broadcast;
use tokio::time::sleep;

mock! {
    pub Surface {}

    #[async_trait]
    impl MessagingSurface for Surface {
        async fn fetch_surface(&self, surface_id: &str) -> Result<Channel, MessagingError>;
        async fn fetch_message(
            &self,
            surface_id: &str,
            message_id: &str,
        ) -> Result<Message, MessagingError>;
        async fn create_message(
            &self,
            surface_id: &str,
            payload: &MessagePayload,
        ) -> Result<Message, MessagingError>;
        async fn edit_message(
            &self,
            surface_id: &str,
            message_id: &str,
            payload: &MessagePayload,
        ) -> Result<Message, MessagingError>;
    }
}

fn message(id: &str) -> Message {
    Message {
        id: id.to_string(),
        channel_id: "chan".to_string(),
    }
}

fn track(id: &str, playing: bool) -> Playback {
    let started_at = SystemTime::now();
    Playback::Track(PlaybackState {
        track_id: id.to_string(),
        title: format!("title {}", id),
        artist_names: vec!["artist".to_string()],
        album_art_url: None,
        track_url: None,
        started_at,
        ends_at: started_at + Duration::from_secs(180),
        progress_ms: 0,
        duration_ms: 180_000,
        is_playing: playing,
    })
}

fn sync_with(
    surface: MockSurface,
    target: SyncTarget,
) -> (MessageSync, broadcast::Receiver<SyncEvent>) {
    let (tx, rx) = broadcast::channel(16);
    (MessageSync::new(Arc::new(surface), target, tx), rx)
}

// Test that the first idle reconcile posts exactly one message
#[tokio::test]
async fn test_first_reconcile_creates_message() {
    let mut surface = MockSurface::new();
    surface
        .expect_create_message()
        .withf(|surface_id: &str, payload: &MessagePayload| {
            surface_id == "chan" && payload.content == "idle" && payload.embeds.is_empty()
        })
        .times(1)
        .returning(|_, _| Ok(message("m1")));
    surface.expect_edit_message().times(0);

    let (mut sync, mut events) = sync_with(surface, SyncTarget::new("chan"));

    assert_eq!(sync.reconcile(&Playback::Idle).await, Some("m1".to_string()));
    assert_eq!(sync.artifact_id(), Some("m1"));
    assert_eq!(
        events.try_recv().unwrap(),
        SyncEvent::ArtifactCreated("m1".to_string())
    );
}

// Test that later reconciles edit the same message instead of posting new ones
#[tokio::test]
async fn test_second_reconcile_edits_same_message() {
    let mut surface = MockSurface::new();
    surface
        .expect_create_message()
        .times(1)
        .returning(|_, _| Ok(message("m1")));
    surface.expect_fetch_message().times(0);
    surface
        .expect_edit_message()
        .withf(|surface_id: &str, message_id: &str, payload: &MessagePayload| {
            surface_id == "chan" && message_id == "m1" && payload.embeds.len() == 1
        })
        .times(1)
        .returning(|_, id, _| Ok(message(id)));

    let (mut sync, _events) = sync_with(surface, SyncTarget::new("chan"));

    assert_eq!(sync.reconcile(&Playback::Idle).await, Some("m1".to_string()));
    assert_eq!(
        sync.reconcile(&track("t1", true)).await,
        Some("m1".to_string())
    );
}

// Test that a dangling message id is forgotten and replaced by exactly one new message
#[tokio::test]
async fn test_dangling_message_is_replaced_once() {
    let mut surface = MockSurface::new();
    surface
        .expect_fetch_message()
        .times(1)
        .returning(|_, _| Err(MessagingError::NotFound));
    surface.expect_edit_message().times(0);
    surface
        .expect_create_message()
        .times(1)
        .returning(|_, _| Ok(message("m2")));

    let (mut sync, mut events) = sync_with(surface, SyncTarget::with_artifact("chan", "gone"));

    assert_eq!(sync.reconcile(&Playback::Idle).await, Some("m2".to_string()));
    assert_eq!(sync.artifact_id(), Some("m2"));
    assert_eq!(
        events.try_recv().unwrap(),
        SyncEvent::ArtifactLost("gone".to_string())
    );
    assert_eq!(
        events.try_recv().unwrap(),
        SyncEvent::ArtifactCreated("m2".to_string())
    );
}

// Test that a message deleted between edits is recreated
#[tokio::test]
async fn test_message_deleted_after_edit_is_recreated() {
    let mut surface = MockSurface::new();
    let mut edits = 0;
    surface
        .expect_create_message()
        .times(2)
        .returning({
            let mut n = 0;
            move |_, _| {
                n += 1;
                Ok(message(&format!("m{}", n)))
            }
        });
    surface
        .expect_edit_message()
        .times(2)
        .returning(move |_, id, _| {
            edits += 1;
            if edits == 1 {
                Ok(message(id))
            } else {
                Err(MessagingError::NotFound)
            }
        });

    let (mut sync, _events) = sync_with(surface, SyncTarget::new("chan"));

    assert_eq!(sync.reconcile(&Playback::Idle).await, Some("m1".to_string()));
    assert_eq!(sync.reconcile(&Playback::Idle).await, Some("m1".to_string()));
    assert_eq!(sync.reconcile(&Playback::Idle).await, Some("m2".to_string()));
}

// Test that other messaging errors keep the stored id and post nothing
#[tokio::test]
async fn test_other_error_keeps_message_id() {
    let mut surface = MockSurface::new();
    surface
        .expect_fetch_message()
        .times(1)
        .returning(|_, id| Ok(message(id)));
    surface
        .expect_edit_message()
        .times(1)
        .returning(|_, _, _| Err(MessagingError::Other("HTTP 500: oops".to_string())));
    surface.expect_create_message().times(0);

    let (mut sync, mut events) = sync_with(surface, SyncTarget::with_artifact("chan", "old"));

    assert_eq!(sync.reconcile(&Playback::Idle).await, Some("old".to_string()));
    assert_eq!(sync.artifact_id(), Some("old"));
    assert!(events.try_recv().is_err());
}

// Test that a message id from a previous run is located once, then edited directly
#[tokio::test]
async fn test_warm_start_locates_message_once() {
    let mut surface = MockSurface::new();
    surface
        .expect_fetch_message()
        .withf(|surface_id: &str, message_id: &str| surface_id == "chan" && message_id == "old")
        .times(1)
        .returning(|_, id| Ok(message(id)));
    surface
        .expect_edit_message()
        .times(2)
        .returning(|_, id, _| Ok(message(id)));
    surface.expect_create_message().times(0);

    let (mut sync, _events) = sync_with(surface, SyncTarget::with_artifact("chan", "old"));

    assert_eq!(sync.reconcile(&Playback::Idle).await, Some("old".to_string()));
    assert_eq!(
        sync.reconcile(&track("t1", false)).await,
        Some("old".to_string())
    );
}

// Test that a failed post leaves no id behind and is retried next time
#[tokio::test]
async fn test_failed_create_is_retried_next_reconcile() {
    let mut surface = MockSurface::new();
    let mut attempts = 0;
    surface
        .expect_create_message()
        .times(2)
        .returning(move |_, _| {
            attempts += 1;
            if attempts == 1 {
                Err(MessagingError::Other("HTTP 403: Missing Access".to_string()))
            } else {
                Ok(message("m1"))
            }
        });

    let (mut sync, _events) = sync_with(surface, SyncTarget::new("chan"));

    assert_eq!(sync.reconcile(&Playback::Idle).await, None);
    assert_eq!(sync.artifact_id(), None);
    assert_eq!(sync.reconcile(&Playback::Idle).await, Some("m1".to_string()));
}

// Test that a missing channel is reported but not fatal
#[tokio::test]
async fn test_verify_surface() {
    let mut surface = MockSurface::new();
    surface
        .expect_fetch_surface()
        .times(1)
        .returning(|_| Err(MessagingError::NotFound));

    let (sync, _events) = sync_with(surface, SyncTarget::new("chan"));
    assert!(!sync.verify_surface().await);
}

// In-memory fakes for driving the whole engine

#[derive(Default)]
struct FakeSource {
    script: Mutex<VecDeque<Result<Playback, FetchError>>>,
    calls: AtomicUsize,
}

impl FakeSource {
    fn scripted(results: Vec<Result<Playback, FetchError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackSource for FakeSource {
    async fn fetch(&self) -> Result<Playback, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Playback::Idle))
    }
}

#[derive(Default)]
struct FakeGateway {
    executed: Mutex<Vec<PlaybackCommand>>,
}

#[async_trait]
impl CommandGateway for FakeGateway {
    async fn execute(&self, command: PlaybackCommand) -> Result<(), ControlError> {
        self.executed.lock().unwrap().push(command);
        if command == PlaybackCommand::Skip {
            return Err(ControlError::Rejected {
                status: 404,
                body: "NO_ACTIVE_DEVICE".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct InMemorySurface {
    messages: Mutex<HashMap<String, MessagePayload>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    edits: AtomicUsize,
}

impl InMemorySurface {
    fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    fn edits(&self) -> usize {
        self.edits.load(Ordering::SeqCst)
    }

    fn content(&self, id: &str) -> Option<MessagePayload> {
        self.messages.lock().unwrap().get(id).cloned()
    }

    fn delete(&self, id: &str) {
        self.messages.lock().unwrap().remove(id);
    }
}

#[async_trait]
impl MessagingSurface for InMemorySurface {
    async fn fetch_surface(&self, surface_id: &str) -> Result<Channel, MessagingError> {
        Ok(Channel {
            id: surface_id.to_string(),
            name: Some("now-playing".to_string()),
        })
    }

    async fn fetch_message(
        &self,
        surface_id: &str,
        message_id: &str,
    ) -> Result<Message, MessagingError> {
        if self.messages.lock().unwrap().contains_key(message_id) {
            Ok(Message {
                id: message_id.to_string(),
                channel_id: surface_id.to_string(),
            })
        } else {
            Err(MessagingError::NotFound)
        }
    }

    async fn create_message(
        &self,
        surface_id: &str,
        payload: &MessagePayload,
    ) -> Result<Message, MessagingError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.messages
            .lock()
            .unwrap()
            .insert(id.clone(), payload.clone());
        Ok(Message {
            id,
            channel_id: surface_id.to_string(),
        })
    }

    async fn edit_message(
        &self,
        surface_id: &str,
        message_id: &str,
        payload: &MessagePayload,
    ) -> Result<Message, MessagingError> {
        self.edits.fetch_add(1, Ordering::SeqCst);
        let mut messages = self.messages.lock().unwrap();
        match messages.get_mut(message_id) {
            Some(existing) => {
                *existing = payload.clone();
                Ok(Message {
                    id: message_id.to_string(),
                    channel_id: surface_id.to_string(),
                })
            }
            None => Err(MessagingError::NotFound),
        }
    }
}

fn engine(
    source: Arc<FakeSource>,
    surface: Arc<InMemorySurface>,
    target: SyncTarget,
) -> SyncEngine {
    SyncEngine::with_components(
        source,
        Arc::new(FakeGateway::default()),
        surface,
        target,
        ScheduleConfig::default(),
    )
}

// Test the idle flow: one message posted after the startup delay, then edited
#[tokio::test(start_paused = true)]
async fn test_engine_posts_then_edits() {
    let source = FakeSource::scripted(vec![]);
    let surface = Arc::new(InMemorySurface::default());
    let engine = engine(source.clone(), surface.clone(), SyncTarget::new("chan"));

    assert!(engine.start().await);
    assert!(engine.is_running());

    // Nothing happens before the startup delay
    sleep(Duration::from_secs(4)).await;
    assert_eq!(source.calls(), 0);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(source.calls(), 1);
    assert_eq!(surface.creates(), 1);
    assert_eq!(engine.artifact_id().await.as_deref(), Some("msg-1"));
    assert_eq!(surface.content("msg-1").unwrap().content, "idle");

    // Idle cadence
    sleep(Duration::from_secs(15)).await;
    assert_eq!(source.calls(), 2);
    assert_eq!(surface.creates(), 1);
    assert_eq!(surface.edits(), 1);

    engine.stop().await.unwrap();
    assert!(!engine.is_running());
    assert_eq!(engine.current_state(), EngineState::Stopped);
}

// Test that state changes and new messages are broadcast
#[tokio::test(start_paused = true)]
async fn test_engine_broadcasts_events() {
    let source = FakeSource::scripted(vec![
        Ok(track("t1", true)),
        Ok(track("t1", true)),
        Ok(Playback::Idle),
    ]);
    let surface = Arc::new(InMemorySurface::default());
    let engine = engine(source.clone(), surface.clone(), SyncTarget::new("chan"));
    let mut events = engine.event_receiver();

    engine.start().await;
    // 5s startup, then 5s and 6.25s while t1 keeps playing
    sleep(Duration::from_secs(20)).await;
    engine.stop().await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    let types: Vec<&str> = received.iter().map(SyncEvent::event_type).collect();
    assert_eq!(
        types,
        vec!["stateChanged", "artifactCreated", "stateChanged"],
        "events: {:?}",
        received
    );
    match &received[0] {
        SyncEvent::StateChanged(playback) => assert_eq!(playback.track_id(), Some("t1")),
        other => panic!("Expected StateChanged, got {:?}", other),
    }
    assert_eq!(received[1].artifact_id(), Some("msg-1"));
    assert_eq!(received[2], SyncEvent::StateChanged(Playback::Idle));
    assert_eq!(surface.creates(), 1);
    assert_eq!(surface.edits(), 2);
}

// Test that an unusable status is shown as idle and does not back off
#[tokio::test(start_paused = true)]
async fn test_engine_permanent_failure_treated_as_idle() {
    let source = FakeSource::scripted(vec![Err(FetchError::Permanent(
        "Malformed playback payload".to_string(),
    ))]);
    let surface = Arc::new(InMemorySurface::default());
    let engine = engine(source.clone(), surface.clone(), SyncTarget::new("chan"));
    let mut events = engine.event_receiver();

    engine.start().await;
    sleep(Duration::from_secs(6)).await;

    assert_eq!(surface.content("msg-1").unwrap().content, "idle");
    assert_eq!(
        engine.current_state(),
        EngineState::Waiting {
            delay: Duration::from_secs(15),
            consecutive_failures: 0,
        }
    );
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.event_type(), "cycleFailed");
    }
    engine.stop().await.unwrap();
}

// Test that transient failures back off and leave the message alone
#[tokio::test(start_paused = true)]
async fn test_engine_transient_failure_backs_off() {
    let source = FakeSource::scripted(vec![
        Err(FetchError::Transient("HTTP 503".to_string())),
        Err(FetchError::Transient("HTTP 503".to_string())),
    ]);
    let surface = Arc::new(InMemorySurface::default());
    let engine = engine(source.clone(), surface.clone(), SyncTarget::new("chan"));
    let mut events = engine.event_receiver();

    engine.start().await;
    sleep(Duration::from_secs(6)).await;

    assert_eq!(surface.creates(), 0);
    assert_eq!(
        engine.current_state(),
        EngineState::Waiting {
            delay: Duration::from_secs(10),
            consecutive_failures: 1,
        }
    );
    assert_eq!(events.try_recv().unwrap().event_type(), "cycleFailed");

    // Second failure at t=15 doubles the delay again
    sleep(Duration::from_secs(10)).await;
    assert_eq!(
        engine.current_state(),
        EngineState::Waiting {
            delay: Duration::from_secs(20),
            consecutive_failures: 2,
        }
    );

    // Recovery at t=35 returns to the idle cadence
    sleep(Duration::from_secs(20)).await;
    assert_eq!(surface.creates(), 1);
    assert_eq!(
        engine.current_state(),
        EngineState::Waiting {
            delay: Duration::from_secs(15),
            consecutive_failures: 0,
        }
    );
    engine.stop().await.unwrap();
}

// Test that a message deleted out from under the engine is replaced once
#[tokio::test(start_paused = true)]
async fn test_engine_recovers_deleted_message() {
    let source = FakeSource::scripted(vec![]);
    let surface = Arc::new(InMemorySurface::default());
    let engine = engine(source.clone(), surface.clone(), SyncTarget::new("chan"));
    let mut events = engine.event_receiver();

    engine.start().await;
    sleep(Duration::from_secs(6)).await;
    surface.delete("msg-1");

    sleep(Duration::from_secs(15)).await;
    assert_eq!(surface.creates(), 2);
    assert_eq!(engine.artifact_id().await.as_deref(), Some("msg-2"));

    let lost: Vec<SyncEvent> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|event| event.event_type() == "artifactLost")
        .collect();
    assert_eq!(lost, vec![SyncEvent::ArtifactLost("msg-1".to_string())]);
    engine.stop().await.unwrap();
}

// Test that a configured message id that no longer exists is replaced
#[tokio::test(start_paused = true)]
async fn test_engine_warm_start_with_dangling_id() {
    let source = FakeSource::scripted(vec![]);
    let surface = Arc::new(InMemorySurface::default());
    let engine = engine(
        source.clone(),
        surface.clone(),
        SyncTarget::with_artifact("chan", "from-last-run"),
    );

    engine.start().await;
    sleep(Duration::from_secs(6)).await;

    assert_eq!(surface.creates(), 1);
    assert_eq!(surface.edits(), 0);
    assert_eq!(
        engine.target().await,
        SyncTarget::with_artifact("chan", "msg-1")
    );
    engine.stop().await.unwrap();
}

// Test the start/stop lifecycle
#[tokio::test(start_paused = true)]
async fn test_engine_lifecycle() {
    let source = FakeSource::scripted(vec![]);
    let surface = Arc::new(InMemorySurface::default());
    let engine = engine(source.clone(), surface.clone(), SyncTarget::new("chan"));

    assert_eq!(engine.current_state(), EngineState::Stopped);
    // Stopping an engine that never started is fine
    engine.stop().await.unwrap();

    assert!(engine.start().await);
    assert!(!engine.start().await);
    sleep(Duration::from_millis(10)).await;
    assert!(engine.current_state().is_running());

    engine.stop().await.unwrap();
    assert_eq!(engine.current_state(), EngineState::Stopped);
    assert_eq!(source.calls(), 0);

    // Restart keeps the message id and begins from the startup delay
    assert!(engine.start().await);
    sleep(Duration::from_secs(6)).await;
    assert_eq!(source.calls(), 1);
    engine.stop().await.unwrap();
}

// Test that commands are forwarded once and failures reported
#[tokio::test]
async fn test_engine_executes_commands() {
    let gateway = Arc::new(FakeGateway::default());
    let engine = SyncEngine::with_components(
        FakeSource::scripted(vec![]),
        gateway.clone(),
        Arc::new(InMemorySurface::default()),
        SyncTarget::new("chan"),
        ScheduleConfig::default(),
    );

    engine.execute(PlaybackCommand::Pause).await.unwrap();
    engine.execute(PlaybackCommand::Resume).await.unwrap();
    let result = engine.execute(PlaybackCommand::Skip).await;
    assert!(matches!(
        result,
        Err(ControlError::Rejected { status: 404, .. })
    ));

    assert_eq!(
        *gateway.executed.lock().unwrap(),
        vec![
            PlaybackCommand::Pause,
            PlaybackCommand::Resume,
            PlaybackCommand::Skip
        ]
    );
}
