// End-to-end tests driving the tracker through its public handle

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tab_scrobbler::error::ServiceError;
use tab_scrobbler::scrobbler::{ScrobbleService, Track};
use tab_scrobbler::{
    AggregateResult, BindingRegistry, ChannelListener, Config, Connector, Correction, LifecycleEvent,
    PlaybackSample, SubmissionOutcome, TabId, Tracker, TrackerHandle,
};
use tokio::sync::mpsc;

struct FakeService {
    id: String,
    script: Mutex<VecDeque<Result<(), ServiceError>>>,
    scrobbles: AtomicUsize,
}

impl FakeService {
    fn new(id: &str) -> Arc<Self> {
        Self::scripted(id, Vec::new())
    }

    fn scripted(id: &str, script: Vec<Result<(), ServiceError>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            script: Mutex::new(script.into()),
            scrobbles: AtomicUsize::new(0),
        })
    }

    fn scrobbles(&self) -> usize {
        self.scrobbles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScrobbleService for FakeService {
    fn id(&self) -> &str {
        &self.id
    }

    async fn now_playing(&self, _track: &Track) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn scrobble(&self, _track: &Track, _timestamp: i64) -> Result<(), ServiceError> {
        self.scrobbles.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

type Events = mpsc::UnboundedReceiver<(TabId, LifecycleEvent)>;

fn start(services: &[(Arc<FakeService>, bool)]) -> (TrackerHandle, Events, Arc<BindingRegistry>) {
    let bindings = Arc::new(BindingRegistry::new());
    for (service, authenticated) in services {
        bindings.bind(service.clone(), *authenticated);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let (tracker, handle) = Tracker::from_config(
        &Config::default(),
        bindings.clone(),
        vec![Box::new(ChannelListener(tx))],
    );
    tracker.spawn();
    (handle, rx, bindings)
}

fn song(duration: u64) -> PlaybackSample {
    PlaybackSample::playing("Artist", "Track").with_duration(duration)
}

/// Send a sample and wait until the tracker has processed it
async fn sample(handle: &TrackerHandle, tab: TabId, sample: PlaybackSample) {
    handle.sample(tab, sample).unwrap();
    handle.current_item(tab).await.unwrap();
}

fn kind(event: &LifecycleEvent) -> &'static str {
    match event {
        LifecycleEvent::Reset { .. } => "reset",
        LifecycleEvent::NowPlaying { .. } => "now_playing",
        LifecycleEvent::Unrecognized { .. } => "unrecognized",
        LifecycleEvent::Submitted { .. } => "submitted",
    }
}

#[tokio::test(start_paused = true)]
async fn listen_past_half_is_submitted_once() {
    let service = FakeService::new("a");
    let (handle, mut events, _) = start(&[(service.clone(), true)]);
    handle.attach(1).await.unwrap();

    sample(&handle, 1, song(120)).await;
    for _ in 0..2 {
        tokio::time::advance(Duration::from_secs(30)).await;
        sample(&handle, 1, song(120)).await;
    }

    let (tab, first) = events.recv().await.unwrap();
    assert_eq!((tab, kind(&first)), (1, "now_playing"));

    let (_, second) = events.recv().await.unwrap();
    match second {
        LifecycleEvent::Submitted { item, result } => {
            assert_eq!(result, AggregateResult::AllSucceeded);
            assert_eq!(item.outcomes.get("a"), Some(&SubmissionOutcome::Succeeded));
        }
        other => panic!("unexpected {:?}", other),
    }

    // Playback continues; nothing is submitted again
    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(10)).await;
        sample(&handle, 1, song(120)).await;
    }
    assert_eq!(service.scrobbles(), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn unauthenticated_service_is_skipped() {
    let a = FakeService::new("a");
    let b = FakeService::new("b");
    let (handle, mut events, _) = start(&[(a.clone(), true), (b.clone(), false)]);
    handle.attach(1).await.unwrap();

    sample(&handle, 1, song(60)).await;
    tokio::time::advance(Duration::from_secs(30)).await;
    sample(&handle, 1, song(60)).await;

    events.recv().await.unwrap();
    let (_, submitted) = events.recv().await.unwrap();
    let LifecycleEvent::Submitted { item, result } = submitted else {
        panic!("expected submitted");
    };
    assert_eq!(result, AggregateResult::PartialSuccess);
    assert_eq!(item.outcomes.get("a"), Some(&SubmissionOutcome::Succeeded));
    assert_eq!(item.outcomes.get("b"), Some(&SubmissionOutcome::SkippedUnauthenticated));
    assert_eq!(b.scrobbles(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_flip_binding() {
    let a = FakeService::new("a");
    let b = FakeService::scripted("b", vec![Err(ServiceError::AuthRejected("revoked".into()))]);
    let (handle, mut events, bindings) = start(&[(a.clone(), true), (b.clone(), true)]);
    handle.attach(1).await.unwrap();

    sample(&handle, 1, song(60)).await;
    tokio::time::advance(Duration::from_secs(30)).await;
    sample(&handle, 1, song(60)).await;

    events.recv().await.unwrap();
    let (_, submitted) = events.recv().await.unwrap();
    let LifecycleEvent::Submitted { item, result } = submitted else {
        panic!("expected submitted");
    };
    assert_eq!(result, AggregateResult::PartialSuccess);
    assert_eq!(item.outcomes.get("b"), Some(&SubmissionOutcome::FailedPermanent));
    assert!(!bindings.get("b").unwrap().authenticated);
    assert!(bindings.get("a").unwrap().authenticated);
}

#[tokio::test(start_paused = true)]
async fn detach_resets_once_and_ignores_late_input() {
    let (handle, mut events, _) = start(&[]);
    handle.attach(1).await.unwrap();
    sample(&handle, 1, song(200)).await;

    handle.detach(1).unwrap();
    assert!(handle.current_item(1).await.unwrap().is_none());

    // The tab is gone: these are dropped silently
    sample(&handle, 1, song(200)).await;
    handle.skip(1).unwrap();
    handle.toggle_love(1, true).unwrap();
    handle.current_item(1).await.unwrap();

    let kinds: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|(_, event)| kind(&event))
        .collect();
    assert_eq!(kinds, vec!["now_playing", "reset"]);
}

#[tokio::test(start_paused = true)]
async fn correction_replaces_current_item() {
    let (handle, mut events, _) = start(&[]);
    handle.attach(1).await.unwrap();
    sample(&handle, 1, song(200)).await;
    tokio::time::advance(Duration::from_secs(20)).await;
    sample(&handle, 1, song(200)).await;

    handle
        .correct_identity(
            1,
            Correction {
                track: Some("Real Title".into()),
                ..Correction::default()
            },
        )
        .unwrap();
    let current = handle.current_item(1).await.unwrap().unwrap();
    assert_eq!(current.identity().track, "Real Title");
    assert_eq!(current.listened_secs, 0.0);

    let kinds: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|(_, event)| kind(&event))
        .collect();
    assert_eq!(kinds, vec!["now_playing", "reset", "now_playing"]);
}

#[tokio::test(start_paused = true)]
async fn tabs_are_tracked_independently() {
    let service = FakeService::new("a");
    let (handle, mut events, _) = start(&[(service.clone(), true)]);
    handle.attach(1).await.unwrap();
    handle.attach(2).await.unwrap();

    sample(&handle, 1, song(60)).await;
    sample(&handle, 2, PlaybackSample::playing("Other", "Song").with_duration(600)).await;
    tokio::time::advance(Duration::from_secs(30)).await;
    sample(&handle, 1, song(60)).await;
    sample(&handle, 2, PlaybackSample::playing("Other", "Song").with_duration(600)).await;

    let mut submitted_tabs = Vec::new();
    while let Some((tab, event)) = events.recv().await {
        if let LifecycleEvent::Submitted { .. } = event {
            submitted_tabs.push(tab);
            break;
        }
    }
    assert_eq!(submitted_tabs, vec![1]);

    let other = handle.current_item(2).await.unwrap().unwrap();
    assert_eq!(other.listened_secs, 30.0);
    assert_eq!(service.scrobbles(), 1);
}

struct ScriptedConnector {
    state: Arc<Mutex<Option<(String, String)>>>,
    polls: Arc<AtomicUsize>,
}

impl Connector for ScriptedConnector {
    fn artist(&mut self) -> Option<String> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().as_ref().map(|(artist, _)| artist.clone())
    }

    fn track(&mut self) -> Option<String> {
        self.state.lock().unwrap().as_ref().map(|(_, track)| track.clone())
    }

    fn duration_secs(&mut self) -> Option<f64> {
        Some(180.0)
    }

    fn is_playing(&mut self) -> bool {
        self.state.lock().unwrap().is_some()
    }
}

#[tokio::test(start_paused = true)]
async fn connector_is_polled_until_detach() {
    let (handle, mut events, _) = start(&[]);
    let state = Arc::new(Mutex::new(Some(("Artist".to_string(), "Track".to_string()))));
    let polls = Arc::new(AtomicUsize::new(0));
    let connector = ScriptedConnector {
        state: state.clone(),
        polls: polls.clone(),
    };

    handle.attach_connector(5, Box::new(connector)).await.unwrap();

    let (tab, event) = events.recv().await.unwrap();
    assert_eq!(tab, 5);
    assert_eq!(kind(&event), "now_playing");

    tokio::time::sleep(Duration::from_secs(10)).await;
    let item = handle.current_item(5).await.unwrap().unwrap();
    assert!(item.listened_secs >= 8.0);

    handle.detach(5).unwrap();
    let (_, reset) = events.recv().await.unwrap();
    assert_eq!(kind(&reset), "reset");

    let polls_at_detach = polls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(polls.load(Ordering::SeqCst), polls_at_detach);
}
