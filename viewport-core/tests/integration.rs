//! End-to-end behaviour of the host against the synthetic backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use viewport_core::backend::synthetic::Injected;
use viewport_core::protocol::{KeyboardInput, MouseButton};
use viewport_core::{
    AuthenticationType, CaptureConfig, CaptureState, Display, Host, HostEvent, HostOptions,
    MouseInput, Rect, Role, SyntheticBackend, Viewer, ViewerCommand,
};

const WAIT: Duration = Duration::from_secs(5);

fn two_displays() -> Vec<Display> {
    vec![
        Display::new("A", Rect::new(0, 0, 64, 48), true),
        Display::new("B", Rect::new(64, 0, 32, 32), false),
    ]
}

fn start(displays: Vec<Display>) -> (Arc<SyntheticBackend>, Host) {
    let backend = Arc::new(SyntheticBackend::new(displays));
    let options = HostOptions {
        capture: CaptureConfig {
            topology_poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
        ..Default::default()
    };
    let host = Host::start(backend.clone(), options).unwrap();
    (backend, host)
}

fn viewer(id: &str, role: Role) -> Viewer {
    Viewer::new(id, "tester", role, AuthenticationType::BearerToken)
}

async fn wait_state(host: &Host, pred: impl Fn(&CaptureState) -> bool) {
    let mut rx = host.capture().subscribe_state();
    timeout(WAIT, rx.wait_for(|s| pred(s)))
        .await
        .expect("capture state not reached")
        .unwrap();
}

/// Collect every event that arrives within `window`.
async fn drain(events: &mut mpsc::Receiver<HostEvent>, window: Duration) -> Vec<HostEvent> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn connect_frame_disconnect_stops_capture() {
    let (_backend, host) = start(two_displays());
    let registration = host.connect(viewer("v1", Role::Operator)).unwrap();
    assert_eq!(host.registry().viewer_count(), host.registry().context_count());

    let slot = registration.frame_slot().unwrap();
    let update = timeout(WAIT, slot.wait()).await.unwrap().unwrap();
    assert_eq!(update.display_name, "A");
    assert!(image::load_from_memory(&update.data).is_ok());
    wait_state(&host, CaptureState::is_running).await;

    drop(registration);
    assert_eq!(host.registry().viewer_count(), 0);
    assert_eq!(host.registry().context_count(), 0);
    wait_state(&host, CaptureState::is_stopped).await;
    host.shutdown().await;
}

#[tokio::test]
async fn duplicate_connection_is_rejected() {
    let (_backend, host) = start(two_displays());
    let _first = host.connect(viewer("dup", Role::Owner)).unwrap();
    assert!(host.connect(viewer("dup", Role::Observer)).is_none());
    assert_eq!(host.registry().try_get_viewer("dup").unwrap().role, Role::Owner);
    host.shutdown().await;
}

#[tokio::test]
async fn frames_are_monotonic_per_viewer() {
    let (_backend, host) = start(two_displays());
    let registration = host.connect(viewer("v", Role::Owner)).unwrap();
    host.dispatch("v", ViewerCommand::SetFrameRate(60)).await.unwrap();
    let slot = registration.frame_slot().unwrap();

    let mut last: Option<(u64, u64)> = None;
    for _ in 0..10 {
        let update = timeout(WAIT, slot.wait()).await.unwrap().unwrap();
        if let Some((seq, ts)) = last {
            assert!(update.sequence > seq);
            assert!(update.timestamp_us > ts);
        }
        last = Some((update.sequence, update.timestamp_us));
    }
    host.shutdown().await;
}

#[tokio::test]
async fn shared_display_ticks_at_fastest_viewer_rate() {
    let (_backend, host) = start(two_displays());
    let slow = host.connect(viewer("slow", Role::Operator)).unwrap();
    let fast = host.connect(viewer("fast", Role::Operator)).unwrap();
    host.dispatch("slow", ViewerCommand::SetFrameRate(10)).await.unwrap();
    host.dispatch("fast", ViewerCommand::SetFrameRate(30)).await.unwrap();
    wait_state(&host, CaptureState::is_running).await;
    // Let the worker pick up the new rates.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(host.capture().tick_rate("A"), Some(30));
    assert_eq!(host.capture().captured_displays(), vec!["A".to_string()]);

    let count = |slot: Arc<viewport_core::FrameSlot>, counter: Arc<AtomicUsize>| async move {
        while slot.wait().await.is_some() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    };
    let slow_count = Arc::new(AtomicUsize::new(0));
    let fast_count = Arc::new(AtomicUsize::new(0));
    let a = tokio::spawn(count(slow.frame_slot().unwrap(), Arc::clone(&slow_count)));
    let b = tokio::spawn(count(fast.frame_slot().unwrap(), Arc::clone(&fast_count)));
    sleep(Duration::from_secs(1)).await;
    a.abort();
    b.abort();

    let slow_frames = slow_count.load(Ordering::SeqCst);
    let fast_frames = fast_count.load(Ordering::SeqCst);
    assert!(slow_frames >= 3 && slow_frames <= 12, "slow viewer got {slow_frames}");
    assert!(fast_frames > slow_frames, "fast {fast_frames} vs slow {slow_frames}");
    assert!(fast_frames <= 33, "fast viewer got {fast_frames}");
    host.shutdown().await;
}

#[tokio::test]
async fn vanished_display_reassigns_and_notifies_once() {
    let (backend, host) = start(two_displays());
    let on_b = host.connect(viewer("b", Role::Operator)).unwrap();
    let on_a = host.connect(viewer("a", Role::Operator)).unwrap();
    let mut b_events = on_b.take_events().unwrap();
    let mut a_events = on_a.take_events().unwrap();
    host.dispatch("b", ViewerCommand::ChangeSelectedScreen("B".into()))
        .await
        .unwrap();
    assert!(matches!(
        b_events.recv().await.unwrap(),
        HostEvent::ReceiveScreenSize(_)
    ));

    backend.set_displays(vec![Display::new("A", Rect::new(0, 0, 64, 48), true)]);
    let b_seen = drain(&mut b_events, Duration::from_millis(500)).await;
    let a_seen = drain(&mut a_events, Duration::from_millis(100)).await;

    let displays_events = |events: &[HostEvent]| {
        events
            .iter()
            .filter(|e| matches!(e, HostEvent::ReceiveDisplays(_)))
            .count()
    };
    assert_eq!(displays_events(&b_seen), 1);
    assert_eq!(displays_events(&a_seen), 1);
    assert!(b_seen.iter().any(|e| matches!(
        e,
        HostEvent::ReceiveScreenSize(size) if size.width == 64 && size.height == 48
    )));
    assert_eq!(host.registry().context("b").unwrap().selected_screen, "A");
    host.shutdown().await;
}

#[tokio::test]
async fn input_is_gated_and_mapped_onto_selected_display() {
    let displays = vec![
        Display::new("A", Rect::new(0, 0, 1920, 1080), true),
        Display::new("B", Rect::new(1920, 0, 1280, 1024), false),
    ];
    let (backend, host) = start(displays);
    let _owner = host.connect(viewer("own", Role::Owner)).unwrap();
    let _observer = host.connect(viewer("obs", Role::Observer)).unwrap();

    host.dispatch("obs", ViewerCommand::SendMouseInput(MouseInput::move_to(0.5, 0.5)))
        .await
        .unwrap();
    host.dispatch("own", ViewerCommand::SendMouseInput(MouseInput::move_to(0.5, 0.5)))
        .await
        .unwrap();
    host.input().flush().await.unwrap();
    assert_eq!(backend.injected().len(), 1);
    match &backend.injected()[0] {
        Injected::Mouse(event) => assert_eq!((event.x, event.y), (960, 540)),
        other => panic!("unexpected injection {other:?}"),
    }

    host.dispatch("own", ViewerCommand::ChangeSelectedScreen("B".into()))
        .await
        .unwrap();
    host.dispatch(
        "own",
        ViewerCommand::SendMouseInput(MouseInput::press(0.0, 0.0, MouseButton::Left)),
    )
    .await
    .unwrap();

    host.dispatch("own", ViewerCommand::ToggleInput(false)).await.unwrap();
    host.dispatch(
        "own",
        ViewerCommand::SendKeyboardInput(KeyboardInput::press(0x41, 0x1E)),
    )
    .await
    .unwrap();
    host.input().flush().await.unwrap();

    let injected = backend.injected();
    assert_eq!(injected.len(), 2);
    match &injected[1] {
        Injected::Mouse(event) => assert_eq!((event.x, event.y), (1920, 0)),
        other => panic!("unexpected injection {other:?}"),
    }
    host.shutdown().await;
}

#[tokio::test]
async fn overlays_stay_private_to_their_viewer() {
    let (_backend, host) = start(two_displays());
    let _a = host.connect(viewer("a", Role::Operator)).unwrap();
    let _b = host.connect(viewer("b", Role::Operator)).unwrap();
    host.dispatch("a", ViewerCommand::ToggleClickIndicator(true))
        .await
        .unwrap();
    assert!(host.overlays().is_overlay_active(viewport_core::CLICK_INDICATOR, "a"));
    assert!(host.overlays().get_active_overlays("b").is_empty());
    host.shutdown().await;
}

#[tokio::test]
async fn capture_fault_reaches_viewers_and_video_recovers() {
    let (backend, host) = start(two_displays());
    let registration = host.connect(viewer("v", Role::Owner)).unwrap();
    let mut events = registration.take_events().unwrap();
    wait_state(&host, CaptureState::is_running).await;

    backend.set_broken(true);
    wait_state(&host, CaptureState::is_faulted).await;
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, HostEvent::CaptureError(_)));

    backend.set_broken(false);
    host.capture().restart().unwrap();
    wait_state(&host, CaptureState::is_running).await;
    let slot = registration.frame_slot().unwrap();
    assert!(timeout(WAIT, slot.wait()).await.unwrap().is_some());
    host.shutdown().await;
}
