use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use cinecast_common::SignalingConfig;
use cinecast_signal::testing::{FakeCapture, FakeEngine, FakeEngineOptions, FakeRelay};
use cinecast_signal::{
    codec, ApplyError, ControllerError, ControllerEvent, NegotiationState, Role, SdpType,
    SessionController, SessionDescription, SourceConfig,
};

struct Setup {
    relay: Arc<FakeRelay>,
    engine: Arc<FakeEngine>,
    capture: Arc<FakeCapture>,
    controller: SessionController,
    events: Arc<Mutex<Vec<ControllerEvent>>>,
}

fn setup(options: FakeEngineOptions) -> Setup {
    let relay = Arc::new(FakeRelay::new());
    let engine = Arc::new(FakeEngine::with_options(options));
    let capture = Arc::new(FakeCapture::new());
    let config = SignalingConfig::default().with_relay_url("ws://relay.test/ws");
    let controller = SessionController::new(config, engine.clone(), capture.clone(), relay.clone());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    controller.on_event(move |event| sink.lock().unwrap().push(event));

    Setup {
        relay,
        engine,
        capture,
        controller,
        events,
    }
}

fn apply_errors(events: &[ControllerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ControllerEvent::Error(ControllerError::Apply(_))))
        .count()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn publisher_studio_reaches_active_on_flat_answer() {
    let s = setup(FakeEngineOptions {
        auto_gather: true,
        auto_connect: true,
        ..Default::default()
    });

    s.controller
        .start(Role::Publisher, "studio", SourceConfig::Camera)
        .await
        .expect("start");

    let mut peer = s.relay.take_peer(0).expect("relay connection");
    let wire = peer.next_sent().await.expect("offer sent");
    assert_eq!(peer.try_sent(), None, "more than one outbound message");

    let offer = codec::decode_remote(&wire).expect("decode offer");
    assert_eq!(offer.sdp_type, SdpType::Offer);

    let answer = serde_json::to_string(&SessionDescription::answer("v=0\r\n")).unwrap();
    peer.deliver(general_purpose::STANDARD.encode(answer));
    settle().await;

    assert_eq!(
        s.controller.current().and_then(|info| info.negotiation),
        Some(NegotiationState::Active)
    );
    assert_eq!(apply_errors(&s.events.lock().unwrap()), 0);
}

#[tokio::test]
async fn subscriber_with_empty_name_never_connects() {
    let s = setup(FakeEngineOptions::default());

    let result = s
        .controller
        .start(Role::Subscriber, "", SourceConfig::Camera)
        .await;

    assert!(matches!(result, Err(ControllerError::InvalidInput(_))));
    assert!(s.relay.opened_urls().is_empty());
    assert_eq!(s.engine.sessions_created(), 0);
    assert!(s.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn offer_is_sent_only_after_gathering_sentinel() {
    let s = setup(FakeEngineOptions::default());

    let starting = {
        let controller = s.controller.clone();
        tokio::spawn(async move {
            controller
                .start(Role::Publisher, "studio", SourceConfig::Camera)
                .await
        })
    };
    settle().await;

    let mut peer = s.relay.take_peer(0).expect("relay connection");
    let session = s.engine.last_session().expect("engine session");
    session.gather_candidate(1);
    session.gather_candidate(2);
    settle().await;
    assert_eq!(peer.try_sent(), None, "offer sent before gathering completed");

    session.finish_gathering();
    starting.await.expect("join").expect("start");

    let wire = peer.next_sent().await.expect("offer sent");
    assert_eq!(peer.try_sent(), None);
    let offer = codec::decode_remote(&wire).expect("decode");
    assert!(offer.sdp.contains("a=candidate:1"));
    assert!(offer.sdp.contains("a=candidate:2"));
}

#[tokio::test]
async fn early_answer_is_reported_and_session_survives() {
    let s = setup(FakeEngineOptions::default());

    let starting = {
        let controller = s.controller.clone();
        tokio::spawn(async move {
            controller
                .start(Role::Subscriber, "studio", SourceConfig::Camera)
                .await
        })
    };
    settle().await;

    let peer = s.relay.take_peer(0).expect("relay connection");
    let answer = codec::encode_offer(&SessionDescription::answer("v=0\r\n"), "", Role::Publisher)
        .expect("encode");
    peer.deliver(answer.clone());
    settle().await;

    assert!(s.events.lock().unwrap().contains(&ControllerEvent::Error(
        ControllerError::Apply(ApplyError::NotReady(NegotiationState::GatheringCandidates))
    )));

    s.engine.last_session().expect("session").finish_gathering();
    starting.await.expect("join").expect("start");

    peer.deliver(answer);
    settle().await;
    assert_eq!(
        s.controller.current().and_then(|info| info.negotiation),
        Some(NegotiationState::RemoteApplied)
    );
}

#[tokio::test]
async fn stop_twice_releases_once() {
    let s = setup(FakeEngineOptions {
        auto_gather: true,
        ..Default::default()
    });
    s.controller
        .start(Role::Publisher, "studio", SourceConfig::Camera)
        .await
        .expect("start");

    s.controller.stop().await;
    s.controller.stop().await;

    assert_eq!(s.capture.releases(), 1);
    assert_eq!(s.engine.last_session().expect("session").close_calls(), 1);
    assert!(!s.controller.is_active());
}
