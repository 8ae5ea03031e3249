use manual_call::logger;
use manual_call::{
    CallError, CallEvent, CallStatus, Config, ConnectionDescriptor, LoggingConfig,
    SignalingMachine, SignalingState, StaticDevices,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const CONNECT_LIMIT: Duration = Duration::from_secs(30);
// ICE needs a few seconds of silence before calling the path disconnected
const LOSS_LIMIT: Duration = Duration::from_secs(60);

fn local_config(label: &str) -> Config {
    Config {
        peer_label: label.into(),
        ..Config::local_only()
    }
}

fn machine(label: &str, devices: Arc<StaticDevices>) -> SignalingMachine {
    logger::init(&LoggingConfig {
        enabled: true,
        filter: "manual_call=debug,webrtc=error".into(),
    });
    SignalingMachine::new(local_config(label), devices).unwrap()
}

/// Offer, answer and both candidate batches, all through the text codec.
async fn exchange(caller: &mut SignalingMachine, receiver: &mut SignalingMachine, video: bool) {
    let offer = caller.start_as_caller(video).await.unwrap();
    assert_eq!(caller.state(), SignalingState::OfferGenerated);

    let answer = receiver.start_as_receiver(&offer, video).await.unwrap();
    assert_eq!(receiver.state(), SignalingState::OfferApplied);

    caller.submit_answer_text(&answer).await.unwrap();
    assert_eq!(caller.state(), SignalingState::AnswerApplied);

    let from_caller = caller.gather_local_candidates_text().await.unwrap();
    let from_receiver = receiver.gather_local_candidates_text().await.unwrap();

    receiver.submit_candidate_text(&from_caller).await.unwrap();
    caller.submit_candidate_text(&from_receiver).await.unwrap();
    assert_eq!(caller.state(), SignalingState::CandidatesExchanging);
    assert_eq!(receiver.state(), SignalingState::CandidatesExchanging);
}

async fn wait_connected(m: &mut SignalingMachine) {
    let outcome = timeout(CONNECT_LIMIT, async {
        while m.state() != SignalingState::Connected {
            if m.state().is_terminal() || m.next_event().await.is_none() {
                break;
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "no connection within {CONNECT_LIMIT:?}");
    assert_eq!(m.state(), SignalingState::Connected);
}

/// Watches a side channel, leaving the machine's own queue untouched.
async fn wait_for_event(
    events: &mut broadcast::Receiver<CallEvent>,
    limit: Duration,
    wanted: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event never arrived")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_peers_connect_over_manual_exchange() {
    let caller_devices = Arc::new(StaticDevices::new());
    let receiver_devices = Arc::new(StaticDevices::new());
    let mut caller = machine("alice", caller_devices.clone());
    let mut receiver = machine("bob", receiver_devices.clone());
    let mut caller_events = caller.subscribe();

    exchange(&mut caller, &mut receiver, true).await;
    wait_connected(&mut caller).await;
    wait_connected(&mut receiver).await;

    let call = caller.call_record().unwrap().clone();
    assert_eq!(call.status, CallStatus::Connected);
    assert_eq!(call.peer_label, "alice");
    assert!(call.connected_at.is_some());
    assert_eq!(
        receiver.call_record().unwrap().call_id,
        call.call_id,
        "both sides share the call id"
    );

    // the monitor reports establishment exactly once
    let mut established = 0;
    while let Ok(event) = caller_events.try_recv() {
        if matches!(event, CallEvent::Established { .. }) {
            established += 1;
        }
    }
    assert_eq!(established, 1);

    // the answer can only be applied once
    let again = receiver.local_descriptor_text().unwrap().unwrap();
    assert!(matches!(
        caller.submit_answer_text(&again).await,
        Err(CallError::AlreadyAnswered)
    ));
    assert_eq!(caller.state(), SignalingState::Connected);

    caller.cancel().await.unwrap();
    receiver.cancel().await.unwrap();
    assert_eq!(caller.state(), SignalingState::Ended);
    assert_eq!(caller_devices.open_grants(), 0);
    assert_eq!(receiver_devices.open_grants(), 0);
}

#[tokio::test]
async fn test_garbage_input_changes_nothing() {
    let mut receiver = machine("bob", Arc::new(StaticDevices::new()));
    assert!(matches!(
        receiver.start_as_receiver("not json", false).await,
        Err(CallError::MalformedPayload(_))
    ));
    assert_eq!(receiver.state(), SignalingState::Idle);
    assert!(receiver.call_record().is_none());

    // well-formed JSON of the wrong shape
    assert!(matches!(
        manual_call::decode::<ConnectionDescriptor>(r#"{"sdp": 5}"#),
        Err(CallError::SchemaMismatch(_))
    ));
}

#[tokio::test]
async fn test_cancel_mid_exchange_then_start_again() {
    let caller_devices = Arc::new(StaticDevices::new());
    let mut caller = machine("alice", caller_devices.clone());
    let mut receiver = machine("bob", Arc::new(StaticDevices::new()));

    exchange(&mut caller, &mut receiver, false).await;
    let first = caller.call_record().unwrap().call_id.clone();

    // resubmitting the same batch is harmless
    let batch = receiver.local_candidates_text().unwrap();
    caller.submit_candidate_text(&batch).await.unwrap();
    assert_eq!(caller.state(), SignalingState::CandidatesExchanging);

    caller.cancel().await.unwrap();
    assert_eq!(caller.state(), SignalingState::Ended);
    assert_eq!(caller.call_record().unwrap().status, CallStatus::Ended);
    assert_eq!(caller_devices.open_grants(), 0);
    assert!(caller.remote_tracks().is_empty());

    let offer = caller.start_as_caller(false).await.unwrap();
    assert!(!offer.is_empty());
    assert_eq!(caller.state(), SignalingState::OfferGenerated);
    assert_ne!(caller.call_record().unwrap().call_id, first);

    receiver.reset().await;
    caller.reset().await;
    assert_eq!(caller.state(), SignalingState::Idle);
}

#[tokio::test]
async fn test_caller_buffers_candidates_until_answer() {
    let config = local_config("alice");
    let mut caller =
        manual_call::MediaSessionManager::new(config, Arc::new(StaticDevices::new())).unwrap();
    let mut receiver = machine("bob", Arc::new(StaticDevices::new()));

    caller.acquire_local_media(false).await.unwrap();
    let offer = caller.create_offer(false).await.unwrap();
    let answer_text = receiver
        .start_as_receiver(&manual_call::encode(&offer).unwrap(), false)
        .await
        .unwrap();

    // receiver candidates arrive ahead of the answer
    let early = receiver.gather_local_candidates_text().await.unwrap();
    for candidate in manual_call::decode_candidates(&early).unwrap() {
        caller.add_remote_candidate(candidate).await.unwrap();
    }
    assert!(caller.session().unwrap().applied_remote_candidates().is_empty());

    let answer: ConnectionDescriptor = manual_call::decode(&answer_text).unwrap();
    caller.apply_answer(answer).await.unwrap();
    assert_eq!(
        caller.session().unwrap().applied_remote_candidates().len(),
        manual_call::decode_candidates(&early).unwrap().len()
    );

    caller.teardown().await;
    receiver.reset().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconcile_catches_up_on_unhandled_events() {
    let caller_devices = Arc::new(StaticDevices::new());
    let mut caller = machine("alice", caller_devices.clone());
    let mut receiver = machine("bob", Arc::new(StaticDevices::new()));
    let mut side = caller.subscribe();

    exchange(&mut caller, &mut receiver, false).await;
    wait_for_event(&mut side, CONNECT_LIMIT, |e| {
        matches!(e, CallEvent::Established { .. })
    })
    .await;

    // the machine never polled its events
    assert_eq!(caller.state(), SignalingState::CandidatesExchanging);
    caller.reconcile().await;
    assert_eq!(caller.state(), SignalingState::Connected);
    assert!(caller.call_record().unwrap().connected_at.is_some());

    // the far end goes away while nobody is listening on the caller side
    receiver.cancel().await.unwrap();
    let lost = wait_for_event(&mut side, LOSS_LIMIT, |e| {
        matches!(e, CallEvent::Lost { .. })
    })
    .await;
    assert_eq!(caller.state(), SignalingState::Connected);

    caller.reconcile().await;
    assert!(caller.state().is_terminal());
    let expected = match lost {
        CallEvent::Lost {
            reason: manual_call::LostReason::Closed,
            ..
        } => CallStatus::Ended,
        _ => CallStatus::Failed,
    };
    assert_eq!(caller.call_record().unwrap().status, expected);
    assert_eq!(caller_devices.open_grants(), 0);
}
