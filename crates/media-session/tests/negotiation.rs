mod support;

use std::sync::Arc;
use std::time::Duration;

use media_session::{CallError, CallState, MediaError, TrackSource};
use parking_lot::Mutex;
use signaling_store::{
    CallSessionPatch, CandidateDirection, MemoryStore, SessionDescription, SignalingStore,
};
use support::{eventually, CountingStore, Endpoint, INTERPRETER, REQUESTER, SESSION};
use test_timeout::tokio_timeout_test;
use time::macros::datetime;
use tokio::time::{sleep, Instant};

#[tokio_timeout_test(60, paused)]
async fn responder_joining_late_connects_with_a_single_answer() {
    let store = CountingStore::new();
    let (mut records, _watch) = store
        .inner
        .subscribe(SESSION)
        .await
        .unwrap()
        .into_parts();

    let initiator = Endpoint::new("initiator", store.clone());
    initiator.prepare().await;
    initiator
        .engine
        .negotiate_as_initiator(SESSION, REQUESTER)
        .await
        .unwrap();
    assert_eq!(initiator.engine.state(), CallState::AwaitingAnswer);

    sleep(Duration::from_secs(5)).await;

    let responder = Endpoint::new("responder", store.clone());
    responder.prepare().await;
    responder
        .engine
        .negotiate_as_responder(SESSION, INTERPRETER)
        .await
        .unwrap();
    assert!(store.gets() <= 2, "offer should be found on the first reads");

    initiator
        .engine
        .wait_for(CallState::Connected, Duration::from_secs(5))
        .await
        .unwrap();
    responder
        .engine
        .wait_for(CallState::Connected, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(initiator.transport().remote_sets(), 1);
    assert_eq!(responder.transport().remote_sets(), 1);
    assert_eq!(initiator.transport().offers_created(), 1);
    assert!(initiator.engine.remote_media().video().is_some());

    let record = store.inner.get(SESSION).await.unwrap().unwrap();
    assert_eq!(record.initiator_id.as_deref(), Some(REQUESTER));
    assert_eq!(record.responder_id.as_deref(), Some(INTERPRETER));

    // No observer ever saw an answer without its offer.
    let mut snapshots = 0;
    while let Ok(snapshot) = records.try_recv() {
        snapshots += 1;
        if snapshot.current_answer().is_some() {
            assert!(snapshot.current_offer().is_some());
        }
    }
    assert!(snapshots >= 2);
}

#[tokio_timeout_test(60, paused)]
async fn responder_first_finds_offer_on_fourth_read() {
    let store = CountingStore::new();
    let responder = Endpoint::new("responder", store.clone());
    responder.prepare().await;

    let started = Instant::now();
    let pending = tokio::spawn(async move {
        let result = responder
            .engine
            .negotiate_as_responder(SESSION, INTERPRETER)
            .await;
        (result, responder)
    });

    sleep(Duration::from_millis(2500)).await;
    let initiator = Endpoint::new("initiator", store.clone());
    initiator.prepare().await;
    initiator
        .engine
        .negotiate_as_initiator(SESSION, REQUESTER)
        .await
        .unwrap();

    let (result, responder) = pending.await.unwrap();
    result.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    assert_eq!(store.gets(), 4);

    initiator
        .engine
        .wait_for(CallState::Connected, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(responder.engine.is_connected());
}

#[tokio_timeout_test(60, paused)]
async fn responder_gives_up_after_thirty_reads_without_writing() {
    let store = CountingStore::new();
    let responder = Endpoint::new("responder", store.clone());
    responder.prepare().await;

    let started = Instant::now();
    let err = responder
        .engine
        .negotiate_as_responder(SESSION, INTERPRETER)
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::SignalingTimeout { attempts: 30, .. }));
    assert!(started.elapsed() <= Duration::from_secs(30));
    assert!(err.remediation().contains("not joined"));
    assert_eq!(store.gets(), 30);
    assert_eq!(store.writes(), 0);
    assert!(store.inner.get(SESSION).await.unwrap().is_none());
    assert_eq!(responder.engine.state(), CallState::Ended);
    assert_eq!(responder.media.live_tracks(), 0);
    assert_eq!(responder.transport().close_count(), 1);
}

#[tokio_timeout_test(60, paused)]
async fn redelivered_snapshots_and_candidates_apply_once() {
    let store = CountingStore::replaying();
    let initiator = Endpoint::new("initiator", store.clone());
    let responder = Endpoint::new("responder", store.clone());
    initiator.prepare().await;
    responder.prepare().await;

    initiator
        .engine
        .negotiate_as_initiator(SESSION, REQUESTER)
        .await
        .unwrap();
    responder
        .engine
        .negotiate_as_responder(SESSION, INTERPRETER)
        .await
        .unwrap();
    initiator
        .engine
        .wait_for(CallState::Connected, Duration::from_secs(5))
        .await
        .unwrap();

    let at_initiator = initiator.transport();
    let at_responder = responder.transport();
    eventually(|| at_initiator.applied_candidates().len() >= 2).await;
    eventually(|| at_responder.applied_candidates().len() >= 2).await;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(at_initiator.remote_sets(), 1);
    assert_eq!(
        at_initiator.applied_candidates(),
        at_responder.emitted_candidates()
    );
    assert_eq!(
        at_responder.applied_candidates(),
        at_initiator.emitted_candidates()
    );
}

#[tokio_timeout_test(60, paused)]
async fn early_candidates_wait_for_the_answer_and_keep_their_order() {
    let store = CountingStore::new();
    let initiator = Endpoint::new("initiator", store.clone());
    let responder = Endpoint::new("responder", store.clone());
    initiator.prepare().await;
    responder.prepare().await;

    initiator
        .engine
        .negotiate_as_initiator(SESSION, REQUESTER)
        .await
        .unwrap();
    responder
        .engine
        .negotiate_as_responder(SESSION, INTERPRETER)
        .await
        .unwrap();
    initiator
        .engine
        .wait_for(CallState::Connected, Duration::from_secs(5))
        .await
        .unwrap();

    let at_initiator = initiator.transport();
    eventually(|| at_initiator.applied_candidates().len() == 2).await;
    assert_eq!(at_initiator.rejected_candidates(), 0);
    assert_eq!(
        at_initiator.applied_candidates(),
        responder.transport().emitted_candidates()
    );
    assert_eq!(responder.transport().rejected_candidates(), 0);
}

#[tokio_timeout_test(60, paused)]
async fn initiator_candidates_land_after_the_stored_offer() {
    let store = CountingStore::new();
    let initiator = Endpoint::new("initiator", store.clone());
    initiator.prepare().await;
    initiator
        .engine
        .negotiate_as_initiator(SESSION, REQUESTER)
        .await
        .unwrap();

    let emitted = initiator.transport().emitted_candidates().len();
    assert!(emitted > 0);
    eventually(|| {
        store
            .inner
            .candidates(SESSION, CandidateDirection::Initiator)
            .len()
            == emitted
    })
    .await;

    let record = store.inner.get(SESSION).await.unwrap().unwrap();
    let offered = record.current_offer().unwrap().created_at.unwrap();
    for candidate in store
        .inner
        .candidates(SESSION, CandidateDirection::Initiator)
    {
        assert!(candidate.created_at >= offered);
    }
}

#[tokio_timeout_test(60, paused)]
async fn answer_to_an_earlier_offer_is_ignored() {
    let now = Arc::new(Mutex::new(datetime!(2026-03-01 09:00 UTC)));
    let source = now.clone();
    let store = MemoryStore::with_clock(Arc::new(move || *source.lock()));
    store
        .set_merge(
            SESSION,
            CallSessionPatch::default().offer(SessionDescription::offer("old-offer", REQUESTER)),
        )
        .await
        .unwrap();
    store
        .set_merge(
            SESSION,
            CallSessionPatch::default()
                .answer(SessionDescription::answer("old-answer", INTERPRETER)),
        )
        .await
        .unwrap();
    *now.lock() = datetime!(2026-03-01 09:05 UTC);

    let initiator = Endpoint::new("initiator", Arc::new(store.clone()));
    initiator.prepare().await;
    initiator
        .engine
        .negotiate_as_initiator(SESSION, REQUESTER)
        .await
        .unwrap();

    sleep(Duration::from_secs(2)).await;
    assert_eq!(initiator.engine.state(), CallState::AwaitingAnswer);
    assert_eq!(initiator.transport().remote_sets(), 0);

    let responder = Endpoint::new("responder", Arc::new(store.clone()));
    responder.prepare().await;
    responder
        .engine
        .negotiate_as_responder(SESSION, INTERPRETER)
        .await
        .unwrap();
    initiator
        .engine
        .wait_for(CallState::Connected, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(initiator.transport().remote_sets(), 1);
}

#[tokio_timeout_test(10)]
async fn offer_write_failure_ends_the_call() {
    let store = CountingStore::new();
    let initiator = Endpoint::new("initiator", store.clone());
    initiator.prepare().await;
    store.fail_writes(true);

    let err = initiator
        .engine
        .negotiate_as_initiator(SESSION, REQUESTER)
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::StoreUnavailable(_)));
    assert_eq!(initiator.engine.state(), CallState::Ended);
    assert_eq!(store.inner.tracked_sessions(), 0);
    assert_eq!(initiator.media.live_tracks(), 0);
    assert_eq!(initiator.transport().close_count(), 1);
    assert!(matches!(
        initiator
            .engine
            .negotiate_as_initiator(SESSION, REQUESTER)
            .await,
        Err(CallError::Ended)
    ));
}

#[tokio_timeout_test(10)]
async fn steps_out_of_order_are_rejected() {
    let store = CountingStore::new();
    let endpoint = Endpoint::new("initiator", store.clone());

    assert!(matches!(
        endpoint
            .engine
            .negotiate_as_initiator(SESSION, REQUESTER)
            .await,
        Err(CallError::TransportNotReady)
    ));
    assert!(matches!(
        endpoint.engine.create_transport(|_| {}).await,
        Err(CallError::InvalidState {
            from: CallState::Idle,
            ..
        })
    ));
    assert_eq!(endpoint.engine.state(), CallState::Idle);
    assert_eq!(store.writes(), 0);
}

#[tokio_timeout_test(10)]
async fn media_failures_leave_the_call_idle() {
    let store = CountingStore::new();
    let endpoint = Endpoint::new("initiator", store.clone());
    endpoint
        .media
        .fail(TrackSource::Camera, MediaError::DeviceBusy("camera".into()));

    let err = endpoint.engine.acquire_media(true, true).await.unwrap_err();
    assert!(matches!(err, CallError::DeviceBusy(_)));
    assert!(err.is_media_failure());
    assert_eq!(endpoint.engine.state(), CallState::Idle);

    // Audio-only still works once the user decides to go without the camera.
    let media = endpoint.engine.acquire_media(false, true).await.unwrap();
    assert!(media.video_track().is_none());
    assert_eq!(endpoint.engine.state(), CallState::MediaReady);
}
