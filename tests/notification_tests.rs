mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use congregate::bus::LoopbackBus;
use congregate::events::{ClientEvent, FriendshipEvent, GroupRequestProcessedEvent, PushEvent};
use congregate::models::{NotificationKind, NotificationRef, ServerFriendshipStatus};
use congregate::notifications::{EmbeddedOutcome, NotificationEngine};
use congregate::SyncError;

use common::{friend_request, info_notification, FakeApi};

/// Let spawned background calls run to completion.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn setup(api: FakeApi) -> (Arc<FakeApi>, Arc<LoopbackBus>, NotificationEngine) {
    let api = Arc::new(api);
    let bus = Arc::new(LoopbackBus::authenticated());
    let engine = NotificationEngine::new(api.clone(), bus.clone());
    (api, bus, engine)
}

#[tokio::test]
async fn mount_subscribes_and_loads() {
    let (_api, bus, engine) = setup(FakeApi::new().with_notifications(vec![
        info_notification("n1"),
        info_notification("n2"),
    ]));
    let list = engine.mount().await.unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(engine.unread_count().await, 2);
    assert_eq!(bus.emitted(), [ClientEvent::SubscribeNotifications]);
}

#[tokio::test]
async fn snapshot_replaces_pushed_entries() {
    let (api, _bus, engine) = setup(FakeApi::new().with_notifications(vec![info_notification("n1")]));
    engine.mount().await.unwrap();
    engine
        .apply_push(&PushEvent::NewNotification(info_notification("n2")))
        .await;
    assert_eq!(engine.notifications().await.len(), 2);

    *api.notifications.lock().unwrap() = vec![info_notification("n3")];
    engine.load_snapshot().await.unwrap();
    let ids: Vec<_> = engine.notifications().await.into_iter().map(|n| n.id).collect();
    assert_eq!(ids, ["n3"]);
}

#[tokio::test]
async fn accepted_status_clears_friend_request_from_that_user() {
    let (_api, _bus, engine) = setup(FakeApi::new().with_notifications(vec![
        friend_request("n1", "ana", "f1"),
        info_notification("n2"),
    ]));
    engine.mount().await.unwrap();

    engine
        .apply_push(&PushEvent::FriendshipStatusChanged(FriendshipEvent {
            user_id: "ana".into(),
            status: Some(ServerFriendshipStatus::Aceptada),
            is_sender: None,
            friendship_id: None,
        }))
        .await;

    let list = engine.notifications().await;
    assert!(!list
        .iter()
        .any(|n| n.kind == NotificationKind::FriendRequest && n.is_from("ana")));
    assert_eq!(list.len(), 1);
}

#[tokio::test]
async fn cancelled_request_is_removed() {
    let (_api, _bus, engine) = setup(
        FakeApi::new().with_notifications(vec![friend_request("n1", "ana", "f1")]),
    );
    engine.mount().await.unwrap();
    engine
        .apply_push(&PushEvent::FriendRequestCancelled(FriendshipEvent {
            user_id: "ana".into(),
            status: None,
            is_sender: None,
            friendship_id: None,
        }))
        .await;
    assert!(engine.notifications().await.is_empty());
}

#[tokio::test]
async fn group_processed_clears_matching_join_requests() {
    let mut join = info_notification("n1");
    join.kind = NotificationKind::GroupJoinRequest;
    join.sender_id = Some("u5".into());
    join.reference = Some(NotificationRef {
        group_id: Some("g1".into()),
        ..Default::default()
    });
    let (_api, _bus, engine) = setup(FakeApi::new().with_notifications(vec![join]));
    engine.mount().await.unwrap();

    engine
        .apply_push(&PushEvent::GroupRequestProcessed(GroupRequestProcessedEvent {
            group_id: "g1".into(),
            applicant_id: Some("u5".into()),
        }))
        .await;
    assert!(engine.notifications().await.is_empty());
}

#[tokio::test]
async fn mark_read_is_local_first_and_ignores_server_failure() {
    let (api, _bus, engine) = setup(FakeApi::new().with_notifications(vec![info_notification("n1")]));
    engine.mount().await.unwrap();

    api.fail_next("mark_notification_read", || SyncError::Transport("offline".into()));
    engine.mark_read("n1").await;

    assert!(engine.notifications().await[0].read);
    assert_eq!(engine.unread_count().await, 0);

    settle().await;
    assert_eq!(api.count("mark_notification_read"), 1);
    assert!(engine.notifications().await[0].read);

    // Already read: no second call.
    engine.mark_read("n1").await;
    settle().await;
    assert_eq!(api.count("mark_notification_read"), 1);
}

#[tokio::test]
async fn double_accept_sends_one_request() {
    let n1 = friend_request("n1", "bea", "f1");
    let (api, _bus, engine) = setup(FakeApi::new().with_notifications(vec![n1.clone()]));
    engine.mount().await.unwrap();

    let (first, second) = tokio::join!(
        engine.accept_embedded_request(&n1),
        engine.accept_embedded_request(&n1)
    );
    assert_eq!(first.unwrap(), EmbeddedOutcome::Done);
    assert_eq!(second.unwrap(), EmbeddedOutcome::AlreadyProcessing);

    assert_eq!(api.calls().iter().filter(|c| *c == "accept_friendship:f1").count(), 1);
    assert_eq!(api.count("delete_notification"), 1);
    assert!(engine.notifications().await.is_empty());
}

#[tokio::test]
async fn already_processed_counts_as_success() {
    let n1 = friend_request("n1", "bea", "f1");
    let (api, _bus, engine) = setup(FakeApi::new().with_notifications(vec![n1.clone()]));
    engine.mount().await.unwrap();

    api.fail_next("reject_friendship", || {
        SyncError::AlreadyProcessed("request already processed".into())
    });
    let outcome = engine.reject_embedded_request(&n1).await.unwrap();
    assert_eq!(outcome, EmbeddedOutcome::Done);
    assert!(engine.notifications().await.is_empty());
}

#[tokio::test]
async fn failure_releases_the_guard_for_retry() {
    let n1 = friend_request("n1", "bea", "f1");
    let (api, _bus, engine) = setup(FakeApi::new().with_notifications(vec![n1.clone()]));
    engine.mount().await.unwrap();

    api.fail_next("accept_friendship", || SyncError::Transport("offline".into()));
    let err = engine.accept_embedded_request(&n1).await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
    assert_eq!(engine.notifications().await.len(), 1);

    let outcome = engine.accept_embedded_request(&n1).await.unwrap();
    assert_eq!(outcome, EmbeddedOutcome::Done);
    assert_eq!(api.count("accept_friendship"), 2);
}

#[tokio::test]
async fn church_request_is_answered_through_its_endpoint() {
    let mut join = info_notification("n1");
    join.kind = NotificationKind::ChurchJoinRequest;
    join.reference = Some(NotificationRef {
        church_id: Some("ch1".into()),
        applicant_id: Some("u9".into()),
        ..Default::default()
    });
    let (api, _bus, engine) = setup(FakeApi::new().with_notifications(vec![join.clone()]));
    engine.mount().await.unwrap();

    engine.accept_embedded_request(&join).await.unwrap();
    assert!(api
        .calls()
        .contains(&"respond_church_request:ch1/u9/accept".to_string()));
}

#[tokio::test]
async fn plain_notification_has_nothing_to_accept() {
    let n = info_notification("n1");
    let (api, _bus, engine) = setup(FakeApi::new().with_notifications(vec![n.clone()]));
    engine.mount().await.unwrap();

    let err = engine.accept_embedded_request(&n).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert_eq!(api.count("delete_notification"), 0);
    assert_eq!(engine.notifications().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn polling_repulls_every_thirty_seconds() {
    let (api, _bus, engine) = setup(FakeApi::new());
    let engine = Arc::new(engine);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run_polling(shutdown_rx).await }
    });

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(api.count("list_notifications"), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(api.count("list_notifications"), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(api.count("list_notifications"), 2);

    shutdown_tx.send(true).unwrap();
    poller.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn polling_survives_errors() {
    let (api, _bus, engine) = setup(FakeApi::new().with_notifications(vec![info_notification("n1")]));
    let engine = Arc::new(engine);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    api.fail_next("list_notifications", || SyncError::Transport("offline".into()));

    let poller = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run_polling(shutdown_rx).await }
    });

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(api.count("list_notifications"), 2);
    assert_eq!(engine.notifications().await.len(), 1);

    shutdown_tx.send(true).unwrap();
    poller.await.unwrap();
}
