//! End-to-end scenarios through the client, observer and entry APIs.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use payload_core::{
    fetch_fn, payload_key, ApprovalConfig, ApprovalFlow, ApprovalStatus, ApprovalTransition,
    CacheConfig, ChannelMessage, EntryEvent, EntryObserver, FetchFn, FetchStatus,
    ManualScheduler, MockEventChannel, NotifyOnChangeProps, PayloadClient, PayloadError,
    PayloadKey, PayloadObserver, PayloadState, RetryPolicy,
};

fn tokio_client() -> PayloadClient {
    PayloadClient::new(CacheConfig::for_testing()).unwrap()
}

fn manual_client() -> (PayloadClient, Arc<ManualScheduler>) {
    let scheduler = Arc::new(ManualScheduler::new());
    let client =
        PayloadClient::with_scheduler(CacheConfig::for_testing(), scheduler.clone()).unwrap();
    (client, scheduler)
}

/// Fails `failures` times, then returns the call number.
fn flaky(calls: &Arc<AtomicUsize>, failures: usize) -> FetchFn<u64> {
    let calls = Arc::clone(calls);
    fetch_fn(move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n <= failures {
                anyhow::bail!("node unavailable (attempt {n})");
            }
            Ok(n as u64)
        }
    })
}

fn slow(calls: &Arc<AtomicUsize>, value: u64) -> FetchFn<u64> {
    let calls = Arc::clone(calls);
    fetch_fn(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(value)
        }
    })
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_fetch() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = payload_key!["balance", "addr1"];
    let options = client.payload_options().fetch(slow(&calls, 1_000));

    let (a, b) = tokio::join!(
        client.fetch_payload(&key, options.clone(), None),
        client.fetch_payload(&key, options.clone(), None),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(*a, 1_000);
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test(start_paused = true)]
async fn test_two_failures_then_success_resets_failure_count() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = payload_key!["balance", "addr2"];
    let options = client
        .payload_options()
        .fetch(flaky(&calls, 2))
        .retry(RetryPolicy::Count(3));

    let data = client.fetch_payload(&key, options, None).await.unwrap();
    assert_eq!(*data, 3);

    let state = client.get_payload_state::<u64>(&key).unwrap().unwrap();
    assert_eq!(state.status, FetchStatus::Success);
    assert_eq!(state.failure_count, 0);
    assert!(state.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_error_once() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let settled = Arc::new(AtomicUsize::new(0));
    let key = payload_key!["balance", "addr3"];

    let e = Arc::clone(&errors);
    let s = Arc::clone(&settled);
    let options = client
        .observer_options(key.clone(), Some(flaky(&calls, usize::MAX)))
        .retry(3u32)
        .on_error(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        })
        .on_settled(move |data, error| {
            assert!(data.is_none());
            assert!(error.is_some());
            s.fetch_add(1, Ordering::SeqCst);
        });
    let observer = PayloadObserver::new(&client, options).unwrap();
    observer.subscribe(|_| {});

    tokio::time::sleep(Duration::from_secs(5)).await;

    let state = client.get_payload_state::<u64>(&key).unwrap().unwrap();
    assert_eq!(state.status, FetchStatus::Error);
    assert_eq!(state.failure_count, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(settled.load(Ordering::SeqCst), 1);
    assert!(matches!(state.error, Some(PayloadError::Fetch(_))));
}

#[tokio::test]
async fn test_signed_approval_closes_channel_and_ignores_late_messages() {
    let (client, _) = manual_client();
    let entry = client.entry::<u64>(&payload_key!["approval", "login"]).unwrap();
    let (channel, remote) = MockEventChannel::pair();
    entry.attach_approval(Box::new(channel), ApprovalConfig::default());

    assert!(remote.emit(ChannelMessage::opened()));
    assert_eq!(
        entry.state().approval.unwrap().status,
        ApprovalStatus::Scanned
    );

    assert!(remote.emit(ChannelMessage::signed("abc")));
    let approval = entry.state().approval.unwrap();
    assert_eq!(approval.status, ApprovalStatus::Signed);
    assert_eq!(approval.payload_uuid.as_deref(), Some("abc"));
    assert!(remote.is_closed());
    assert_eq!(remote.close_calls(), 1);

    assert!(!remote.emit(ChannelMessage::rejected()));
    assert_eq!(
        entry.apply_channel_message(ChannelMessage::rejected()),
        ApprovalTransition::Ignored
    );
    assert_eq!(
        entry.state().approval.unwrap().status,
        ApprovalStatus::Signed
    );
}

#[tokio::test]
async fn test_countdown_expiry_notifies_subscribers_with_terminal_error() {
    let (client, scheduler) = manual_client();
    let key = payload_key!["approval", "transfer"];
    let entry = client.entry::<u64>(&key).unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&errors);
    let options = client
        .observer_options::<u64>(key, None)
        .enabled(false)
        .on_error(move |err| seen.lock().push(err.clone()));
    let observer = PayloadObserver::new(&client, options).unwrap();
    let last_status = Arc::new(Mutex::new(None));
    let status = Arc::clone(&last_status);
    observer.subscribe(move |result| {
        *status.lock() = Some(result.unwrap().status());
    });

    let (channel, remote) = MockEventChannel::pair();
    entry.attach_approval(Box::new(channel), ApprovalConfig::default());
    assert!(remote.emit(ChannelMessage::expires_in(30)));

    scheduler.advance(Duration::from_secs(29));
    assert_eq!(
        entry.state().approval.unwrap().status,
        ApprovalStatus::Created
    );

    scheduler.advance(Duration::from_secs(1));
    let state = entry.state();
    assert_eq!(state.approval.unwrap().status, ApprovalStatus::Expired);
    assert_eq!(state.status, FetchStatus::Error);
    assert!(remote.is_closed());
    assert_eq!(remote.close_calls(), 1);

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], PayloadError::Expired { .. }));
    assert_eq!(*last_status.lock(), Some(FetchStatus::Error));
}

#[tokio::test]
async fn test_countdown_after_signed_does_not_close_again() {
    let (client, scheduler) = manual_client();
    let entry = client.entry::<u64>(&payload_key!["approval", "withdraw"]).unwrap();
    let (channel, remote) = MockEventChannel::pair();
    entry.attach_approval(
        Box::new(channel),
        ApprovalConfig {
            payload_uuid: None,
            expires_in: Some(Duration::from_secs(30)),
        },
    );

    assert!(remote.emit(ChannelMessage::expires_in(10)));
    assert!(remote.emit(ChannelMessage::signed("abc")));
    assert_eq!(remote.close_calls(), 1);

    scheduler.advance(Duration::from_secs(60));
    let state = entry.state();
    assert_eq!(state.approval.unwrap().status, ApprovalStatus::Signed);
    assert!(state.error.is_none());
    assert_eq!(remote.close_calls(), 1);
}

#[tokio::test]
async fn test_silent_channel_expires_after_configured_lifetime() {
    let config = CacheConfig {
        approval_expiry_secs: 45,
        cache_time_ms: None,
        ..CacheConfig::for_testing()
    };
    let scheduler = Arc::new(ManualScheduler::new());
    let client = PayloadClient::with_scheduler(config, scheduler.clone()).unwrap();
    let entry = client.entry::<u64>(&payload_key!["approval", "silent"]).unwrap();
    let (channel, remote) = MockEventChannel::pair();
    entry.attach_approval(Box::new(channel), ApprovalConfig::default());

    scheduler.advance(Duration::from_secs(44));
    assert_eq!(
        entry.state().approval.unwrap().status,
        ApprovalStatus::Created
    );

    scheduler.advance(Duration::from_secs(1));
    let state = entry.state();
    assert_eq!(state.approval.unwrap().status, ApprovalStatus::Expired);
    assert!(matches!(state.error, Some(PayloadError::Expired { .. })));
    assert_eq!(remote.close_calls(), 1);
}

// =============================================================================
// PROPERTIES
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_many_callers_receive_the_same_error() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let entry = client
        .cache()
        .get_or_create(
            &PayloadKey::from("failing"),
            client.payload_options().fetch(flaky(&calls, usize::MAX)),
        )
        .unwrap();

    let results = join_all((0..8).map(|_| entry.fetch(false))).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let first = results[0].clone().unwrap_err();
    assert!(results.iter().all(|r| r.as_ref().unwrap_err() == &first));
}

struct InvariantWatcher {
    violations: AtomicUsize,
    events: AtomicUsize,
}

impl EntryObserver<u64> for InvariantWatcher {
    fn on_entry_update(&self, event: &EntryEvent<u64>) {
        self.events.fetch_add(1, Ordering::SeqCst);
        if event.state.check_invariant().is_err() {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        if event.state.status == FetchStatus::Success {
            assert_eq!(event.state.failure_count, 0);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_every_notified_state_satisfies_invariant() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let entry = client
        .cache()
        .get_or_create(
            &PayloadKey::from("watched"),
            client
                .payload_options()
                .fetch(flaky(&calls, 1))
                .retry(RetryPolicy::Count(1)),
        )
        .unwrap();
    let watcher = Arc::new(InvariantWatcher {
        violations: AtomicUsize::new(0),
        events: AtomicUsize::new(0),
    });
    entry.add_observer(1, watcher.clone());

    entry.fetch(false).await.unwrap();
    entry.invalidate();
    entry.set_data(9);
    entry.fetch(false).await.unwrap();

    assert!(watcher.events.load(Ordering::SeqCst) >= 6);
    assert_eq!(watcher.violations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_infinite_stale_time_never_schedules_refetch() {
    let (client, scheduler) = manual_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = PayloadKey::from("static");
    client.set_payload_data(&key, 5u64).unwrap();

    let options = client
        .observer_options(key, Some(flaky(&calls, 0)))
        .stale_time(None);
    let observer = PayloadObserver::new(&client, options).unwrap();
    observer.subscribe(|_| {});

    assert_eq!(scheduler.pending(), 0);
    scheduler.advance(Duration::from_secs(24 * 3_600));
    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!observer.result().unwrap().is_stale());
}

#[tokio::test]
async fn test_zero_stale_time_is_stale_immediately() {
    let (client, _) = manual_client();
    let key = PayloadKey::from("volatile");
    client.set_payload_data(&key, 5u64).unwrap();

    let options = client
        .observer_options::<u64>(key, None)
        .enabled(false)
        .stale_time(Some(Duration::ZERO));
    let observer = PayloadObserver::new(&client, options).unwrap();
    assert!(observer.result().unwrap().is_stale());
}

#[tokio::test]
async fn test_unobserved_entry_evicted_only_after_cache_time() {
    let (client, scheduler) = manual_client();
    let key = PayloadKey::from("session");
    let options = client
        .observer_options::<u64>(key.clone(), None)
        .enabled(false)
        .cache_time(Some(Duration::from_secs(10)));
    let observer = PayloadObserver::new(&client, options).unwrap();
    observer.subscribe(|_| {});
    scheduler.advance(Duration::from_secs(60));
    assert_eq!(client.cache().len(), 1);

    drop(observer);
    scheduler.advance(Duration::from_millis(9_999));
    assert_eq!(client.cache().len(), 1);
    scheduler.advance(Duration::from_millis(1));
    assert!(client.cache().is_empty());
    assert!(client.get_payload_data::<u64>(&key).unwrap().is_none());
}

#[test]
fn test_approval_sequences_are_deterministic() {
    let mut flow = ApprovalFlow::new(None, None);
    flow.apply(&ChannelMessage::opened());
    flow.apply(&ChannelMessage::signed("abc"));
    assert_eq!(flow.status(), ApprovalStatus::Signed);

    let mut flow = ApprovalFlow::new(None, None);
    flow.apply(&ChannelMessage::rejected());
    assert_eq!(flow.status(), ApprovalStatus::Rejected);

    for late in [
        ChannelMessage::opened(),
        ChannelMessage::signed("late"),
        ChannelMessage::expired(),
    ] {
        assert_eq!(flow.apply(&late), ApprovalTransition::Ignored);
    }
    assert_eq!(flow.status(), ApprovalStatus::Rejected);
}

// =============================================================================
// OBSERVER BEHAVIOUR
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_tracked_props_filter_notifications() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = PayloadKey::from("tracked");
    let options = client.observer_options(key, Some(slow(&calls, 7)));
    let observer = PayloadObserver::new(&client, options).unwrap();

    let notifications = Arc::new(AtomicUsize::new(0));
    let n = Arc::clone(&notifications);
    observer.subscribe(move |result| {
        n.fetch_add(1, Ordering::SeqCst);
        // Only `data` is read, so fetch-status flips alone do not notify.
        let _ = result.unwrap().data().cloned();
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let after_first = notifications.load(Ordering::SeqCst);
    assert_eq!(**observer.result().unwrap().data().unwrap(), 7);

    // Same value, new Arc: `data` changes, so exactly one more notification.
    observer.refetch().await.unwrap();
    assert_eq!(notifications.load(Ordering::SeqCst), after_first + 1);
}

#[tokio::test(start_paused = true)]
async fn test_notify_all_reports_fetch_transitions() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let options = client
        .observer_options(PayloadKey::from("all"), Some(slow(&calls, 1)))
        .notify_on_change_props(NotifyOnChangeProps::All);
    let observer = PayloadObserver::new(&client, options).unwrap();
    let seen = Arc::clone(&statuses);
    observer.subscribe(move |result| seen.lock().push(result.unwrap().untracked().status));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        *statuses.lock(),
        vec![FetchStatus::Fetching, FetchStatus::Success]
    );
}

#[tokio::test(start_paused = true)]
async fn test_keep_previous_data_across_key_change() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = client
        .observer_options(payload_key!["page", 1], Some(slow(&calls, 1)))
        .keep_previous_data(true);
    let observer = PayloadObserver::new(&client, options.clone()).unwrap();
    observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut next = options;
    next.key = payload_key!["page", 2];
    observer.set_options(next).unwrap();

    let during = observer.result().unwrap();
    assert!(during.is_previous_data());
    assert!(during.is_fetching());
    assert_eq!(**during.data().unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = observer.result().unwrap();
    assert!(!after.is_previous_data());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_error_boundary_raises_from_result() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = client
        .observer_options(PayloadKey::from("boundary"), Some(flaky(&calls, usize::MAX)))
        .use_error_boundary(true);
    let observer = PayloadObserver::new(&client, options).unwrap();
    observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(observer.result(), Err(PayloadError::Fetch(_))));
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_refetches_subscribed_observers() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = payload_key!["tx", "history"];
    let options = client
        .observer_options(key.clone(), Some(slow(&calls, 3)))
        .stale_time(None);
    let observer = PayloadObserver::new(&client, options).unwrap();
    observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(client.invalidate_payloads(&PayloadKey::from("tx")), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!observer.result().unwrap().is_stale());
}

#[tokio::test(start_paused = true)]
async fn test_offline_fetch_pauses_until_reconnect() {
    let config = CacheConfig {
        network_mode: payload_core::NetworkMode::Online,
        ..CacheConfig::for_testing()
    };
    let client = PayloadClient::new(config).unwrap();
    client.set_online(false);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = PayloadKey::from("offline");
    let entry = client
        .cache()
        .get_or_create(&key, client.payload_options().fetch(slow(&calls, 4)))
        .unwrap();

    let pending = entry.fetch(false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(entry.state().is_paused);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    client.set_online(true);
    assert_eq!(*pending.await.unwrap(), 4);
    assert!(!entry.state().is_paused);
}

#[tokio::test(start_paused = true)]
async fn test_interval_polls_only_while_focused() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = client
        .observer_options(PayloadKey::from("ticker"), Some(flaky(&calls, 0)))
        .refetch_interval(payload_core::RefetchInterval::Every(Duration::from_secs(1)));
    let observer = PayloadObserver::new(&client, options).unwrap();
    observer.subscribe(|_| {});

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let focused_calls = calls.load(Ordering::SeqCst);
    assert_eq!(focused_calls, 4);

    client.set_focused(false);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(calls.load(Ordering::SeqCst), focused_calls);
}

#[tokio::test(start_paused = true)]
async fn test_dynamic_interval_follows_entry_data() {
    let client = tokio_client();
    let calls = Arc::new(AtomicUsize::new(0));
    // Poll once data exists, stop once the value reaches 3.
    let interval = payload_core::RefetchInterval::dynamic(|state: &PayloadState<u64>| {
        match state.data.as_deref() {
            Some(&n) if n < 3 => Some(Duration::from_secs(1)),
            _ => None,
        }
    });
    let options = client
        .observer_options(PayloadKey::from("dynamic"), Some(flaky(&calls, 0)))
        .refetch_interval(interval);
    let observer = PayloadObserver::new(&client, options).unwrap();
    observer.subscribe(|_| {});

    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(**observer.result().unwrap().data().unwrap(), 3);
}
