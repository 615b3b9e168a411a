//! Approval flows driven through the bus into payload entries.

use std::sync::Arc;
use std::time::Duration;

use approval_bus::{ApprovalBus, ApprovalPublisher};
use payload_core::{
    payload_key, ApprovalConfig, ApprovalStatus, CacheConfig, ChannelMessage, FetchStatus,
    PayloadClient, PayloadError,
};

/// Entries here are never observed, so they are kept until removed.
fn client() -> PayloadClient {
    let config = CacheConfig {
        cache_time_ms: None,
        ..CacheConfig::for_testing()
    };
    PayloadClient::new(config).unwrap()
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_signed_over_bus_closes_channel() {
    let bus = ApprovalBus::new();
    let client = client();
    let entry = client.entry::<String>(&payload_key!["approval", "abc"]).unwrap();
    entry.attach_approval(
        Box::new(bus.channel_for("abc")),
        ApprovalConfig {
            payload_uuid: Some("abc".into()),
            expires_in: None,
        },
    );
    assert_eq!(bus.subscriptions_for("abc"), 1);

    bus.publish("abc", ChannelMessage::opened()).await;
    settle().await;
    assert_eq!(entry.state().approval.unwrap().status, ApprovalStatus::Scanned);

    bus.publish("abc", ChannelMessage::signed("abc")).await;
    settle().await;
    assert_eq!(entry.state().approval.unwrap().status, ApprovalStatus::Signed);
    assert_eq!(bus.subscriptions_for("abc"), 0);

    // Late messages find nobody listening.
    assert_eq!(bus.publish("abc", ChannelMessage::rejected()).await, 0);
    assert_eq!(entry.state().approval.unwrap().status, ApprovalStatus::Signed);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_frame_surfaces_error() {
    let bus = ApprovalBus::new();
    let client = client();
    let entry = client.entry::<String>(&payload_key!["approval", "def"]).unwrap();
    entry.attach_approval(Box::new(bus.channel_for("def")), ApprovalConfig::default());

    bus.publish_frame("def", r#"{"signed": false}"#).unwrap();
    settle().await;

    let state = entry.state();
    assert_eq!(state.approval.unwrap().status, ApprovalStatus::Rejected);
    assert_eq!(state.status, FetchStatus::Error);
    assert!(matches!(state.error, Some(PayloadError::ChannelRejected { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_local_expiry_closes_bus_channel() {
    let bus = Arc::new(ApprovalBus::new());
    let client = client();
    let entry = client.entry::<String>(&payload_key!["approval", "ghi"]).unwrap();
    entry.attach_approval(
        Box::new(bus.channel_for("ghi")),
        ApprovalConfig {
            payload_uuid: Some("ghi".into()),
            expires_in: Some(Duration::from_secs(30)),
        },
    );

    bus.publish("ghi", ChannelMessage::opened()).await;
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(entry.state().approval.unwrap().status, ApprovalStatus::Scanned);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let state = entry.state();
    assert_eq!(state.approval.unwrap().status, ApprovalStatus::Expired);
    assert!(matches!(state.error, Some(PayloadError::Expired { .. })));
    assert_eq!(bus.subscriptions_for("ghi"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_bus_shutdown_surfaces_channel_error() {
    let bus = ApprovalBus::new();
    let client = client();
    let entry = client.entry::<String>(&payload_key!["approval", "jkl"]).unwrap();
    entry.attach_approval(Box::new(bus.channel_for("jkl")), ApprovalConfig::default());
    bus.publish("jkl", ChannelMessage::opened()).await;
    settle().await;

    drop(bus);
    settle().await;

    let state = entry.state();
    assert_eq!(state.status, FetchStatus::Error);
    assert!(matches!(state.error, Some(PayloadError::Channel(_))));
    assert_eq!(state.approval.unwrap().status, ApprovalStatus::Scanned);
}
