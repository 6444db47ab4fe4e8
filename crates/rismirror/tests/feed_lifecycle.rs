//! End-to-end feed behaviour through the registry.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use ris_types::{AddressFamily, RouteDistinguisher};
use rismirror::{FeedConfig, FeedError, FeedState, MetricsCollector, RouteChange, RouterRegistry};
use std::sync::Arc;
use std::time::Duration;

const V4: AddressFamily = AddressFamily::Ipv4Unicast;
const V6: AddressFamily = AddressFamily::Ipv6Unicast;

fn registry() -> RouterRegistry {
    RouterRegistry::new(test_feed_config())
}

#[tokio::test]
async fn test_route_survives_single_feed_loss() {
    let registry = registry();
    let (source_a, feed_a) = channel_feed("a");
    let (source_b, feed_b) = channel_feed("b");
    let rd = RouteDistinguisher::default();

    let router = registry
        .add_target("core01", "192.0.2.1".parse().unwrap(), &[source_a, source_b], &[rd])
        .unwrap();
    let vrf = router.get_vrf(rd).unwrap();
    let table = Arc::clone(vrf.table(V4));

    let session_a = feed_a.open_session(V4);
    let session_b = feed_b.open_session(V4);
    for session in [&session_a, &session_b] {
        session.send(add("10.0.0.0/8", "192.0.2.10")).await.unwrap();
        session.send(end_of_sync()).await.unwrap();
    }

    wait_until("both feeds synchronized", || {
        vrf.feed_state(V4, "a") == Some(FeedState::Synchronized)
            && vrf.feed_state(V4, "b") == Some(FeedState::Synchronized)
    })
    .await;
    assert!(router.ready(rd, 1).unwrap());
    assert_eq!(table.presence(&key("10.0.0.0/8")).len(), 2);

    // Source a disconnects.
    drop(session_a);
    wait_until("feed a down", || {
        vrf.feed_state(V4, "a") != Some(FeedState::Synchronized)
    })
    .await;
    assert_eq!(
        table.get(&key("10.0.0.0/8")).as_deref(),
        Some(&nh("192.0.2.10"))
    );
    assert!(table.is_ready());

    // Source b withdraws it.
    session_b.send(withdraw("10.0.0.0/8")).await.unwrap();
    wait_until("route withdrawn", || !table.contains(&key("10.0.0.0/8"))).await;
    assert!(table.is_empty());

    registry.shutdown().await;
}

#[tokio::test]
async fn test_resync_purges_route_not_reported_again() {
    let registry = registry();
    let (source, feed) = channel_feed("a");
    let rd = RouteDistinguisher::default();

    let router = registry
        .add_target("core01", "2001:db8::1".parse().unwrap(), &[source], &[rd])
        .unwrap();
    let vrf = router.get_vrf(rd).unwrap();
    let table = Arc::clone(vrf.table(V6));

    let session = feed.open_session(V6);
    session.send(add("2001:db8::/32", "2001:db8::ff")).await.unwrap();
    session.send(end_of_sync()).await.unwrap();
    wait_until("first sync", || table.is_ready()).await;
    assert!(table.contains(&key("2001:db8::/32")));

    drop(session);
    wait_until("feed down", || vrf.feed_state(V6, "a") != Some(FeedState::Synchronized)).await;
    assert!(table.contains(&key("2001:db8::/32")));

    let session = feed.open_session(V6);
    session.send(add("2001:db8:1::/48", "2001:db8::ff")).await.unwrap();
    wait_until("resync started", || table.contains(&key("2001:db8:1::/48"))).await;
    // Not purged before the new generation's end-of-sync.
    assert!(table.contains(&key("2001:db8::/32")));

    session.send(end_of_sync()).await.unwrap();
    wait_until("stale route purged", || !table.contains(&key("2001:db8::/32"))).await;
    assert_eq!(table.len(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_both_families_subscribed_per_source() {
    let registry = registry();
    let (source, feed) = channel_feed("a");
    let rd = RouteDistinguisher::from_parts(65000, 42);

    registry
        .add_target("core01", "192.0.2.1".parse().unwrap(), &[source], &[rd])
        .unwrap();

    wait_until("both families observed", || feed.observe_count() == 2).await;
    let mut requests = feed.requests();
    requests.sort_by_key(|r| r.afi);

    assert_eq!(requests[0].afi, V4);
    assert_eq!(requests[1].afi, V6);
    for request in &requests {
        assert_eq!(request.router, "core01");
        assert_eq!(request.vrf_id, rd.as_u64());
        assert!(request.allow_unready_rib);
    }

    registry.shutdown().await;
}

#[tokio::test]
async fn test_second_end_of_sync_forces_resync() {
    let collector = MetricsCollector::new().unwrap();
    let registry = registry().with_metrics(collector.clone());
    let (source, feed) = channel_feed("a");
    let rd = RouteDistinguisher::default();

    let router = registry
        .add_target("core01", "192.0.2.1".parse().unwrap(), &[source], &[rd])
        .unwrap();
    let vrf = router.get_vrf(rd).unwrap();
    let table = Arc::clone(vrf.table(V4));

    let session = feed.open_session(V4);
    session.send(add("10.0.0.0/8", "192.0.2.10")).await.unwrap();
    session.send(end_of_sync()).await.unwrap();
    session.send(end_of_sync()).await.unwrap();

    let errors = collector
        .feed_metrics("core01", rd, V4, "a")
        .protocol_errors;
    wait_until("protocol error counted", || errors.get() == 1).await;
    wait_until("reconnect attempted", || feed.observe_count() >= 3).await;

    // Partial contributions stay until the next session reconciles them.
    assert!(table.contains(&key("10.0.0.0/8")));

    let session = feed.open_session(V4);
    session.send(end_of_sync()).await.unwrap();
    wait_until("purged on resync", || table.is_empty()).await;
    assert_eq!(vrf.feed_state(V4, "a"), Some(FeedState::Synchronized));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_malformed_event_forces_resync() {
    let registry = registry();
    let (source, feed) = channel_feed("a");
    let rd = RouteDistinguisher::default();

    let router = registry
        .add_target("core01", "192.0.2.1".parse().unwrap(), &[source], &[rd])
        .unwrap();
    let vrf = router.get_vrf(rd).unwrap();

    let session = feed.open_session(V4);
    session
        .send(Err(FeedError::Malformed("bad line".to_string())))
        .await
        .unwrap();

    // One observe per family, plus the v4 reconnect.
    wait_until("reconnect after malformed event", || feed.observe_count() >= 3).await;
    assert_ne!(vrf.feed_state(V4, "a"), Some(FeedState::Synchronized));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_total_feed_loss_keeps_routes_and_drops_readiness() {
    let registry = registry();
    let (source, feed) = channel_feed("a");
    let rd = RouteDistinguisher::default();

    let router = registry
        .add_target("core01", "192.0.2.1".parse().unwrap(), &[source], &[rd])
        .unwrap();
    let table = Arc::clone(router.get_vrf(rd).unwrap().table(V4));
    let mut changes = table.subscribe();

    let session = feed.open_session(V4);
    session.send(add("10.0.0.0/8", "192.0.2.10")).await.unwrap();
    session.send(end_of_sync()).await.unwrap();
    wait_until("ready", || table.is_ready()).await;

    drop(session);
    wait_until("not ready", || !table.is_ready()).await;
    assert!(table.contains(&key("10.0.0.0/8")));
    assert!(!router.ready(rd, 1).unwrap());

    let received: Vec<_> = std::iter::from_fn(|| changes.try_recv().ok()).collect();
    assert_eq!(
        received.last(),
        Some(&RouteChange::Authoritative(false))
    );
    assert!(received.contains(&RouteChange::Authoritative(true)));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_stale_routes_purged_after_timeout() {
    let registry = stale_registry();
    let (source, feed) = channel_feed("a");
    let rd = RouteDistinguisher::default();

    let router = registry
        .add_target("core01", "192.0.2.1".parse().unwrap(), &[source], &[rd])
        .unwrap();
    let table = Arc::clone(router.get_vrf(rd).unwrap().table(V4));

    let session = feed.open_session(V4);
    session.send(add("10.0.0.0/8", "192.0.2.10")).await.unwrap();
    session.send(end_of_sync()).await.unwrap();
    wait_until("synchronized", || table.is_ready()).await;

    // The failing session is followed by reconnect attempts that keep
    // failing, so the feed stays down past the timeout.
    drop(session);
    drop(feed);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(table.contains(&key("10.0.0.0/8")));

    wait_until("stale routes purged", || table.is_empty()).await;

    registry.shutdown().await;
}

fn stale_registry() -> RouterRegistry {
    RouterRegistry::new(FeedConfig {
        stale_route_timeout_secs: 1,
        ..test_feed_config()
    })
}

#[tokio::test]
async fn test_partial_session_after_purge_is_purged_again() {
    let registry = stale_registry();
    let (source, feed) = channel_feed("a");
    let rd = RouteDistinguisher::default();

    let router = registry
        .add_target("core01", "192.0.2.1".parse().unwrap(), &[source], &[rd])
        .unwrap();
    let table = Arc::clone(router.get_vrf(rd).unwrap().table(V4));

    let session = feed.open_session(V4);
    session.send(add("10.0.0.0/8", "192.0.2.10")).await.unwrap();
    session.send(end_of_sync()).await.unwrap();
    wait_until("synchronized", || table.is_ready()).await;

    drop(session);
    wait_until("stale routes purged", || table.is_empty()).await;

    // Reconnects and drops again before end-of-sync.
    let session = feed.open_session(V4);
    session.send(add("10.9.0.0/16", "192.0.2.10")).await.unwrap();
    wait_until("partial route added", || table.contains(&key("10.9.0.0/16"))).await;
    drop(session);

    wait_until("partial session purged", || table.is_empty()).await;

    registry.shutdown().await;
}

#[tokio::test]
async fn test_stale_routes_purged_while_stuck_synchronizing() {
    let registry = stale_registry();
    let (source, feed) = channel_feed("a");
    let rd = RouteDistinguisher::default();

    let router = registry
        .add_target("core01", "192.0.2.1".parse().unwrap(), &[source], &[rd])
        .unwrap();
    let vrf = router.get_vrf(rd).unwrap();
    let table = Arc::clone(vrf.table(V4));

    let session = feed.open_session(V4);
    session.send(add("10.0.0.0/8", "192.0.2.10")).await.unwrap();
    session.send(end_of_sync()).await.unwrap();
    wait_until("synchronized", || table.is_ready()).await;

    // The next session starts resynchronizing but never finishes.
    drop(session);
    let session = feed.open_session(V4);
    session.send(add("10.1.0.0/16", "192.0.2.10")).await.unwrap();
    wait_until("resync started", || table.contains(&key("10.1.0.0/16"))).await;
    assert_eq!(vrf.feed_state(V4, "a"), Some(FeedState::Synchronizing));

    wait_until("previous session purged", || !table.contains(&key("10.0.0.0/8"))).await;
    assert_eq!(vrf.feed_state(V4, "a"), Some(FeedState::Synchronizing));
    assert_eq!(table.len(), 1);

    // The session still finishes normally.
    session.send(end_of_sync()).await.unwrap();
    wait_until("synchronized again", || table.is_ready()).await;
    assert!(table.contains(&key("10.1.0.0/16")));

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_instance_creation_is_idempotent() {
    let registry = Arc::new(registry());
    let (source_a, _feed_a) = channel_feed("a");
    let (source_b, _feed_b) = channel_feed("b");
    let sources = Arc::new(vec![source_a, source_b]);
    let rd = RouteDistinguisher::from_parts(65000, 1);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let sources = Arc::clone(&sources);
            tokio::spawn(async move {
                let router = registry
                    .get_or_create_router("core01", "192.0.2.1".parse().unwrap())
                    .unwrap();
                router.get_or_create_vrf(rd, &sources).unwrap()
            })
        })
        .collect();

    let mut vrfs = Vec::new();
    for task in tasks {
        vrfs.push(task.await.unwrap());
    }

    assert!(vrfs.iter().all(|vrf| Arc::ptr_eq(vrf, &vrfs[0])));
    assert_eq!(registry.routers().len(), 1);
    assert_eq!(registry.get_router("core01").unwrap().vrfs().len(), 1);
    // Two families times two sources, never duplicated.
    assert_eq!(vrfs[0].feed_count(), 4);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_feeds_and_closes_tables() {
    let registry = registry();
    let (source, feed) = channel_feed("a");
    let rd = RouteDistinguisher::default();

    let router = registry
        .add_target("core01", "192.0.2.1".parse().unwrap(), &[source], &[rd])
        .unwrap();
    let vrf = router.get_vrf(rd).unwrap();
    let table = Arc::clone(vrf.table(V4));

    let session = feed.open_session(V4);
    session.send(add("10.0.0.0/8", "192.0.2.10")).await.unwrap();
    wait_until("route added", || !table.is_empty()).await;

    registry.shutdown().await;

    assert!(table.is_closed());
    assert_eq!(vrf.feed_count(), 0);
    // The stream is gone; nothing can be written after teardown.
    assert!(session.send(add("10.1.0.0/16", "192.0.2.10")).await.is_err());
    assert!(!table.contains(&key("10.1.0.0/16")));
}
