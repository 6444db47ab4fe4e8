//! Shared helpers for rismirror integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use ris_types::{AddressFamily, IpAddress, RouteAttributes, RouteKey};
use rismirror::{FeedConfig, FeedError, FeedEvent, FeedSource, FeedStream, ObserveRequest, RibSubscriber};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;

pub type SessionSender = mpsc::Sender<Result<FeedEvent, FeedError>>;
type SessionReceiver = mpsc::Receiver<Result<FeedEvent, FeedError>>;

/// Feed whose sessions are opened and scripted by the test.
///
/// `observe` blocks until the test opens a session for the requested
/// family; dropping the session sender ends the stream.
pub struct ChannelSubscriber {
    pending: HashMap<AddressFamily, Mutex<mpsc::UnboundedReceiver<SessionReceiver>>>,
    observes: AtomicUsize,
    requests: parking_lot::Mutex<Vec<ObserveRequest>>,
}

/// Test side of a [`ChannelSubscriber`].
pub struct FeedDriver {
    sessions: HashMap<AddressFamily, mpsc::UnboundedSender<SessionReceiver>>,
    subscriber: Arc<ChannelSubscriber>,
}

impl FeedDriver {
    /// Queues a session for the next `observe` on `family`.
    pub fn open_session(&self, family: AddressFamily) -> SessionSender {
        let (tx, rx) = mpsc::channel(64);
        self.sessions[&family].send(rx).unwrap();
        tx
    }

    pub fn observe_count(&self) -> usize {
        self.subscriber.observes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ObserveRequest> {
        self.subscriber.requests.lock().clone()
    }
}

#[async_trait]
impl RibSubscriber for ChannelSubscriber {
    async fn observe(&self, request: ObserveRequest) -> Result<FeedStream, FeedError> {
        self.observes.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let session = self.pending[&request.afi].lock().await.recv().await;
        match session {
            Some(rx) => Ok(ReceiverStream::new(rx).boxed()),
            None => Err(FeedError::Connect {
                endpoint: "channel".to_string(),
                reason: "driver dropped".to_string(),
            }),
        }
    }
}

/// A scripted feed source called `name`.
pub fn channel_feed(name: &str) -> (FeedSource, FeedDriver) {
    let mut pending = HashMap::new();
    let mut sessions = HashMap::new();
    for family in AddressFamily::ALL {
        let (tx, rx) = mpsc::unbounded_channel();
        pending.insert(family, Mutex::new(rx));
        sessions.insert(family, tx);
    }

    let subscriber = Arc::new(ChannelSubscriber {
        pending,
        observes: AtomicUsize::new(0),
        requests: parking_lot::Mutex::new(Vec::new()),
    });
    let source = FeedSource::new(name, Arc::clone(&subscriber) as Arc<dyn RibSubscriber>);
    (source, FeedDriver { sessions, subscriber })
}

/// Feed settings for tests: never time out a pending observe, retry fast.
pub fn test_feed_config() -> FeedConfig {
    FeedConfig {
        connect_timeout_secs: 3600,
        retry_initial_delay_ms: 10,
        retry_max_delay_secs: 1,
        ..FeedConfig::default()
    }
}

pub fn key(prefix: &str) -> RouteKey {
    RouteKey::new(prefix.parse().unwrap())
}

pub fn nh(address: &str) -> RouteAttributes {
    RouteAttributes::with_next_hop(address.parse::<IpAddress>().unwrap())
}

pub fn add(prefix: &str, next_hop: &str) -> Result<FeedEvent, FeedError> {
    Ok(FeedEvent::Add {
        key: key(prefix),
        attributes: nh(next_hop),
    })
}

pub fn withdraw(prefix: &str) -> Result<FeedEvent, FeedError> {
    Ok(FeedEvent::Withdraw { key: key(prefix) })
}

pub fn end_of_sync() -> Result<FeedEvent, FeedError> {
    Ok(FeedEvent::EndOfSync)
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
