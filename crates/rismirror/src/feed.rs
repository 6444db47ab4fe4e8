//! Feed connections: one upstream RIB subscription per table and source.
//!
//! A [`FeedConnection`] owns the reconnect loop for a single (routing
//! instance, address family, source) triple. Each session it opens runs
//! through `Connecting → Synchronizing → Synchronized` and ends in
//! `Disconnected`, after which the loop backs off and reconnects until it is
//! cancelled.
//!
//! The connection only talks to its [`MergedTable`] through the session
//! operations (`begin_sync`, `apply_*`, `source_down`); it never holds table
//! state across an await point.

use crate::backoff::Backoff;
use crate::config::FeedConfig;
use crate::error::{FeedError, MergeError};
use crate::merged_table::{Generation, MergedTable, SourceId};
use crate::metrics::FeedMetrics;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use ris_types::{AddressFamily, IpAddress, RouteAttributes, RouteDistinguisher, RouteKey};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One message of an upstream RIB stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Add {
        key: RouteKey,
        attributes: RouteAttributes,
    },
    Withdraw {
        key: RouteKey,
    },
    /// The initial table dump is complete; everything after is incremental.
    EndOfSync,
}

/// What a feed connection asks its upstream for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObserveRequest {
    pub router: String,
    pub address: IpAddress,
    pub vrf_id: u64,
    pub afi: AddressFamily,
    /// Stream the RIB even if upstream has not converged on it yet
    pub allow_unready_rib: bool,
}

pub type FeedStream = BoxStream<'static, Result<FeedEvent, FeedError>>;

/// A streaming RIB subscription service.
///
/// `observe` resolves once the subscription is established. Dropping the
/// returned stream ends the subscription.
#[async_trait]
pub trait RibSubscriber: Send + Sync {
    async fn observe(&self, request: ObserveRequest) -> Result<FeedStream, FeedError>;
}

/// One upstream feed endpoint, shared by every table it serves.
#[derive(Clone)]
pub struct FeedSource {
    pub name: Arc<str>,
    pub subscriber: Arc<dyn RibSubscriber>,
}

impl FeedSource {
    pub fn new(name: impl Into<Arc<str>>, subscriber: Arc<dyn RibSubscriber>) -> Self {
        Self {
            name: name.into(),
            subscriber,
        }
    }
}

impl fmt::Debug for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSource").field("name", &self.name).finish()
    }
}

/// Lifecycle of a feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedState {
    Connecting,
    Synchronizing,
    Synchronized,
    Disconnected,
}

impl FeedState {
    /// Numeric encoding exported as the feed state gauge.
    pub const fn as_i64(&self) -> i64 {
        match self {
            FeedState::Connecting => 0,
            FeedState::Synchronizing => 1,
            FeedState::Synchronized => 2,
            FeedState::Disconnected => 3,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            FeedState::Connecting => "connecting",
            FeedState::Synchronizing => "synchronizing",
            FeedState::Synchronized => "synchronized",
            FeedState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a running feed connection.
#[derive(Debug)]
pub struct FeedHandle {
    source: Arc<str>,
    state: watch::Receiver<FeedState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FeedHandle {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    /// Watch state transitions of this connection.
    pub fn subscribe_state(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    /// Cancels the connection and waits for its task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(source = %self.source, error = %e, "Feed task ended abnormally");
        }
    }
}

/// The reconnect loop of one feed.
pub struct FeedConnection {
    source: FeedSource,
    source_id: SourceId,
    request: ObserveRequest,
    table: Arc<MergedTable>,
    connect_timeout: Duration,
    stale_route_timeout: Option<Duration>,
    backoff: Backoff,
    state: watch::Sender<FeedState>,
    metrics: Option<FeedMetrics>,
    cancel: CancellationToken,
}

impl FeedConnection {
    pub fn new(
        source: FeedSource,
        request: ObserveRequest,
        table: Arc<MergedTable>,
        config: &FeedConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(FeedState::Connecting);
        Self {
            source_id: SourceId::new(Arc::clone(&source.name)),
            source,
            request,
            table,
            connect_timeout: config.connect_timeout(),
            stale_route_timeout: config.stale_route_timeout(),
            backoff: Backoff::new(config.retry_initial_delay(), config.retry_max_delay()),
            state,
            metrics: None,
            cancel,
        }
    }

    pub fn with_metrics(mut self, metrics: FeedMetrics) -> Self {
        metrics.set_state(FeedState::Connecting);
        self.metrics = Some(metrics);
        self
    }

    /// Starts the reconnect loop on the runtime.
    pub fn spawn(self) -> FeedHandle {
        let handle_state = self.state.subscribe();
        let source = Arc::clone(&self.source.name);
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run());

        FeedHandle {
            source,
            state: handle_state,
            cancel,
            task,
        }
    }

    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut staleness = Staleness::new(self.stale_route_timeout);
        debug!(
            router = %self.request.router,
            vrf = %RouteDistinguisher::new(self.request.vrf_id),
            afi = %self.request.afi,
            source = %self.source_id,
            "Feed connection started"
        );

        loop {
            self.set_state(FeedState::Connecting);

            // The staleness deadline keeps running while a new session
            // connects or resynchronizes.
            let outcome = {
                let session = self.session();
                tokio::pin!(session);
                loop {
                    let deadline = staleness.deadline();
                    tokio::select! {
                        _ = cancel.cancelled() => break None,
                        outcome = &mut session => break Some(outcome),
                        _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                            self.purge_stale(&mut staleness);
                        }
                    }
                }
            };
            let Some(outcome) = outcome else {
                break;
            };

            let reached = *self.state.borrow();
            self.table.source_down(&self.source_id);
            self.set_state(FeedState::Disconnected);
            staleness.session_ended(reached, Instant::now());
            if reached == FeedState::Synchronized {
                self.backoff.reset();
            }

            match outcome {
                Err(FeedError::Merge(MergeError::Closed)) => break,
                Err(e) if e.is_protocol() => {
                    warn!(
                        afi = %self.request.afi,
                        source = %self.source_id,
                        error = %e,
                        "Feed protocol error, resynchronizing"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.protocol_errors.inc();
                    }
                }
                Err(e) => {
                    warn!(
                        afi = %self.request.afi,
                        source = %self.source_id,
                        attempt = self.backoff.attempts() + 1,
                        error = %e,
                        "Feed disconnected"
                    );
                }
                Ok(()) => {}
            }

            let delay = self.backoff.next_delay();
            if !self.pause(delay, &cancel, &mut staleness).await {
                break;
            }
            if let Some(metrics) = &self.metrics {
                metrics.reconnects.inc();
            }
        }

        // Cancelled mid-session; the table keeps the routes until its owner
        // closes it.
        self.table.source_down(&self.source_id);
        self.set_state(FeedState::Disconnected);
        debug!(afi = %self.request.afi, source = %self.source_id, "Feed connection stopped");
    }

    /// One subscription, from connect to stream end. Only returns on error:
    /// a stream that ends cleanly is still a lost session.
    async fn session(&self) -> Result<(), FeedError> {
        let mut stream = tokio::time::timeout(
            self.connect_timeout,
            self.source.subscriber.observe(self.request.clone()),
        )
        .await
        .map_err(|_| FeedError::ConnectTimeout(self.connect_timeout))??;

        let generation = self.table.begin_sync(&self.source_id)?;
        self.set_state(FeedState::Synchronizing);

        let mut session = Session::new(generation);
        while let Some(event) = stream.next().await {
            match event? {
                FeedEvent::Add { key, attributes } => {
                    self.table
                        .apply_add(key, attributes, &self.source_id, session.generation)?;
                }
                FeedEvent::Withdraw { key } => {
                    self.table
                        .apply_withdraw(key, &self.source_id, session.generation)?;
                }
                FeedEvent::EndOfSync => {
                    session.end_of_sync()?;
                    self.table
                        .apply_end_of_sync(&self.source_id, session.generation)?;
                    self.set_state(FeedState::Synchronized);
                }
            }
        }

        Err(FeedError::Closed)
    }

    /// Sleeps for `delay`, running the staleness purge if its deadline falls
    /// inside the pause. Returns false if cancelled.
    async fn pause(
        &self,
        delay: Duration,
        cancel: &CancellationToken,
        staleness: &mut Staleness,
    ) -> bool {
        let wake = Instant::now() + delay;
        loop {
            let deadline = staleness.deadline();
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(wake) => return true,
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    self.purge_stale(staleness);
                }
            }
        }
    }

    fn purge_stale(&self, staleness: &mut Staleness) {
        // A session that synchronized since the deadline was armed
        // reconciled the table itself.
        let state = *self.state.borrow();
        if state == FeedState::Synchronized {
            staleness.synchronized();
            return;
        }

        staleness.purged = true;
        let purged = self.table.purge_source(&self.source_id);
        debug!(
            afi = %self.request.afi,
            source = %self.source_id,
            %state,
            purged,
            "Feed stale past timeout, routes purged"
        );
    }

    fn set_state(&self, state: FeedState) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_state(state);
        }
        info!(
            router = %self.request.router,
            afi = %self.request.afi,
            source = %self.source_id,
            from = %previous,
            to = %state,
            "Feed state changed"
        );
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Staleness purge bookkeeping for one feed.
///
/// The deadline runs from the moment the feed lost its last synchronized
/// session and is cleared only by the next one. A session that wrote routes
/// but ended before synchronizing re-arms it, so those routes are purged on
/// the same deadline.
#[derive(Debug)]
struct Staleness {
    timeout: Option<Duration>,
    since: Option<Instant>,
    purged: bool,
}

impl Staleness {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            since: None,
            purged: false,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match (self.timeout, self.since) {
            (Some(timeout), Some(since)) if !self.purged => Some(since + timeout),
            _ => None,
        }
    }

    fn synchronized(&mut self) {
        self.since = None;
        self.purged = false;
    }

    /// Records the end of a session that last reached `reached`.
    fn session_ended(&mut self, reached: FeedState, now: Instant) {
        match reached {
            FeedState::Synchronized => {
                self.since = Some(now);
                self.purged = false;
            }
            FeedState::Synchronizing => {
                self.since.get_or_insert(now);
                self.purged = false;
            }
            FeedState::Connecting | FeedState::Disconnected => {
                self.since.get_or_insert(now);
            }
        }
    }
}

/// Per-session protocol checks.
#[derive(Debug)]
struct Session {
    generation: Generation,
    synchronized: bool,
}

impl Session {
    fn new(generation: Generation) -> Self {
        Self {
            generation,
            synchronized: false,
        }
    }

    fn end_of_sync(&mut self) -> Result<(), FeedError> {
        if self.synchronized {
            return Err(FeedError::UnexpectedEndOfSync);
        }
        self.synchronized = true;
        Ok(())
    }
}
