//! Presence-counted merge of redundant feeds into one route table.
//!
//! Every route carries a presence set: the feeds currently reporting it, each
//! tagged with the session generation it was last reported in. A route is
//! visible while its presence set is non-empty, and shows the attributes of
//! the most recent report among the feeds still present.
//!
//! Feeds never touch entries directly. A feed connection drives one source
//! through [`MergedTable::begin_sync`], the `apply_*` operations and
//! [`MergedTable::source_down`]; the table owns every mutation.
//!
//! Routes live in a [`DashMap`], so writers only contend when they hit the
//! same shard, and [`MergedTable::snapshot`] copies entries shard by shard
//! without waiting for unrelated writers. Per-source session state sits
//! behind a separate lock that is only written on session transitions.

use crate::error::MergeError;
use crate::metrics::TableMetrics;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use ris_types::{AddressFamily, RouteAttributes, RouteKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Session counter of one source, bumped on every full resynchronization.
pub type Generation = u64;

const DEFAULT_CHANGE_CAPACITY: usize = 4096;

/// Identifies one upstream feed within a merged table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(Arc<str>);

impl SourceId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Incremental change notification for consumers of a merged table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteChange {
    Added {
        key: RouteKey,
        attributes: Arc<RouteAttributes>,
    },
    Changed {
        key: RouteKey,
        attributes: Arc<RouteAttributes>,
    },
    Removed {
        key: RouteKey,
    },
    /// The table became (true) or stopped being (false) authoritative.
    Authoritative(bool),
}

#[derive(Debug, Clone)]
struct Report {
    generation: Generation,
    seq: u64,
    attributes: Arc<RouteAttributes>,
}

#[derive(Debug)]
struct MergedEntry {
    presence: HashMap<SourceId, Report>,
    shown: Arc<RouteAttributes>,
}

impl MergedEntry {
    fn new(source: SourceId, report: Report) -> Self {
        let shown = Arc::clone(&report.attributes);
        let mut presence = HashMap::with_capacity(2);
        presence.insert(source, report);
        Self { presence, shown }
    }

    /// Re-selects the displayed attributes from the newest report still
    /// present. Returns the new attributes if they differ from before.
    fn reselect(&mut self) -> Option<Arc<RouteAttributes>> {
        let newest = self.presence.values().max_by_key(|r| r.seq)?;
        if *newest.attributes == *self.shown {
            return None;
        }
        self.shown = Arc::clone(&newest.attributes);
        Some(Arc::clone(&self.shown))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Down,
    Synchronizing,
    Synchronized,
}

#[derive(Debug, Clone, Copy)]
struct SourceSession {
    generation: Generation,
    phase: SessionPhase,
}

#[derive(Debug, Default)]
struct Sessions {
    by_source: HashMap<SourceId, SourceSession>,
    ready: bool,
}

impl Sessions {
    fn live(&self) -> usize {
        self.by_source
            .values()
            .filter(|s| s.phase != SessionPhase::Down)
            .count()
    }
}

/// The merged route table of one address family in one routing instance.
pub struct MergedTable {
    family: AddressFamily,
    routes: DashMap<RouteKey, MergedEntry>,
    sessions: RwLock<Sessions>,
    seq: AtomicU64,
    closed: AtomicBool,
    changes: broadcast::Sender<RouteChange>,
    metrics: Option<TableMetrics>,
}

impl MergedTable {
    pub fn new(family: AddressFamily) -> Self {
        Self::with_capacity(family, DEFAULT_CHANGE_CAPACITY)
    }

    /// `change_capacity` bounds how far a change subscriber may lag before
    /// it starts missing notifications.
    pub fn with_capacity(family: AddressFamily, change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity.max(1));
        Self {
            family,
            routes: DashMap::new(),
            sessions: RwLock::new(Sessions::default()),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            changes,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: TableMetrics) -> Self {
        metrics.routes.set(0);
        metrics.ready.set(0);
        self.metrics = Some(metrics);
        self
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// True once any source finished its initial sync, until every source
    /// has lost its session.
    pub fn is_ready(&self) -> bool {
        self.sessions.read().ready
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Subscribe to incremental changes. Receivers that lag more than the
    /// channel capacity get `RecvError::Lagged` and should resnapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<RouteChange> {
        self.changes.subscribe()
    }

    /// Point-in-time copy of every visible route, ordered by key.
    pub fn snapshot(&self) -> Vec<(RouteKey, Arc<RouteAttributes>)> {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(&entry.value().shown)))
            .collect();
        routes.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        routes
    }

    pub fn get(&self, key: &RouteKey) -> Option<Arc<RouteAttributes>> {
        self.routes.get(key).map(|e| Arc::clone(&e.shown))
    }

    pub fn contains(&self, key: &RouteKey) -> bool {
        self.routes.contains_key(key)
    }

    /// Sources currently marking `key` present, with the generation of
    /// their last report.
    pub fn presence(&self, key: &RouteKey) -> Vec<(SourceId, Generation)> {
        let mut presence: Vec<_> = self
            .routes
            .get(key)
            .map(|e| {
                e.presence
                    .iter()
                    .map(|(s, r)| (s.clone(), r.generation))
                    .collect()
            })
            .unwrap_or_default();
        presence.sort();
        presence
    }

    /// Current session generation of `source`, if it ever connected.
    pub fn generation(&self, source: &SourceId) -> Option<Generation> {
        self.sessions
            .read()
            .by_source
            .get(source)
            .map(|s| s.generation)
    }

    /// Starts a new full-resync session for `source` and returns its
    /// generation. Routes from earlier generations stay visible until the
    /// matching [`apply_end_of_sync`](Self::apply_end_of_sync).
    pub fn begin_sync(&self, source: &SourceId) -> Result<Generation, MergeError> {
        self.ensure_open()?;

        let mut sessions = self.sessions.write();
        let session = sessions
            .by_source
            .entry(source.clone())
            .or_insert(SourceSession {
                generation: 0,
                phase: SessionPhase::Down,
            });
        session.generation += 1;
        session.phase = SessionPhase::Synchronizing;
        let generation = session.generation;

        debug!(afi = %self.family, %source, generation, "Feed session started");
        Ok(generation)
    }

    /// Upserts `key` as reported by `source`; last writer wins for the
    /// displayed attributes.
    pub fn apply_add(
        &self,
        key: RouteKey,
        attributes: RouteAttributes,
        source: &SourceId,
        generation: Generation,
    ) -> Result<(), MergeError> {
        self.check_event(&key, source, generation)?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let report = Report {
            generation,
            seq,
            attributes: Arc::new(attributes),
        };

        match self.routes.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.presence.insert(source.clone(), report);
                if let Some(attributes) = entry.reselect() {
                    trace!(afi = %self.family, route = %key, %source, "Route changed");
                    self.emit(RouteChange::Changed { key, attributes });
                    self.count(|m| &m.changed);
                }
            }
            Entry::Vacant(vacant) => {
                let attributes = Arc::clone(&report.attributes);
                vacant.insert(MergedEntry::new(source.clone(), report));
                trace!(afi = %self.family, route = %key, %source, "Route added");
                self.emit(RouteChange::Added { key, attributes });
                self.count(|m| &m.added);
                self.adjust_route_gauge(1);
            }
        }

        Ok(())
    }

    /// Removes `source` from the presence set of `key`. The route disappears
    /// only when no source marks it present any more.
    pub fn apply_withdraw(
        &self,
        key: RouteKey,
        source: &SourceId,
        generation: Generation,
    ) -> Result<(), MergeError> {
        self.check_event(&key, source, generation)?;

        if let Entry::Occupied(mut occupied) = self.routes.entry(key) {
            let entry = occupied.get_mut();
            if entry.presence.remove(source).is_none() {
                return Ok(());
            }

            if entry.presence.is_empty() {
                occupied.remove();
                trace!(afi = %self.family, route = %key, %source, "Route removed");
                self.emit(RouteChange::Removed { key });
                self.count(|m| &m.removed);
                self.adjust_route_gauge(-1);
            } else if let Some(attributes) = entry.reselect() {
                self.emit(RouteChange::Changed { key, attributes });
                self.count(|m| &m.changed);
            }
        }

        Ok(())
    }

    /// Completes the initial sync of `source`'s session `generation`.
    ///
    /// Every presence of `source` from an older generation was not refreshed
    /// during this session and is dropped. Returns the number of presences
    /// purged.
    pub fn apply_end_of_sync(
        &self,
        source: &SourceId,
        generation: Generation,
    ) -> Result<usize, MergeError> {
        self.ensure_open()?;

        {
            let sessions = self.sessions.read();
            let session = sessions
                .by_source
                .get(source)
                .ok_or_else(|| MergeError::UnknownFeed(source.to_string()))?;
            if session.generation != generation {
                return Err(MergeError::StaleGeneration {
                    feed: source.to_string(),
                    got: generation,
                    current: session.generation,
                });
            }
            if session.phase != SessionPhase::Synchronizing {
                return Err(MergeError::NotSynchronizing(source.to_string()));
            }
        }

        let purged = self.remove_presence(source, |report| report.generation < generation);

        let became_ready = {
            let mut sessions = self.sessions.write();
            if let Some(session) = sessions.by_source.get_mut(source) {
                if session.generation == generation {
                    session.phase = SessionPhase::Synchronized;
                }
            }
            let became_ready = !sessions.ready;
            sessions.ready = true;
            became_ready
        };

        info!(
            afi = %self.family,
            %source,
            generation,
            purged,
            routes = self.len(),
            "Feed synchronized"
        );

        if became_ready {
            self.set_ready(true);
        }

        Ok(purged)
    }

    /// Marks the session of `source` as lost. Its routes stay visible; they
    /// are reconciled on the next resync or by [`purge_source`](Self::purge_source).
    pub fn source_down(&self, source: &SourceId) {
        let lost_authority = {
            let mut sessions = self.sessions.write();
            match sessions.by_source.get_mut(source) {
                Some(session) if session.phase != SessionPhase::Down => {
                    session.phase = SessionPhase::Down;
                }
                _ => return,
            }
            if sessions.ready && sessions.live() == 0 {
                sessions.ready = false;
                true
            } else {
                false
            }
        };

        debug!(afi = %self.family, %source, "Feed session lost");

        if lost_authority {
            warn!(afi = %self.family, routes = self.len(), "All feeds lost, table no longer authoritative");
            self.set_ready(false);
        }
    }

    /// Drops the presences of `source` that its current session has not
    /// reported: all of them while the source is down, earlier generations
    /// while it is resynchronizing. Used when a feed stays out of sync past
    /// the staleness timeout.
    pub fn purge_source(&self, source: &SourceId) -> usize {
        let current = self
            .sessions
            .read()
            .by_source
            .get(source)
            .filter(|s| s.phase != SessionPhase::Down)
            .map(|s| s.generation);
        let purged = self.remove_presence(source, |report| Some(report.generation) != current);
        if purged > 0 {
            info!(afi = %self.family, %source, purged, "Purged stale routes of disconnected feed");
        }
        purged
    }

    /// Rejects every further operation. Used on teardown so that nothing is
    /// written after the owning routing instance is gone.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(), MergeError> {
        if self.is_closed() {
            return Err(MergeError::Closed);
        }
        Ok(())
    }

    fn check_event(
        &self,
        key: &RouteKey,
        source: &SourceId,
        generation: Generation,
    ) -> Result<(), MergeError> {
        self.ensure_open()?;

        if key.family() != self.family {
            return Err(MergeError::FamilyMismatch {
                route: key.to_string(),
                table: self.family,
            });
        }

        let sessions = self.sessions.read();
        let session = sessions
            .by_source
            .get(source)
            .ok_or_else(|| MergeError::UnknownFeed(source.to_string()))?;
        if session.generation != generation || session.phase == SessionPhase::Down {
            return Err(MergeError::StaleGeneration {
                feed: source.to_string(),
                got: generation,
                current: session.generation,
            });
        }

        Ok(())
    }

    fn remove_presence(&self, source: &SourceId, stale: impl Fn(&Report) -> bool) -> usize {
        let mut purged = 0;
        let mut removed = 0i64;

        self.routes.retain(|key, entry| {
            if !entry.presence.get(source).is_some_and(&stale) {
                return true;
            }
            entry.presence.remove(source);
            purged += 1;

            if entry.presence.is_empty() {
                self.emit(RouteChange::Removed { key: *key });
                self.count(|m| &m.removed);
                removed += 1;
                return false;
            }
            if let Some(attributes) = entry.reselect() {
                self.emit(RouteChange::Changed {
                    key: *key,
                    attributes,
                });
                self.count(|m| &m.changed);
            }
            true
        });

        if let Some(metrics) = &self.metrics {
            metrics.purged.inc_by(purged as u64);
        }
        self.adjust_route_gauge(-removed);
        purged
    }

    fn set_ready(&self, ready: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.ready.set(i64::from(ready));
        }
        self.emit(RouteChange::Authoritative(ready));
    }

    fn emit(&self, change: RouteChange) {
        // No receivers is fine; notifications are best effort.
        let _ = self.changes.send(change);
    }

    fn count(&self, counter: impl Fn(&TableMetrics) -> &prometheus::IntCounter) {
        if let Some(metrics) = &self.metrics {
            counter(metrics).inc();
        }
    }

    fn adjust_route_gauge(&self, delta: i64) {
        if let Some(metrics) = &self.metrics {
            metrics.routes.add(delta);
        }
    }
}

impl fmt::Debug for MergedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedTable")
            .field("family", &self.family)
            .field("routes", &self.routes.len())
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .finish()
    }
}
