//! Per-subscription reconciliation of snapshots and push updates.
//!
//! [`Reconciler`] is the synchronous core: it owns one subscription's
//! table and folds snapshot results and push records into it. The async
//! driver in [`crate::subscription`] feeds it from a single task, so no two
//! mutations ever run at once and nothing here locks.
//!
//! Every applied push advances a sequence number and stamps the fields it
//! wrote. A snapshot fetch remembers the sequence at issue time; when the
//! response lands, fields stamped later keep their pushed values, matches
//! first seen through a later push survive, and matches a later push
//! removed stay removed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use matchfeed_core::view::project;
use matchfeed_core::{
    CanonicalId, FilterSpec, MatchEntity, MatchField, MatchView, SubscriptionId, ViewFilter,
};
use matchfeed_ingest::{ingest_record, ingest_snapshot, IdentityError};
use matchfeed_transport::{SnapshotScope, TransportError};
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Upper bound on remembered push-side removals.
const MAX_TOMBSTONES: usize = 4096;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

pub type ViewSnapshot = Arc<Vec<MatchView>>;

/// "Still mounted" flag shared between a reconciler and whoever owns its UI surface.
#[derive(Debug, Clone)]
pub struct MountGuard(Arc<AtomicBool>);

impl MountGuard {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_mounted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn unmount(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for MountGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Init,
    Fetching,
    Ready,
    Unmounted,
}

/// Handle for one issued snapshot fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    issued_at_seq: u64,
    scope: SnapshotScope,
}

impl FetchTicket {
    pub fn scope(&self) -> SnapshotScope {
        self.scope
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Applied { matches: usize, dropped: usize },
    Failed(String),
    /// A newer fetch already landed.
    Stale,
    Unmounted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Merged(CanonicalId),
    Inserted(CanonicalId),
    Removed(CanonicalId),
    Ignored(CanonicalId),
    Dropped(IdentityError),
    Unmounted,
}

#[derive(Debug, Clone)]
struct TrackedMatch {
    entity: MatchEntity,
    /// Push sequence that created the entry; 0 for snapshot entries.
    created_seq: u64,
    stamps: BTreeMap<MatchField, u64>,
}

impl TrackedMatch {
    fn from_snapshot(entity: MatchEntity) -> Self {
        Self {
            entity,
            created_seq: 0,
            stamps: BTreeMap::new(),
        }
    }

    fn stamp(&mut self, fields: &[MatchField], seq: u64) {
        for field in fields {
            self.stamps.insert(*field, seq);
        }
    }
}

pub struct Reconciler {
    id: SubscriptionId,
    label: String,
    spec: FilterSpec,
    view_filter: ViewFilter,
    state: ReconcilerState,
    guard: MountGuard,
    clock: Clock,
    order: VecDeque<CanonicalId>,
    table: HashMap<CanonicalId, TrackedMatch>,
    tombstones: HashMap<CanonicalId, u64>,
    pending_fetches: usize,
    push_seq: u64,
    issued_generation: u64,
    applied_generation: u64,
    mutations: u64,
    last_error: Option<String>,
    views: watch::Sender<ViewSnapshot>,
}

impl Reconciler {
    pub fn new(
        label: impl Into<String>,
        spec: FilterSpec,
        guard: MountGuard,
        clock: Clock,
    ) -> Self {
        let (views, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            id: SubscriptionId::new(),
            label: label.into(),
            view_filter: spec.view_filter(),
            spec,
            state: ReconcilerState::Init,
            guard,
            clock,
            order: VecDeque::new(),
            table: HashMap::new(),
            tombstones: HashMap::new(),
            pending_fetches: 0,
            push_seq: 0,
            issued_generation: 0,
            applied_generation: 0,
            mutations: 0,
            last_error: None,
            views,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn state(&self) -> ReconcilerState {
        if self.guard.is_mounted() {
            self.state
        } else {
            ReconcilerState::Unmounted
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.guard.is_mounted() && self.state != ReconcilerState::Unmounted
    }

    /// Count of applied table mutations.
    pub fn mutation_count(&self) -> u64 {
        self.mutations
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn entity(&self, id: &CanonicalId) -> Option<&MatchEntity> {
        self.table.get(id).map(|t| &t.entity)
    }

    /// Entities in table order.
    pub fn entities(&self) -> impl Iterator<Item = &MatchEntity> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.table.get(id).map(|t| &t.entity))
    }

    pub fn subscribe_views(&self) -> watch::Receiver<ViewSnapshot> {
        self.views.subscribe()
    }

    pub fn current_views(&self) -> ViewSnapshot {
        self.views.borrow().clone()
    }

    /// Issue a snapshot fetch for the current filter spec.
    pub fn begin_fetch(&mut self) -> Option<FetchTicket> {
        if !self.is_mounted() {
            return None;
        }
        self.issued_generation += 1;
        self.pending_fetches += 1;
        self.state = ReconcilerState::Fetching;
        let scope = if self.spec.status_filter.uses_live_endpoint() {
            SnapshotScope::LiveOnly
        } else {
            SnapshotScope::All
        };
        Some(FetchTicket {
            generation: self.issued_generation,
            issued_at_seq: self.push_seq,
            scope,
        })
    }

    pub fn complete_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<JsonValue, TransportError>,
    ) -> FetchOutcome {
        if !self.is_mounted() {
            return FetchOutcome::Unmounted;
        }
        self.pending_fetches = self.pending_fetches.saturating_sub(1);
        if ticket.generation <= self.applied_generation {
            debug!(
                subscription = %self.label,
                generation = ticket.generation,
                "discarding stale snapshot"
            );
            self.forget_settled_tombstones();
            return FetchOutcome::Stale;
        }
        if ticket.generation == self.issued_generation {
            self.state = ReconcilerState::Ready;
        }

        let body = match result {
            Ok(body) => body,
            Err(err) => {
                let message = err.to_string();
                warn!(
                    subscription = %self.label,
                    error = %message,
                    "snapshot fetch failed; keeping last table"
                );
                self.last_error = Some(message.clone());
                self.forget_settled_tombstones();
                return FetchOutcome::Failed(message);
            }
        };

        let ingest = ingest_snapshot(&body);
        let dropped = ingest.dropped;
        self.replace_table(ingest.into_entities(), ticket.issued_at_seq);
        self.forget_settled_tombstones();
        self.applied_generation = ticket.generation;
        self.last_error = None;
        self.mutations += 1;
        self.publish();

        FetchOutcome::Applied {
            matches: self.order.len(),
            dropped,
        }
    }

    /// Swap in a snapshot. Push-stamped fields newer than the ticket are
    /// laid over the snapshot entries before the status filter runs.
    fn replace_table(&mut self, snapshot: Vec<MatchEntity>, issued_at_seq: u64) {
        let mut previous = std::mem::take(&mut self.table);
        let previous_order = std::mem::take(&mut self.order);

        let mut seen = HashSet::with_capacity(snapshot.len());
        let mut merged = Vec::with_capacity(snapshot.len());
        let mut stamps = HashMap::new();
        for mut entity in snapshot {
            let id = entity.canonical_id.clone();
            if !seen.insert(id.clone()) {
                continue;
            }
            if self
                .tombstones
                .get(&id)
                .is_some_and(|seq| *seq > issued_at_seq)
            {
                continue;
            }
            if let Some(old) = previous.remove(&id) {
                let newer: BTreeMap<MatchField, u64> = old
                    .stamps
                    .into_iter()
                    .filter(|(_, seq)| *seq > issued_at_seq)
                    .collect();
                for field in newer.keys() {
                    entity.copy_field_from(&old.entity, *field);
                }
                stamps.insert(id, newer);
            }
            merged.push(entity);
        }

        let now = (self.clock)();
        let kept = self.spec.status_filter.apply_to_snapshot(merged, now);

        let mut table = HashMap::with_capacity(kept.len());
        let mut order = VecDeque::with_capacity(kept.len());
        for entity in kept {
            let id = entity.canonical_id.clone();
            let mut tracked = TrackedMatch::from_snapshot(entity);
            if let Some(newer) = stamps.remove(&id) {
                tracked.stamps = newer;
            }
            order.push_back(id.clone());
            table.insert(id, tracked);
        }

        // matches first seen through a push after the fetch was issued
        for id in previous_order.iter().rev() {
            let Some(old) = previous.remove(id) else {
                continue;
            };
            if old.created_seq > issued_at_seq {
                order.push_front(id.clone());
                table.insert(id.clone(), old);
            }
        }

        self.tombstones.retain(|_, seq| *seq > issued_at_seq);
        self.table = table;
        self.order = order;
    }

    fn forget_settled_tombstones(&mut self) {
        if self.pending_fetches == 0 {
            self.tombstones.clear();
        }
    }

    /// Remember a push-side removal while a snapshot is in flight; with no
    /// fetch outstanding there is nothing it could be resurrected by.
    fn record_tombstone(&mut self, id: CanonicalId, seq: u64) {
        if self.pending_fetches == 0 {
            return;
        }
        if self.tombstones.len() >= MAX_TOMBSTONES {
            if let Some(oldest) = self
                .tombstones
                .iter()
                .min_by_key(|(_, seq)| **seq)
                .map(|(id, _)| id.clone())
            {
                self.tombstones.remove(&oldest);
            }
        }
        self.tombstones.insert(id, seq);
    }

    pub fn on_push(&mut self, raw: &JsonValue) -> PushOutcome {
        if !self.is_mounted() {
            return PushOutcome::Unmounted;
        }
        let record = match ingest_record(raw) {
            Ok(record) => record,
            Err(err) => {
                debug!(
                    subscription = %self.label,
                    error = %err,
                    "dropping push update without identity"
                );
                return PushOutcome::Dropped(err);
            }
        };

        let now = (self.clock)();
        self.push_seq += 1;
        let seq = self.push_seq;
        let id = record.id;
        let patch = record.patch;

        let outcome = match self.table.get_mut(&id) {
            Some(tracked) => {
                let mut candidate = tracked.entity.clone();
                let touched = candidate.merge(patch);
                if self.spec.status_filter.keeps(&candidate, now) {
                    tracked.entity = candidate;
                    tracked.stamp(&touched, seq);
                    PushOutcome::Merged(id)
                } else {
                    self.table.remove(&id);
                    self.order.retain(|o| o != &id);
                    self.record_tombstone(id.clone(), seq);
                    PushOutcome::Removed(id)
                }
            }
            None => {
                let fields = patch.fields();
                let entity = MatchEntity::from_patch(id.clone(), patch);
                if self.spec.status_filter.keeps(&entity, now) {
                    let mut tracked = TrackedMatch {
                        entity,
                        created_seq: seq,
                        stamps: BTreeMap::new(),
                    };
                    tracked.stamp(&fields, seq);
                    self.tombstones.remove(&id);
                    self.order.push_front(id.clone());
                    self.table.insert(id.clone(), tracked);
                    PushOutcome::Inserted(id)
                } else {
                    self.record_tombstone(id.clone(), seq);
                    return PushOutcome::Ignored(id);
                }
            }
        };

        self.mutations += 1;
        self.publish();
        outcome
    }

    /// Narrow the exposed projection without touching the table.
    pub fn set_view_filter(&mut self, sport: Option<String>, search: Option<String>) {
        if !self.is_mounted() {
            return;
        }
        self.spec.sport_filter = sport;
        self.spec.search_text = search;
        self.view_filter = self.spec.view_filter();
        self.publish();
    }

    /// Swap the whole filter spec. Returns true when the table has to be
    /// re-fetched (status filter or odds refresh changed).
    pub fn update_spec(&mut self, spec: FilterSpec) -> bool {
        if !self.is_mounted() {
            return false;
        }
        let refetch = spec.status_filter != self.spec.status_filter
            || spec.refresh_odds != self.spec.refresh_odds;
        self.spec = spec;
        self.view_filter = self.spec.view_filter();
        self.publish();
        refetch
    }

    /// Terminal: nothing mutates the table afterwards.
    pub fn stop(&mut self) {
        self.guard.unmount();
        self.state = ReconcilerState::Unmounted;
    }

    fn publish(&self) {
        let now = (self.clock)();
        let views = project(self.entities(), &self.view_filter, now);
        self.views.send_replace(Arc::new(views));
    }
}
