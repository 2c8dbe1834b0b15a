//! Async driver for one live subscription.
//!
//! Each subscription runs as a single tokio task that owns its
//! [`Reconciler`]. The task multiplexes push records, refresh requests,
//! resolved snapshot fetches and handle commands, so the table is only
//! ever touched from one place.

use std::sync::Arc;

use matchfeed_core::{FilterSpec, SubscriptionId};
use matchfeed_transport::{PushHub, SnapshotSource, TransportError};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bus::{RefreshBus, RefreshOutcome};
use crate::reconciler::{
    Clock, FetchOutcome, FetchTicket, MountGuard, PushOutcome, Reconciler, ViewSnapshot,
};

/// Collaborators a subscription needs. All of them are cheap to clone.
#[derive(Clone)]
pub struct SubscriptionDeps {
    pub source: Arc<dyn SnapshotSource>,
    pub push: PushHub,
    pub bus: RefreshBus,
    pub clock: Clock,
}

#[derive(Debug)]
enum Command {
    Stop,
    Refresh,
    SetViewFilter {
        sport: Option<String>,
        search: Option<String>,
    },
    UpdateSpec(FilterSpec),
}

type FetchResult = (FetchTicket, Result<JsonValue, TransportError>);

/// Owner side of a running subscription. Dropping it stops the subscription.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    label: String,
    guard: MountGuard,
    commands: mpsc::UnboundedSender<Command>,
    views: watch::Receiver<ViewSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn views(&self) -> watch::Receiver<ViewSnapshot> {
        self.views.clone()
    }

    pub fn current(&self) -> ViewSnapshot {
        self.views.borrow().clone()
    }

    /// Re-run the snapshot fetch for this subscription only.
    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    pub fn set_view_filter(&self, sport: Option<String>, search: Option<String>) {
        let _ = self.commands.send(Command::SetViewFilter { sport, search });
    }

    pub fn update_spec(&self, spec: FilterSpec) {
        let _ = self.commands.send(Command::UpdateSpec(spec));
    }

    /// Unmount. Takes effect immediately: any push or fetch result that
    /// has not been applied yet is discarded.
    pub fn stop(&self) {
        self.guard.unmount();
        let _ = self.commands.send(Command::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        !self.guard.is_mounted()
    }

    /// Stop and wait for the driver task to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(
                    subscription = %self.label,
                    error = %err,
                    "subscription task ended abnormally"
                );
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Mount a subscription: issue its first snapshot fetch and start
/// listening for pushes and refresh requests. Must be called inside a
/// tokio runtime.
pub fn spawn_subscription(
    label: impl Into<String>,
    spec: FilterSpec,
    deps: SubscriptionDeps,
) -> SubscriptionHandle {
    let guard = MountGuard::new();
    let reconciler = Reconciler::new(label, spec, guard.clone(), deps.clock.clone());
    let id = reconciler.id();
    let label = reconciler.label().to_string();
    let views = reconciler.subscribe_views();
    let (commands, command_rx) = mpsc::unbounded_channel();

    // receivers are taken before spawning so nothing published after this
    // call returns can be missed
    let push_rx = deps.push.subscribe();
    let refresh_rx = deps.bus.subscribe_requests();

    let span = info_span!("subscription", %label, %id);
    let task = tokio::spawn(
        drive(reconciler, deps, command_rx, push_rx, refresh_rx).instrument(span),
    );

    SubscriptionHandle {
        id,
        label,
        guard,
        commands,
        views,
        task: Some(task),
    }
}

async fn recv_or_pending<T: Clone>(
    rx: &mut Option<broadcast::Receiver<T>>,
) -> Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn drive(
    mut reconciler: Reconciler,
    deps: SubscriptionDeps,
    mut commands: mpsc::UnboundedReceiver<Command>,
    push_rx: broadcast::Receiver<JsonValue>,
    refresh_rx: broadcast::Receiver<()>,
) {
    let mut push_rx = Some(push_rx);
    let mut refresh_rx = Some(refresh_rx);
    let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel::<FetchResult>();

    info!(filter = %reconciler.spec().status_filter, "subscription mounted");
    start_fetch(&mut reconciler, &deps, &fetch_tx);

    while reconciler.is_mounted() {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(Command::Stop) => reconciler.stop(),
                Some(Command::Refresh) => start_fetch(&mut reconciler, &deps, &fetch_tx),
                Some(Command::SetViewFilter { sport, search }) => {
                    reconciler.set_view_filter(sport, search);
                }
                Some(Command::UpdateSpec(spec)) => {
                    if reconciler.update_spec(spec) {
                        start_fetch(&mut reconciler, &deps, &fetch_tx);
                    }
                }
            },
            Some((ticket, result)) = fetch_rx.recv() => {
                let outcome = reconciler.complete_fetch(ticket, result);
                report_fetch(&reconciler, &deps.bus, outcome);
            }
            update = recv_or_pending(&mut push_rx) => match update {
                Ok(record) => match reconciler.on_push(&record) {
                    PushOutcome::Dropped(err) => debug!(error = %err, "push dropped"),
                    outcome => debug!(?outcome, "push applied"),
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "push receiver lagged; re-fetching snapshot");
                    start_fetch(&mut reconciler, &deps, &fetch_tx);
                }
                Err(RecvError::Closed) => {
                    warn!("push hub closed; continuing on snapshots only");
                    push_rx = None;
                }
            },
            request = recv_or_pending(&mut refresh_rx) => match request {
                Ok(()) => start_fetch(&mut reconciler, &deps, &fetch_tx),
                Err(RecvError::Lagged(_)) => start_fetch(&mut reconciler, &deps, &fetch_tx),
                Err(RecvError::Closed) => refresh_rx = None,
            },
        }
    }

    info!(mutations = reconciler.mutation_count(), "subscription unmounted");
}

fn start_fetch(
    reconciler: &mut Reconciler,
    deps: &SubscriptionDeps,
    results: &mpsc::UnboundedSender<FetchResult>,
) {
    let Some(ticket) = reconciler.begin_fetch() else {
        return;
    };
    let source = deps.source.clone();
    let refresh_odds = reconciler.spec().refresh_odds;
    let results = results.clone();
    let span = info_span!(
        "snapshot_fetch",
        generation = ticket.generation(),
        scope = ?ticket.scope()
    );

    tokio::spawn(
        async move {
            if refresh_odds {
                if let Err(err) = source.refresh_odds().await {
                    warn!(error = %err, "odds refresh failed; fetching snapshot anyway");
                }
            }
            let result = source.fetch_snapshot(ticket.scope()).await;
            // the driver may already be gone
            let _ = results.send((ticket, result));
        }
        .instrument(span),
    );
}

fn report_fetch(reconciler: &Reconciler, bus: &RefreshBus, outcome: FetchOutcome) {
    let (success, error) = match outcome {
        FetchOutcome::Applied { matches, dropped } => {
            info!(matches, dropped, "snapshot applied");
            (true, None)
        }
        FetchOutcome::Failed(message) => (false, Some(message)),
        FetchOutcome::Stale | FetchOutcome::Unmounted => return,
    };
    bus.report_completion(RefreshOutcome {
        subscription: reconciler.id(),
        label: reconciler.label().to_string(),
        success,
        error,
        matches: reconciler.len(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::system_clock;
    use async_trait::async_trait;
    use matchfeed_core::{MatchView, StatusClass, StatusFilter};
    use matchfeed_transport::SnapshotScope;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct FakeSource {
        body: Mutex<JsonValue>,
        fail_fetch: Mutex<bool>,
        fail_odds: bool,
        fetches: AtomicUsize,
        odds_refreshes: AtomicUsize,
        scopes: Mutex<Vec<SnapshotScope>>,
    }

    impl FakeSource {
        fn with_body(body: JsonValue) -> Arc<Self> {
            Arc::new(Self {
                body: Mutex::new(body),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl SnapshotSource for FakeSource {
        async fn fetch_snapshot(&self, scope: SnapshotScope) -> Result<JsonValue, TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.scopes.lock().unwrap().push(scope);
            if *self.fail_fetch.lock().unwrap() {
                return Err(TransportError::HttpStatus {
                    status: 502,
                    url: "http://feed.test/matches".into(),
                });
            }
            Ok(self.body.lock().unwrap().clone())
        }

        async fn refresh_odds(&self) -> Result<(), TransportError> {
            self.odds_refreshes.fetch_add(1, Ordering::SeqCst);
            if self.fail_odds {
                return Err(TransportError::Channel("odds service down".into()));
            }
            Ok(())
        }
    }

    fn deps(source: Arc<FakeSource>) -> SubscriptionDeps {
        SubscriptionDeps {
            source,
            push: PushHub::new(64),
            bus: RefreshBus::default(),
            clock: system_clock(),
        }
    }

    async fn next_completion(rx: &mut broadcast::Receiver<RefreshOutcome>) -> RefreshOutcome {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("completion in time")
            .expect("bus open")
    }

    async fn wait_for_views(
        rx: &mut watch::Receiver<ViewSnapshot>,
        pred: impl Fn(&[MatchView]) -> bool,
    ) -> ViewSnapshot {
        timeout(Duration::from_secs(2), rx.wait_for(|views| pred(views)))
            .await
            .expect("views in time")
            .expect("subscription alive")
            .clone()
    }

    #[tokio::test]
    async fn initial_fetch_populates_views_and_reports_completion() {
        let source = FakeSource::with_body(json!([
            {"id": "a", "status": "live", "homeTeam": "Lakers", "awayTeam": "Celtics"},
            {"id": "b", "status": "final"}
        ]));
        let deps = deps(source.clone());
        let mut completions = deps.bus.subscribe_completions();

        let handle = spawn_subscription("live", FilterSpec::new(StatusFilter::Live), deps);
        let outcome = next_completion(&mut completions).await;

        assert!(outcome.success);
        assert_eq!(outcome.subscription, handle.id());
        assert_eq!(outcome.matches, 1);
        let views = handle.current();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status_class, StatusClass::Live);
        assert_eq!(*source.scopes.lock().unwrap(), vec![SnapshotScope::LiveOnly]);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn pushes_flow_into_the_view() {
        let source = FakeSource::with_body(json!([{"id": "m1", "status": "scheduled"}]));
        let deps = deps(source);
        let hub = deps.push.clone();
        let mut completions = deps.bus.subscribe_completions();
        let handle = spawn_subscription("all", FilterSpec::default(), deps);
        next_completion(&mut completions).await;

        hub.publish(json!({
            "_id": "m1",
            "status": "live",
            "score": {"scoreHome": 4, "scoreAway": 2}
        }));
        hub.publish(json!({"id": "m2", "status": "live"}));

        let mut views = handle.views();
        let latest = wait_for_views(&mut views, |v| v.len() == 2).await;
        assert_eq!(latest[0].id.as_str(), "m2");
        assert_eq!(latest[1].score_home, Some(4));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn refresh_requests_rerun_every_mounted_subscription() {
        let source = FakeSource::with_body(json!([{"id": "a"}]));
        let deps = deps(source.clone());
        let bus = deps.bus.clone();
        let mut completions = bus.subscribe_completions();

        let first = spawn_subscription("one", FilterSpec::default(), deps.clone());
        let second = spawn_subscription("two", FilterSpec::default(), deps);
        next_completion(&mut completions).await;
        next_completion(&mut completions).await;

        *source.body.lock().unwrap() = json!([{"id": "a"}, {"id": "b"}]);
        assert_eq!(bus.request_refresh(), 2);

        let mut labels = vec![
            next_completion(&mut completions).await.label,
            next_completion(&mut completions).await.label,
        ];
        labels.sort();
        assert_eq!(labels, vec!["one", "two"]);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 4);
        assert_eq!(first.current().len(), 2);
        assert_eq!(second.current().len(), 2);
        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn odds_refresh_failure_does_not_block_the_fetch() {
        let source = Arc::new(FakeSource {
            body: Mutex::new(json!([{"id": "a"}])),
            fail_odds: true,
            ..FakeSource::default()
        });
        let deps = deps(source.clone());
        let mut completions = deps.bus.subscribe_completions();
        let spec = FilterSpec {
            refresh_odds: true,
            ..FilterSpec::default()
        };

        let handle = spawn_subscription("odds", spec, deps);
        assert!(next_completion(&mut completions).await.success);
        assert_eq!(source.odds_refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_fetch_reports_error_and_keeps_table() {
        let source = FakeSource::with_body(json!([{"id": "a"}]));
        let deps = deps(source.clone());
        let mut completions = deps.bus.subscribe_completions();
        let handle = spawn_subscription("all", FilterSpec::default(), deps);
        next_completion(&mut completions).await;

        *source.fail_fetch.lock().unwrap() = true;
        handle.refresh();
        let outcome = next_completion(&mut completions).await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("502"));
        assert_eq!(outcome.matches, 1);
        assert_eq!(handle.current().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn view_filter_narrows_without_refetch() {
        let source = FakeSource::with_body(json!([
            {"id": "a", "sport": "basketball_nba", "homeTeam": "Lakers"},
            {"id": "b", "sport": "soccer_epl", "homeTeam": "Arsenal"}
        ]));
        let deps = deps(source.clone());
        let mut completions = deps.bus.subscribe_completions();
        let handle = spawn_subscription("all", FilterSpec::default(), deps);
        next_completion(&mut completions).await;

        handle.set_view_filter(Some("EPL".into()), None);
        let mut views = handle.views();
        let latest = wait_for_views(&mut views, |v| v.len() == 1).await;
        assert_eq!(latest[0].id.as_str(), "b");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stopped_subscription_ignores_later_pushes() {
        let source = FakeSource::with_body(json!([{"id": "m1", "status": "scheduled"}]));
        let deps = deps(source);
        let hub = deps.push.clone();
        let mut completions = deps.bus.subscribe_completions();
        let handle = spawn_subscription("all", FilterSpec::default(), deps);
        next_completion(&mut completions).await;
        let before = handle.current();

        handle.stop();
        assert!(handle.is_stopped());
        hub.publish(json!({"id": "m1", "status": "live"}));
        hub.publish(json!({"id": "m9", "status": "live"}));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handle.current(), before);
        timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("driver exits after stop");
    }
}
