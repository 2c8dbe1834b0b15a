use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use matchfeed_core::view::project_snapshot;
use matchfeed_core::{FilterSpec, MatchView};
use matchfeed_ingest::ingest_snapshot;
use matchfeed_transport::{
    HttpSnapshotClient, PushHub, PushListener, SnapshotScope, SnapshotSource,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::bus::RefreshBus;
use crate::config::FeedConfig;
use crate::presets::SubscriptionPreset;
use crate::reconciler::{system_clock, Clock, ViewSnapshot};
use crate::subscription::{spawn_subscription, SubscriptionDeps, SubscriptionHandle};

/// Every configured subscription plus the shared push listener and
/// refresh scheduler.
pub struct FeedRuntime {
    hub: PushHub,
    bus: RefreshBus,
    subscriptions: BTreeMap<String, SubscriptionHandle>,
    listener: Option<JoinHandle<()>>,
    scheduler: Option<JobScheduler>,
}

impl FeedRuntime {
    /// Connect to the configured feed over HTTP and mount every preset.
    pub async fn start(config: &FeedConfig, presets: &[SubscriptionPreset]) -> Result<Self> {
        let source = HttpSnapshotClient::new(config.snapshot_client_config())
            .context("building snapshot client")?;
        let listener = PushListener::new(config.push_config()).context("building push listener")?;
        Self::start_with(config, presets, Arc::new(source), Some(listener), system_clock()).await
    }

    pub async fn start_with(
        config: &FeedConfig,
        presets: &[SubscriptionPreset],
        source: Arc<dyn SnapshotSource>,
        listener: Option<PushListener>,
        clock: Clock,
    ) -> Result<Self> {
        let hub = PushHub::default();
        let bus = RefreshBus::default();
        let deps = SubscriptionDeps {
            source,
            push: hub.clone(),
            bus: bus.clone(),
            clock,
        };

        let subscriptions = presets
            .iter()
            .map(|preset| {
                let handle = spawn_subscription(&preset.name, preset.filter_spec(), deps.clone());
                (preset.name.clone(), handle)
            })
            .collect::<BTreeMap<_, _>>();
        info!(count = subscriptions.len(), "subscriptions mounted");

        let listener = listener.map(|l| l.spawn(hub.clone()));

        let scheduler = maybe_build_refresh_scheduler(config, bus.clone()).await?;
        if let Some(sched) = &scheduler {
            sched.start().await.context("starting refresh scheduler")?;
            info!(cron = %config.refresh_cron, "refresh scheduler started");
        }

        Ok(Self {
            hub,
            bus,
            subscriptions,
            listener,
            scheduler,
        })
    }

    pub fn bus(&self) -> &RefreshBus {
        &self.bus
    }

    pub fn hub(&self) -> &PushHub {
        &self.hub
    }

    pub fn subscription(&self, name: &str) -> Option<&SubscriptionHandle> {
        self.subscriptions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.subscriptions.keys().map(String::as_str)
    }

    pub fn views(&self) -> BTreeMap<String, watch::Receiver<ViewSnapshot>> {
        self.subscriptions
            .iter()
            .map(|(name, handle)| (name.clone(), handle.views()))
            .collect()
    }

    /// Refresh every mounted subscription. Returns how many were reached.
    pub fn refresh_all(&self) -> usize {
        self.bus.request_refresh()
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(mut sched) = self.scheduler.take() {
            sched.shutdown().await.context("stopping refresh scheduler")?;
        }
        self.hub.shutdown();
        for (_, handle) in std::mem::take(&mut self.subscriptions) {
            handle.shutdown().await;
        }
        if let Some(listener) = self.listener.take() {
            if let Err(err) = listener.await {
                warn!(error = %err, "push listener ended abnormally");
            }
        }
        info!("feed runtime stopped");
        Ok(())
    }
}

/// Scheduler that broadcasts a refresh request on the configured cron
/// expression, or `None` when scheduling is disabled.
pub async fn maybe_build_refresh_scheduler(
    config: &FeedConfig,
    bus: RefreshBus,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.refresh_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let bus = bus.clone();
        Box::pin(async move {
            let reached = bus.request_refresh();
            info!(reached, "scheduled refresh requested");
        })
    })
    .with_context(|| format!("creating refresh job for cron {cron}"))?;
    sched.add(job).await.context("adding refresh job")?;
    Ok(Some(sched))
}

/// One fetch, no push listener: the body a subscription with `spec` would
/// show right after mounting.
pub async fn snapshot_once(
    source: &dyn SnapshotSource,
    spec: &FilterSpec,
    now: DateTime<Utc>,
) -> Result<Vec<MatchView>> {
    if spec.refresh_odds {
        if let Err(err) = source.refresh_odds().await {
            warn!(error = %err, "odds refresh failed; fetching snapshot anyway");
        }
    }
    let scope = if spec.status_filter.uses_live_endpoint() {
        SnapshotScope::LiveOnly
    } else {
        SnapshotScope::All
    };
    let body = source
        .fetch_snapshot(scope)
        .await
        .context("fetching snapshot")?;
    let ingest = ingest_snapshot(&body);
    Ok(project_snapshot(ingest.into_entities(), spec, now))
}
