//! Live synchronization: per-subscription reconciliation of snapshots and
//! push updates, the refresh bus, and the runtime that wires them to the
//! transport layer.

pub mod bus;
pub mod config;
pub mod presets;
pub mod reconciler;
pub mod runtime;
pub mod subscription;

pub use bus::{RefreshBus, RefreshOutcome};
pub use config::FeedConfig;
pub use presets::{default_presets, load_presets, SubscriptionPreset};
pub use reconciler::{
    system_clock, Clock, FetchOutcome, MountGuard, PushOutcome, Reconciler, ReconcilerState,
    ViewSnapshot,
};
pub use runtime::{maybe_build_refresh_scheduler, snapshot_once, FeedRuntime};
pub use subscription::{spawn_subscription, SubscriptionDeps, SubscriptionHandle};

pub const CRATE_NAME: &str = "matchfeed-sync";
