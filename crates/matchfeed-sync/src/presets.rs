//! Named subscription presets from `subscriptions.yaml`.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use matchfeed_core::{FilterSpec, StatusFilter};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const PRESETS_FILE: &str = "subscriptions.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPreset {
    pub name: String,
    pub status_filter: StatusFilter,
    #[serde(default)]
    pub sport: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub refresh_odds: bool,
}

impl SubscriptionPreset {
    pub fn new(name: &str, status_filter: StatusFilter) -> Self {
        Self {
            name: name.to_string(),
            status_filter,
            sport: None,
            search: None,
            refresh_odds: false,
        }
    }

    pub fn filter_spec(&self) -> FilterSpec {
        FilterSpec {
            status_filter: self.status_filter,
            sport_filter: self.sport.clone(),
            search_text: self.search.clone(),
            refresh_odds: self.refresh_odds,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PresetsFile {
    subscriptions: Vec<SubscriptionPreset>,
}

pub fn default_presets() -> Vec<SubscriptionPreset> {
    vec![
        SubscriptionPreset::new("live", StatusFilter::Live),
        SubscriptionPreset::new("upcoming", StatusFilter::Upcoming),
        SubscriptionPreset::new("live-upcoming", StatusFilter::LiveUpcoming),
    ]
}

/// Load `<root>/subscriptions.yaml`, or the built-in presets when the file
/// does not exist.
pub fn load_presets(root: &Path) -> Result<Vec<SubscriptionPreset>> {
    let path = root.join(PRESETS_FILE);
    if !path.exists() {
        info!(path = %path.display(), "no presets file; using built-in subscriptions");
        return Ok(default_presets());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: PresetsFile =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    let mut seen = HashSet::new();
    for preset in &file.subscriptions {
        if preset.name.trim().is_empty() {
            bail!("{}: subscription with empty name", path.display());
        }
        if !seen.insert(preset.name.as_str()) {
            bail!("{}: duplicate subscription {:?}", path.display(), preset.name);
        }
    }
    Ok(file.subscriptions)
}
