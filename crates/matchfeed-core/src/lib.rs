//! Core domain model for the live match feed.
//!
//! Everything in this crate is pure: match entities and their partial
//! patches, the status classifier, the odds-market normalizer and the
//! projection into UI view-models. Transport and reconciliation live in
//! the sibling crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod markets;
pub mod status;
pub mod view;

pub use markets::{normalize_market, MarketLine, NormalizedMarket};
pub use status::{classify, is_finished, is_live, is_upcoming, StatusClass, StatusFilter};
pub use view::{FilterSpec, MatchView, ViewFilter};

pub const CRATE_NAME: &str = "matchfeed-core";

/// Stable identity of one sporting event, chosen once by the identity resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(String);

impl CanonicalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanonicalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of one subscription reconciler, carried in refresh completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Score {
    pub score_home: Option<i64>,
    pub score_away: Option<i64>,
    pub period: Option<String>,
    /// Raw upstream event status code, e.g. `STATUS_IN_PROGRESS`.
    pub event_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub name: String,
    pub point: Option<f64>,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub key: String,
    pub outcomes: Vec<Outcome>,
}

/// The two odds payload shapes seen upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "value", rename_all = "snake_case")]
pub enum OddsPayload {
    /// Already resolved per side; passed through unchanged.
    Named(NormalizedMarket),
    Markets(Vec<Market>),
}

/// One sporting event as held in a subscription's local table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEntity {
    pub canonical_id: CanonicalId,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub score: Option<Score>,
    pub odds: Option<OddsPayload>,
}

/// Top-level fields a push update can overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchField {
    Sport,
    HomeTeam,
    AwayTeam,
    StartTime,
    Status,
    Score,
    Odds,
}

/// Typed partial record produced once at ingestion. `None` means "not sent".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchPatch {
    pub sport: Option<String>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub score: Option<Score>,
    pub odds: Option<OddsPayload>,
}

impl MatchPatch {
    pub fn fields(&self) -> Vec<MatchField> {
        let mut out = Vec::new();
        if self.sport.is_some() {
            out.push(MatchField::Sport);
        }
        if self.home_team.is_some() {
            out.push(MatchField::HomeTeam);
        }
        if self.away_team.is_some() {
            out.push(MatchField::AwayTeam);
        }
        if self.start_time.is_some() {
            out.push(MatchField::StartTime);
        }
        if self.status.is_some() {
            out.push(MatchField::Status);
        }
        if self.score.is_some() {
            out.push(MatchField::Score);
        }
        if self.odds.is_some() {
            out.push(MatchField::Odds);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }
}

impl MatchEntity {
    pub fn from_patch(canonical_id: CanonicalId, patch: MatchPatch) -> Self {
        Self {
            canonical_id,
            sport: patch.sport.unwrap_or_default(),
            home_team: patch.home_team.unwrap_or_default(),
            away_team: patch.away_team.unwrap_or_default(),
            start_time: patch.start_time,
            status: patch.status,
            score: patch.score,
            odds: patch.odds,
        }
    }

    /// Shallow merge: every field present in the patch replaces the current
    /// value wholesale (nested score/odds objects included). Returns the
    /// fields that were written.
    pub fn merge(&mut self, patch: MatchPatch) -> Vec<MatchField> {
        let touched = patch.fields();
        if let Some(v) = patch.sport {
            self.sport = v;
        }
        if let Some(v) = patch.home_team {
            self.home_team = v;
        }
        if let Some(v) = patch.away_team {
            self.away_team = v;
        }
        if let Some(v) = patch.start_time {
            self.start_time = Some(v);
        }
        if let Some(v) = patch.status {
            self.status = Some(v);
        }
        if let Some(v) = patch.score {
            self.score = Some(v);
        }
        if let Some(v) = patch.odds {
            self.odds = Some(v);
        }
        touched
    }

    /// Copy one field's value from `other` into `self`.
    pub fn copy_field_from(&mut self, other: &MatchEntity, field: MatchField) {
        match field {
            MatchField::Sport => self.sport = other.sport.clone(),
            MatchField::HomeTeam => self.home_team = other.home_team.clone(),
            MatchField::AwayTeam => self.away_team = other.away_team.clone(),
            MatchField::StartTime => self.start_time = other.start_time,
            MatchField::Status => self.status = other.status.clone(),
            MatchField::Score => self.score = other.score.clone(),
            MatchField::Odds => self.odds = other.odds.clone(),
        }
    }

    pub fn event_status(&self) -> Option<&str> {
        self.score.as_ref().and_then(|s| s.event_status.as_deref())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_only_overwrites_sent_fields() {
        let mut m = test_support::entity("m1");
        m.status = Some("scheduled".into());

        let touched = m.merge(MatchPatch {
            status: Some("live".into()),
            score: Some(Score {
                score_home: Some(1),
                score_away: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        });

        assert_eq!(touched, vec![MatchField::Status, MatchField::Score]);
        assert_eq!(m.status.as_deref(), Some("live"));
        assert_eq!(m.home_team, "Lakers");
        assert_eq!(m.score.as_ref().and_then(|s| s.score_home), Some(1));
    }

    #[test]
    fn merge_replaces_nested_score_wholesale() {
        let mut m = test_support::entity("m1");
        m.score = Some(Score {
            score_home: Some(3),
            score_away: Some(2),
            period: Some("2".into()),
            event_status: Some("STATUS_IN_PROGRESS".into()),
        });
        m.merge(MatchPatch {
            score: Some(Score {
                score_home: Some(4),
                ..Default::default()
            }),
            ..Default::default()
        });
        let score = m.score.unwrap();
        assert_eq!(score.score_home, Some(4));
        assert_eq!(score.event_status, None);
    }

    #[test]
    fn odds_payload_serializes_with_shape_tag() {
        let payload = OddsPayload::Markets(vec![Market {
            key: "h2h".into(),
            outcomes: vec![],
        }]);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["shape"], "markets");
    }
}
