//! Projection of match entities into UI view-models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::markets::{normalize_market, NormalizedMarket};
use crate::status::{classify, StatusClass, StatusFilter};
use crate::{CanonicalId, MatchEntity};

/// What a UI surface asks of its subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub status_filter: StatusFilter,
    #[serde(default)]
    pub sport_filter: Option<String>,
    #[serde(default)]
    pub search_text: Option<String>,
    /// Trigger the upstream odds refresh before each snapshot fetch.
    #[serde(default)]
    pub refresh_odds: bool,
}

impl FilterSpec {
    pub fn new(status_filter: StatusFilter) -> Self {
        Self {
            status_filter,
            ..Default::default()
        }
    }

    pub fn view_filter(&self) -> ViewFilter {
        ViewFilter::new(self.sport_filter.clone(), self.search_text.clone())
    }
}

/// Sport and free-text narrowing applied on top of the status-filtered table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViewFilter {
    sport: Option<String>,
    search: Option<String>,
}

fn lowered_non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

impl ViewFilter {
    pub fn new(sport: Option<String>, search: Option<String>) -> Self {
        Self {
            sport: lowered_non_empty(sport),
            search: lowered_non_empty(search),
        }
    }

    pub fn matches(&self, m: &MatchEntity) -> bool {
        self.matches_parts(&m.sport, &m.home_team, &m.away_team)
    }

    /// Same rule over an already projected view.
    pub fn matches_view(&self, v: &MatchView) -> bool {
        self.matches_parts(&v.sport, &v.home_team, &v.away_team)
    }

    fn matches_parts(&self, sport: &str, home: &str, away: &str) -> bool {
        let sport = sport.to_lowercase();
        if let Some(wanted) = &self.sport {
            if !sport.contains(wanted.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.search {
            let hit = home.to_lowercase().contains(needle.as_str())
                || away.to_lowercase().contains(needle.as_str())
                || sport.contains(needle.as_str());
            if !hit {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchView {
    pub id: CanonicalId,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: Option<DateTime<Utc>>,
    pub status_class: StatusClass,
    pub status_label: String,
    pub score_home: Option<i64>,
    pub score_away: Option<i64>,
    pub period: Option<String>,
    pub market: NormalizedMarket,
}

impl MatchView {
    pub fn from_entity(m: &MatchEntity, now: DateTime<Utc>) -> Self {
        let status_class = classify(m, now);
        let status_label = match status_class {
            StatusClass::Unknown => m
                .status
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(StatusClass::Unknown.label())
                .to_string(),
            other => other.label().to_string(),
        };
        let score = m.score.as_ref();
        Self {
            id: m.canonical_id.clone(),
            sport: m.sport.clone(),
            home_team: m.home_team.clone(),
            away_team: m.away_team.clone(),
            start_time: m.start_time,
            status_class,
            status_label,
            score_home: score.and_then(|s| s.score_home),
            score_away: score.and_then(|s| s.score_away),
            period: score.and_then(|s| s.period.clone()),
            market: normalize_market(m.odds.as_ref(), &m.home_team, &m.away_team),
        }
    }
}

/// Build the ordered view sequence for already status-filtered entities.
pub fn project<'a>(
    entities: impl IntoIterator<Item = &'a MatchEntity>,
    filter: &ViewFilter,
    now: DateTime<Utc>,
) -> Vec<MatchView> {
    entities
        .into_iter()
        .filter(|m| filter.matches(m))
        .map(|m| MatchView::from_entity(m, now))
        .collect()
}

/// Status filter and view filter in one pass, for callers holding a raw list.
pub fn project_snapshot(
    snapshot: Vec<MatchEntity>,
    spec: &FilterSpec,
    now: DateTime<Utc>,
) -> Vec<MatchView> {
    let kept = spec.status_filter.apply_to_snapshot(snapshot, now);
    project(kept.iter(), &spec.view_filter(), now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::entity;
    use crate::{Market, OddsPayload, Outcome, Score};

    #[test]
    fn sport_and_search_filters_are_case_insensitive() {
        let m = entity("a");
        assert!(ViewFilter::new(Some("NBA".into()), None).matches(&m));
        assert!(ViewFilter::new(None, Some("celt".into())).matches(&m));
        assert!(!ViewFilter::new(None, Some("knicks".into())).matches(&m));
        assert!(!ViewFilter::new(Some("soccer".into()), Some("lakers".into())).matches(&m));
        assert!(ViewFilter::new(Some("  ".into()), Some(String::new())).matches(&m));
    }

    #[test]
    fn projected_views_use_the_same_filter_rule() {
        let now = Utc::now();
        let v = MatchView::from_entity(&entity("a"), now);
        assert!(ViewFilter::new(Some("nba".into()), Some("LAK".into())).matches_view(&v));
        assert!(!ViewFilter::new(Some("nhl".into()), None).matches_view(&v));
    }

    #[test]
    fn view_carries_scores_labels_and_market() {
        let mut m = entity("a");
        m.status = Some("live".into());
        m.score = Some(Score {
            score_home: Some(10),
            score_away: Some(7),
            period: Some("Q2".into()),
            event_status: None,
        });
        m.odds = Some(OddsPayload::Markets(vec![Market {
            key: "h2h".into(),
            outcomes: vec![Outcome {
                name: "Lakers".into(),
                point: None,
                price: Some(-150.0),
            }],
        }]));
        let view = MatchView::from_entity(&m, Utc::now());
        assert_eq!(view.status_class, StatusClass::Live);
        assert_eq!(view.status_label, "Live");
        assert_eq!(view.score_home, Some(10));
        assert_eq!(view.period.as_deref(), Some("Q2"));
        assert_eq!(view.market.moneyline_home.price(), Some(-150.0));
        assert!(!view.market.moneyline_away.is_available());
    }

    #[test]
    fn unknown_status_keeps_raw_label() {
        let mut m = entity("a");
        m.status = Some("Postponed".into());
        let view = MatchView::from_entity(&m, Utc::now());
        assert_eq!(view.status_class, StatusClass::Unknown);
        assert_eq!(view.status_label, "Postponed");
    }

    #[test]
    fn project_snapshot_applies_status_then_view_filter() {
        let mut a = entity("a");
        a.status = Some("live".into());
        let mut b = entity("b");
        b.status = Some("live".into());
        b.home_team = "Knicks".into();
        let mut c = entity("c");
        c.status = Some("final".into());

        let spec = FilterSpec {
            status_filter: StatusFilter::Live,
            search_text: Some("knicks".into()),
            ..Default::default()
        };
        let views = project_snapshot(vec![a, b, c], &spec, Utc::now());
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].id.as_str(), "b");
    }
}
