//! Lifecycle classification of match records.
//!
//! The three predicates are total over partial input. `classify` applies
//! them with finished taking precedence, so a stale live flag never
//! survives a terminal state.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MatchEntity;

const FINISHED_STATUSES: &[&str] = &["finished", "final", "cancelled", "canceled", "closed"];
const UPCOMING_STATUSES: &[&str] = &["scheduled", "pre-game", "pregame", "upcoming", "pending"];

const FINISHED_EVENT_CODES: &[&str] = &["FINAL", "COMPLETE", "STATUS_CLOSED"];
const LIVE_EVENT_CODES: &[&str] = &["IN_PROGRESS", "LIVE", "STATUS_IN_PROGRESS"];
const UPCOMING_EVENT_CODES: &[&str] = &["SCHEDULED", "PRE_GAME"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Live,
    Upcoming,
    Finished,
    Unknown,
}

impl StatusClass {
    pub fn label(&self) -> &'static str {
        match self {
            StatusClass::Live => "Live",
            StatusClass::Upcoming => "Upcoming",
            StatusClass::Finished => "Final",
            StatusClass::Unknown => "Unknown",
        }
    }
}

fn normalized_status(m: &MatchEntity) -> Option<String> {
    m.status
        .as_deref()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
}

fn event_status_contains_any(m: &MatchEntity, codes: &[&str]) -> bool {
    let Some(raw) = m.event_status() else {
        return false;
    };
    let upper = raw.to_ascii_uppercase();
    codes.iter().any(|code| upper.contains(code))
}

/// True when no status string was ever received for the record.
pub fn status_absent(m: &MatchEntity) -> bool {
    normalized_status(m).is_none()
}

pub fn is_finished(m: &MatchEntity) -> bool {
    let by_status = normalized_status(m)
        .map(|s| FINISHED_STATUSES.contains(&s.as_str()))
        .unwrap_or(false);
    by_status || event_status_contains_any(m, FINISHED_EVENT_CODES)
}

pub fn is_live(m: &MatchEntity) -> bool {
    let by_status = normalized_status(m).as_deref() == Some("live");
    by_status || event_status_contains_any(m, LIVE_EVENT_CODES)
}

pub fn is_upcoming(m: &MatchEntity, now: DateTime<Utc>) -> bool {
    let by_status = normalized_status(m)
        .map(|s| UPCOMING_STATUSES.contains(&s.as_str()))
        .unwrap_or(false);
    by_status
        || event_status_contains_any(m, UPCOMING_EVENT_CODES)
        || m.start_time.map(|t| t > now).unwrap_or(false)
}

pub fn classify(m: &MatchEntity, now: DateTime<Utc>) -> StatusClass {
    if is_finished(m) {
        StatusClass::Finished
    } else if is_live(m) {
        StatusClass::Live
    } else if is_upcoming(m, now) {
        StatusClass::Upcoming
    } else {
        StatusClass::Unknown
    }
}

/// Status selection of a subscription. Deserializes through [`FromStr`],
/// so the aliases and the `All` fallback apply to config files too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", from = "String")]
pub enum StatusFilter {
    Live,
    Upcoming,
    LiveUpcoming,
    #[default]
    All,
}

impl FromStr for StatusFilter {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "live" | "active" => StatusFilter::Live,
            "upcoming" | "scheduled" => StatusFilter::Upcoming,
            "live-upcoming" | "active-upcoming" => StatusFilter::LiveUpcoming,
            _ => StatusFilter::All,
        })
    }
}

impl From<String> for StatusFilter {
    fn from(raw: String) -> Self {
        match raw.parse() {
            Ok(filter) => filter,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatusFilter::Live => "live",
            StatusFilter::Upcoming => "upcoming",
            StatusFilter::LiveUpcoming => "live-upcoming",
            StatusFilter::All => "all",
        })
    }
}

impl StatusFilter {
    /// Whether a snapshot for this filter should come from the live-only endpoint.
    pub fn uses_live_endpoint(&self) -> bool {
        matches!(self, StatusFilter::Live)
    }

    /// Per-record keep rule. Used directly for push updates.
    pub fn keeps(&self, m: &MatchEntity, now: DateTime<Utc>) -> bool {
        match self {
            StatusFilter::Live => is_live(m),
            StatusFilter::Upcoming => !is_finished(m) && is_upcoming(m, now),
            StatusFilter::LiveUpcoming => {
                // no status signal yet counts as relevant
                !is_finished(m) && (is_live(m) || is_upcoming(m, now) || status_absent(m))
            }
            StatusFilter::All => true,
        }
    }

    /// Filter a whole snapshot. A live filter that would empty a non-empty
    /// snapshot exposes the unfiltered snapshot instead.
    pub fn apply_to_snapshot(
        &self,
        snapshot: Vec<MatchEntity>,
        now: DateTime<Utc>,
    ) -> Vec<MatchEntity> {
        if *self == StatusFilter::All {
            return snapshot;
        }
        let any_kept = snapshot.iter().any(|m| self.keeps(m, now));
        if *self == StatusFilter::Live && !any_kept {
            return snapshot;
        }
        snapshot.into_iter().filter(|m| self.keeps(m, now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::entity;
    use crate::Score;
    use chrono::Duration;

    fn with_status(id: &str, status: Option<&str>) -> MatchEntity {
        let mut m = entity(id);
        m.status = status.map(ToString::to_string);
        m
    }

    fn with_event_status(id: &str, status: Option<&str>, code: &str) -> MatchEntity {
        let mut m = with_status(id, status);
        m.score = Some(Score {
            event_status: Some(code.to_string()),
            ..Default::default()
        });
        m
    }

    #[test]
    fn live_status_string_is_live() {
        let now = Utc::now();
        assert_eq!(classify(&with_status("a", Some("live")), now), StatusClass::Live);
        assert_eq!(classify(&with_status("a", Some("LIVE ")), now), StatusClass::Live);
    }

    #[test]
    fn event_status_code_alone_is_live() {
        let m = with_event_status("a", None, "STATUS_IN_PROGRESS");
        assert_eq!(classify(&m, Utc::now()), StatusClass::Live);
        let m = with_event_status("a", None, "status_in_progress");
        assert!(is_live(&m));
    }

    #[test]
    fn future_start_without_status_is_upcoming_not_live() {
        let now = Utc::now();
        let mut m = with_status("a", None);
        m.start_time = Some(now + Duration::hours(1));
        assert!(!is_live(&m));
        assert_eq!(classify(&m, now), StatusClass::Upcoming);
    }

    #[test]
    fn start_time_equal_to_now_is_not_upcoming() {
        let now = Utc::now();
        let mut m = with_status("a", None);
        m.start_time = Some(now);
        assert!(!is_upcoming(&m, now));
        assert_eq!(classify(&m, now), StatusClass::Unknown);
    }

    #[test]
    fn finished_dominates_live_signal() {
        let now = Utc::now();
        let m = with_event_status("a", Some("final"), "STATUS_IN_PROGRESS");
        assert!(is_live(&m));
        assert_eq!(classify(&m, now), StatusClass::Finished);
        assert!(!StatusFilter::LiveUpcoming.keeps(&m, now));
    }

    #[test]
    fn finished_codes_cover_all_terminal_variants() {
        for status in ["finished", "final", "cancelled", "canceled", "closed"] {
            assert!(is_finished(&with_status("a", Some(status))), "{status}");
        }
        for code in ["STATUS_FINAL", "complete", "STATUS_CLOSED"] {
            assert!(is_finished(&with_event_status("a", None, code)), "{code}");
        }
    }

    #[test]
    fn upcoming_filter_excludes_finished_records_with_future_start() {
        let now = Utc::now();
        let mut m = with_status("a", Some("cancelled"));
        m.start_time = Some(now + Duration::hours(2));
        assert!(is_upcoming(&m, now));
        assert!(!StatusFilter::Upcoming.keeps(&m, now));
    }

    #[test]
    fn live_upcoming_keeps_records_without_any_status_signal() {
        let now = Utc::now();
        let m = with_status("a", None);
        assert_eq!(classify(&m, now), StatusClass::Unknown);
        assert!(StatusFilter::LiveUpcoming.keeps(&m, now));
        assert!(!StatusFilter::LiveUpcoming.keeps(&with_status("b", Some("postponed")), now));
    }

    #[test]
    fn live_filter_falls_back_to_unfiltered_snapshot() {
        let now = Utc::now();
        let snapshot = vec![
            with_status("a", Some("scheduled")),
            with_status("b", Some("final")),
            with_status("c", None),
        ];
        let view = StatusFilter::Live.apply_to_snapshot(snapshot.clone(), now);
        assert_eq!(view, snapshot);

        let mut mixed = snapshot;
        mixed.push(with_status("d", Some("live")));
        let view = StatusFilter::Live.apply_to_snapshot(mixed, now);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].canonical_id.as_str(), "d");
    }

    #[test]
    fn upcoming_filter_has_no_fallback() {
        let now = Utc::now();
        let snapshot = vec![with_status("a", Some("final"))];
        let view = StatusFilter::Upcoming.apply_to_snapshot(snapshot, now);
        assert!(view.is_empty());
    }

    #[test]
    fn filter_names_parse_with_aliases() {
        assert_eq!("active".parse::<StatusFilter>().unwrap(), StatusFilter::Live);
        assert_eq!("Scheduled".parse::<StatusFilter>().unwrap(), StatusFilter::Upcoming);
        assert_eq!(
            "active-upcoming".parse::<StatusFilter>().unwrap(),
            StatusFilter::LiveUpcoming
        );
        assert_eq!("".parse::<StatusFilter>().unwrap(), StatusFilter::All);
        assert_eq!("whatever".parse::<StatusFilter>().unwrap(), StatusFilter::All);
        assert!(StatusFilter::Live.uses_live_endpoint());
        assert!(!StatusFilter::LiveUpcoming.uses_live_endpoint());
    }

    #[test]
    fn serde_accepts_the_same_aliases_as_parsing() {
        let raw = r#"["active", "LIVE-UPCOMING", "scheduled", "nonsense"]"#;
        let parsed: Vec<StatusFilter> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed,
            vec![
                StatusFilter::Live,
                StatusFilter::LiveUpcoming,
                StatusFilter::Upcoming,
                StatusFilter::All
            ]
        );
        assert_eq!(
            serde_json::to_string(&StatusFilter::LiveUpcoming).unwrap(),
            r#""live-upcoming""#
        );
    }
}
