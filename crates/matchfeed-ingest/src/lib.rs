//! Ingestion boundary: raw upstream JSON in, typed match patches out.
//!
//! Snapshot entries and push events share one loosely-shaped record format
//! with several spellings per field. This crate collapses those variants
//! exactly once, resolves the canonical id, and hands typed
//! [`MatchPatch`]es to the reconciler. Apart from identity resolution,
//! nothing here fails: malformed sub-objects degrade to "not sent".

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use matchfeed_core::{
    CanonicalId, Market, MarketLine, MatchEntity, MatchPatch, NormalizedMarket, OddsPayload,
    Outcome, Score,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "matchfeed-ingest";

/// Identity fields in priority order. The first present, non-empty value wins.
pub const ID_FIELDS: [&str; 3] = ["id", "_id", "externalId"];

const SNAPSHOT_WRAPPER_KEYS: [&str; 4] = ["matches", "data", "events", "items"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record carries none of id, _id, externalId")]
    Missing,
}

/// Resolve the canonical id of a raw record: `id`, then `_id`, then
/// `externalId`. Strings are trimmed and blank ones skipped; integer ids
/// are rendered in decimal.
pub fn resolve_identity(raw: &JsonValue) -> Result<CanonicalId, IdentityError> {
    let obj = raw.as_object().ok_or(IdentityError::NotAnObject)?;
    ID_FIELDS
        .iter()
        .find_map(|field| obj.get(*field).and_then(id_value))
        .map(CanonicalId::new)
        .ok_or(IdentityError::Missing)
}

fn id_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One record after the ingestion boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedRecord {
    pub id: CanonicalId,
    pub patch: MatchPatch,
}

impl IngestedRecord {
    pub fn into_entity(self) -> MatchEntity {
        MatchEntity::from_patch(self.id, self.patch)
    }
}

pub fn ingest_record(raw: &JsonValue) -> Result<IngestedRecord, IdentityError> {
    let id = resolve_identity(raw)?;
    let obj = raw.as_object().ok_or(IdentityError::NotAnObject)?;
    Ok(IngestedRecord {
        id,
        patch: patch_from_object(obj),
    })
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotIngest {
    pub records: Vec<IngestedRecord>,
    pub dropped: usize,
}

impl SnapshotIngest {
    pub fn into_entities(self) -> Vec<MatchEntity> {
        self.records.into_iter().map(IngestedRecord::into_entity).collect()
    }
}

/// Ingest a snapshot body: a top-level array, or an object wrapping one
/// under `matches`, `data`, `events` or `items`. Entries without a
/// resolvable id are dropped.
pub fn ingest_snapshot(body: &JsonValue) -> SnapshotIngest {
    let mut out = SnapshotIngest::default();
    for entry in snapshot_entries(body) {
        match ingest_record(entry) {
            Ok(record) => out.records.push(record),
            Err(err) => {
                out.dropped += 1;
                warn!(error = %err, "dropping snapshot entry without identity");
            }
        }
    }
    out
}

fn snapshot_entries(body: &JsonValue) -> &[JsonValue] {
    if let Some(arr) = body.as_array() {
        return arr;
    }
    SNAPSHOT_WRAPPER_KEYS
        .iter()
        .find_map(|key| body.get(*key).and_then(JsonValue::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn load_fixture_snapshot(path: impl AsRef<Path>) -> Result<JsonValue> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_present<'a>(obj: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn json_str(obj: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| v.as_str().and_then(text_or_none))
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn json_f64(obj: &Map<String, JsonValue>, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(as_f64)
}

fn json_i64(obj: &Map<String, JsonValue>, keys: &[&str]) -> Option<i64> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(as_i64)
}

const START_KEYS: [&str; 4] = ["startTime", "start_time", "commence_time", "commenceTime"];

fn patch_from_object(obj: &Map<String, JsonValue>) -> MatchPatch {
    MatchPatch {
        sport: json_str(obj, &["sport", "sport_key", "sportKey", "league"]),
        home_team: json_str(obj, &["homeTeam", "home_team"]),
        away_team: json_str(obj, &["awayTeam", "away_team"]),
        start_time: first_present(obj, &START_KEYS).and_then(parse_timestamp),
        status: json_str(obj, &["status"]),
        score: obj.get("score").and_then(JsonValue::as_object).map(parse_score),
        odds: obj.get("odds").and_then(parse_odds),
    }
}

/// RFC 3339 strings, or epoch seconds / milliseconds as numbers.
pub fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        JsonValue::Number(n) => {
            let raw = n.as_i64()?;
            if raw.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

fn parse_score(obj: &Map<String, JsonValue>) -> Score {
    let period = first_present(obj, &["period"]).and_then(|v| match v {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    });
    Score {
        score_home: json_i64(obj, &["scoreHome", "score_home", "home"]),
        score_away: json_i64(obj, &["scoreAway", "score_away", "away"]),
        period,
        event_status: json_str(obj, &["eventStatus", "event_status", "status"]),
    }
}

const NAMED_KEYS: [&str; 6] = [
    "spreadHome",
    "spreadAway",
    "moneylineHome",
    "moneylineAway",
    "totalOver",
    "totalUnder",
];

fn parse_odds(value: &JsonValue) -> Option<OddsPayload> {
    if let Some(arr) = value.as_array() {
        return Some(OddsPayload::Markets(parse_markets(arr)));
    }
    let obj = value.as_object()?;
    if let Some(arr) = obj.get("markets").and_then(JsonValue::as_array) {
        return Some(OddsPayload::Markets(parse_markets(arr)));
    }
    if NAMED_KEYS.iter().any(|k| obj.contains_key(*k)) {
        return Some(OddsPayload::Named(parse_named(obj)));
    }
    None
}

fn parse_markets(arr: &[JsonValue]) -> Vec<Market> {
    arr.iter()
        .filter_map(JsonValue::as_object)
        .filter_map(|m| {
            let key = json_str(m, &["key"])?;
            let outcomes = m
                .get("outcomes")
                .and_then(JsonValue::as_array)
                .map(|outcomes| outcomes.iter().filter_map(parse_outcome).collect())
                .unwrap_or_default();
            Some(Market { key, outcomes })
        })
        .collect()
}

fn parse_outcome(value: &JsonValue) -> Option<Outcome> {
    let obj = value.as_object()?;
    Some(Outcome {
        name: json_str(obj, &["name"])?,
        point: json_f64(obj, &["point"]),
        price: json_f64(obj, &["price"]),
    })
}

fn parse_named(obj: &Map<String, JsonValue>) -> NormalizedMarket {
    let line = |key: &str| {
        obj.get(key)
            .and_then(JsonValue::as_object)
            .map(|l| MarketLine::from_parts(json_f64(l, &["point"]), json_f64(l, &["price"])))
            .unwrap_or(MarketLine::Unavailable)
    };
    NormalizedMarket {
        spread_home: line("spreadHome"),
        spread_away: line("spreadAway"),
        moneyline_home: line("moneylineHome"),
        moneyline_away: line("moneylineAway"),
        total_over: line("totalOver"),
        total_under: line("totalUnder"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_follows_fixed_priority_order() {
        let raw = json!({"externalId": "x", "_id": "u", "id": "i"});
        assert_eq!(resolve_identity(&raw).unwrap().as_str(), "i");
        let raw = json!({"externalId": "x", "_id": "u"});
        assert_eq!(resolve_identity(&raw).unwrap().as_str(), "u");
        let raw = json!({"externalId": "x"});
        assert_eq!(resolve_identity(&raw).unwrap().as_str(), "x");
    }

    #[test]
    fn blank_and_null_ids_fall_through() {
        let raw = json!({"id": "  ", "_id": null, "externalId": 42});
        assert_eq!(resolve_identity(&raw).unwrap().as_str(), "42");
        assert_eq!(resolve_identity(&json!({"id": ""})), Err(IdentityError::Missing));
        assert_eq!(resolve_identity(&json!("m1")), Err(IdentityError::NotAnObject));
    }

    #[test]
    fn field_spelling_variants_collapse() {
        let a = ingest_record(&json!({
            "id": "m1",
            "homeTeam": "Lakers",
            "away_team": "Celtics",
            "sport_key": "basketball_nba",
            "score": {
                "score_home": "3",
                "scoreAway": 1,
                "period": 2,
                "event_status": "STATUS_IN_PROGRESS"
            }
        }))
        .unwrap();
        assert_eq!(a.patch.home_team.as_deref(), Some("Lakers"));
        assert_eq!(a.patch.away_team.as_deref(), Some("Celtics"));
        assert_eq!(a.patch.sport.as_deref(), Some("basketball_nba"));
        let score = a.patch.score.unwrap();
        assert_eq!(score.score_home, Some(3));
        assert_eq!(score.score_away, Some(1));
        assert_eq!(score.period.as_deref(), Some("2"));
        assert_eq!(score.event_status.as_deref(), Some("STATUS_IN_PROGRESS"));
    }

    #[test]
    fn absent_and_null_fields_stay_unsent() {
        let raw = json!({"_id": "m1", "status": null, "startTime": "not a date"});
        let r = ingest_record(&raw).unwrap();
        assert!(r.patch.is_empty());
    }

    #[test]
    fn timestamps_accept_rfc3339_and_epoch() {
        let iso = parse_timestamp(&json!("2026-03-01T19:30:00Z")).unwrap();
        let secs = parse_timestamp(&json!(iso.timestamp())).unwrap();
        let millis = parse_timestamp(&json!(iso.timestamp_millis())).unwrap();
        assert_eq!(iso, secs);
        assert_eq!(iso, millis);
    }

    #[test]
    fn odds_shapes_are_recognized() {
        let markets = ingest_record(&json!({
            "id": "m1",
            "odds": {"markets": [
                {"key": "h2h", "outcomes": [{"name": "Lakers", "price": -150}, {"price": 100}]},
                {"outcomes": []}
            ]}
        }))
        .unwrap();
        match markets.patch.odds {
            Some(OddsPayload::Markets(m)) => {
                assert_eq!(m.len(), 1);
                assert_eq!(m[0].outcomes.len(), 1);
                assert_eq!(m[0].outcomes[0].price, Some(-150.0));
            }
            other => panic!("unexpected odds {other:?}"),
        }

        let named = ingest_record(&json!({
            "id": "m2",
            "odds": {"moneylineHome": {"price": "-110"}, "spreadHome": {"point": -2.5}}
        }))
        .unwrap();
        match named.patch.odds {
            Some(OddsPayload::Named(n)) => {
                assert_eq!(n.moneyline_home.price(), Some(-110.0));
                assert_eq!(n.spread_home, MarketLine::Unavailable);
            }
            other => panic!("unexpected odds {other:?}"),
        }

        let junk = ingest_record(&json!({"id": "m3", "odds": {"foo": 1}})).unwrap();
        assert!(junk.patch.odds.is_none());
    }

    #[test]
    fn snapshot_wrappers_and_dropped_entries() {
        let body = json!({"data": [{"id": "a"}, {"name": "no id"}, {"_id": "b"}]});
        let ingest = ingest_snapshot(&body);
        assert_eq!(ingest.dropped, 1);
        let ids: Vec<_> = ingest
            .into_entities()
            .into_iter()
            .map(|m| m.canonical_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(ingest_snapshot(&json!({"unexpected": true})).records.is_empty());
    }
}
