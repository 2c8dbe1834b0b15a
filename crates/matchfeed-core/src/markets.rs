//! Odds-market normalization.
//!
//! Upstream odds arrive either already resolved per side or as a list of
//! `{key, outcomes}` markets. Both collapse into [`NormalizedMarket`]; any
//! side that cannot be resolved becomes [`MarketLine::Unavailable`] and the
//! UI disables the control bound to it. Nothing here fails.

use serde::{Deserialize, Serialize};

use crate::{Market, OddsPayload, Outcome};

pub const MONEYLINE_KEY: &str = "h2h";
pub const SPREADS_KEY: &str = "spreads";
pub const TOTALS_KEY: &str = "totals";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MarketLine {
    Available {
        point: Option<f64>,
        price: f64,
    },
    #[default]
    Unavailable,
}

impl MarketLine {
    pub fn from_parts(point: Option<f64>, price: Option<f64>) -> Self {
        match price {
            Some(price) if price.is_finite() => MarketLine::Available {
                point: point.filter(|p| p.is_finite()),
                price,
            },
            _ => MarketLine::Unavailable,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, MarketLine::Available { .. })
    }

    pub fn price(&self) -> Option<f64> {
        match self {
            MarketLine::Available { price, .. } => Some(*price),
            MarketLine::Unavailable => None,
        }
    }

    pub fn point(&self) -> Option<f64> {
        match self {
            MarketLine::Available { point, .. } => *point,
            MarketLine::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMarket {
    pub spread_home: MarketLine,
    pub spread_away: MarketLine,
    pub moneyline_home: MarketLine,
    pub moneyline_away: MarketLine,
    pub total_over: MarketLine,
    pub total_under: MarketLine,
}

impl NormalizedMarket {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn any_available(&self) -> bool {
        [
            self.spread_home,
            self.spread_away,
            self.moneyline_home,
            self.moneyline_away,
            self.total_over,
            self.total_under,
        ]
        .iter()
        .any(MarketLine::is_available)
    }
}

pub fn find_market<'a>(markets: &'a [Market], key: &str) -> Option<&'a Market> {
    markets.iter().find(|m| m.key.trim().eq_ignore_ascii_case(key))
}

/// Exact case-insensitive name match first, then the first outcome whose
/// name contains, or is contained by, the target.
pub fn resolve_outcome<'a>(outcomes: &'a [Outcome], target: &str) -> Option<&'a Outcome> {
    let target = target.trim().to_lowercase();
    if target.is_empty() {
        return None;
    }
    if let Some(exact) = outcomes
        .iter()
        .find(|o| o.name.trim().to_lowercase() == target)
    {
        return Some(exact);
    }
    outcomes.iter().find(|o| {
        let name = o.name.trim().to_lowercase();
        !name.is_empty() && (name.contains(&target) || target.contains(&name))
    })
}

fn resolve_total_side<'a>(outcomes: &'a [Outcome], side: &str) -> Option<&'a Outcome> {
    outcomes
        .iter()
        .find(|o| o.name.to_lowercase().contains(side))
}

pub fn moneyline_for(markets: &[Market], team: &str) -> MarketLine {
    find_market(markets, MONEYLINE_KEY)
        .and_then(|m| resolve_outcome(&m.outcomes, team))
        .map(|o| MarketLine::from_parts(None, o.price))
        .unwrap_or(MarketLine::Unavailable)
}

/// Spread lines for both sides. The away point falls back to the negated
/// home point only when the away outcome carries no point of its own.
pub fn spreads_for(markets: &[Market], home: &str, away: &str) -> (MarketLine, MarketLine) {
    let Some(market) = find_market(markets, SPREADS_KEY) else {
        return (MarketLine::Unavailable, MarketLine::Unavailable);
    };
    let home_outcome = resolve_outcome(&market.outcomes, home);
    let away_outcome = resolve_outcome(&market.outcomes, away);
    let home_point = home_outcome.and_then(|o| o.point);

    let home_line = home_outcome
        .map(|o| MarketLine::from_parts(o.point, o.price))
        .unwrap_or(MarketLine::Unavailable);
    let away_line = away_outcome
        .map(|o| MarketLine::from_parts(o.point.or(home_point.map(|p| -p)), o.price))
        .unwrap_or(MarketLine::Unavailable);
    (home_line, away_line)
}

pub fn totals_for(markets: &[Market]) -> (MarketLine, MarketLine) {
    let Some(market) = find_market(markets, TOTALS_KEY) else {
        return (MarketLine::Unavailable, MarketLine::Unavailable);
    };
    let line = |side: &str| {
        resolve_total_side(&market.outcomes, side)
            .map(|o| MarketLine::from_parts(o.point, o.price))
            .unwrap_or(MarketLine::Unavailable)
    };
    (line("over"), line("under"))
}

pub fn normalize_market(odds: Option<&OddsPayload>, home: &str, away: &str) -> NormalizedMarket {
    match odds {
        None => NormalizedMarket::unavailable(),
        Some(OddsPayload::Named(named)) => *named,
        Some(OddsPayload::Markets(markets)) => {
            let (spread_home, spread_away) = spreads_for(markets, home, away);
            let (total_over, total_under) = totals_for(markets);
            NormalizedMarket {
                spread_home,
                spread_away,
                moneyline_home: moneyline_for(markets, home),
                moneyline_away: moneyline_for(markets, away),
                total_over,
                total_under,
            }
        }
    }
}
