//! Odd id catalog for the virtual football ("GL") game type.
//!
//! An odd id names one selection; it belongs to a market and indexes the
//! event's `oddValues` array.

use std::sync::OnceLock;

/// Correct-score odd ids cover every score with at most six goals.
pub const CORRECT_SCORE_IDS: std::ops::RangeInclusive<u32> = 15..=42;

pub const CORRECT_SCORE: &str = "Correct_Score";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketOdd {
    pub odd_id: u32,
    pub market: &'static str,
    pub name: String,
    /// Index into the event's odds array.
    pub key: usize,
}

const NAMED: &[(u32, &str, &str)] = &[
    (0, "Match_Result", "1"),
    (1, "Match_Result", "2"),
    (2, "Match_Result", "X"),
    (51, "OverUnder_1_5", "Over"),
    (52, "OverUnder_1_5", "Under"),
    (53, "OverUnder_2_5", "Over"),
    (54, "OverUnder_2_5", "Under"),
    (55, "FullTimeUnderOver2_5GoalGoalNoGoal", "HomeOver2_5GoalGoal"),
    (73, "Total_Goals", "2_3"),
    (75, "Total_Goals", "4_6"),
    (206, "Draw_No_Bet", "Away"),
    (207, "Draw_No_Bet", "Home"),
    (210, "Handicap", "Home+1"),
    (211, "Handicap", "Away+1"),
];

fn catalog() -> &'static Vec<MarketOdd> {
    static CATALOG: OnceLock<Vec<MarketOdd>> = OnceLock::new();
    CATALOG.get_or_init(|| {
        let mut odds: Vec<MarketOdd> = NAMED
            .iter()
            .map(|&(odd_id, market, name)| MarketOdd {
                odd_id,
                market,
                name: name.to_string(),
                key: odd_id as usize,
            })
            .collect();
        odds.extend(CORRECT_SCORE_IDS.zip(scores()).map(|(odd_id, (home, away))| MarketOdd {
            odd_id,
            market: CORRECT_SCORE,
            name: format!("{}_{}", home, away),
            key: odd_id as usize,
        }));
        odds.sort_by_key(|o| o.odd_id);
        odds
    })
}

/// (home, away) pairs in correct-score id order.
fn scores() -> impl Iterator<Item = (u8, u8)> {
    (0..=6u8).flat_map(|home| (0..=6 - home).map(move |away| (home, away)))
}

pub fn lookup(odd_id: u32) -> Option<&'static MarketOdd> {
    catalog().iter().find(|o| o.odd_id == odd_id)
}

/// Odds value for `odd_id` in an event's odds array.
pub fn odd_value(odds: &[f64], odd_id: u32) -> Option<f64> {
    let market = lookup(odd_id)?;
    odds.get(market.key).copied()
}

/// Final score encoded by the correct-score market among `won_markets`.
pub fn score_from_won(won_markets: &[String]) -> Option<(u8, u8)> {
    won_markets
        .iter()
        .filter_map(|m| m.parse::<u32>().ok())
        .find(|id| CORRECT_SCORE_IDS.contains(id))
        .and_then(|id| scores().nth((id - CORRECT_SCORE_IDS.start()) as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_score_ids_cover_28_scores() {
        assert_eq!(scores().count(), 28);
        assert_eq!(lookup(15).unwrap().name, "0_0");
        assert_eq!(lookup(42).unwrap().name, "6_0");
        assert!(lookup(43).is_none());
    }

    #[test]
    fn score_is_taken_from_won_correct_score_market() {
        let won = vec!["0".to_string(), "16".to_string(), "51".to_string()];
        assert_eq!(score_from_won(&won), Some((0, 1)));
        assert_eq!(score_from_won(&["0".to_string()]), None);
    }

    #[test]
    fn odd_value_uses_catalog_key() {
        let mut odds = vec![0.0; 60];
        odds[51] = 1.35;
        assert_eq!(odd_value(&odds, 51), Some(1.35));
        assert_eq!(odd_value(&odds, 210), None);
        assert_eq!(lookup(1).unwrap().market, "Match_Result");
    }
}
