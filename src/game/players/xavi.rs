use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;

use super::{LeagueView, Strategy, MIN_ODDS};
use crate::game::accounts::{AccountManager, FixedStake, StakingPolicy};
use crate::game::ticket::Ticket;

const TEAM: &str = "BAR";
const OPPONENTS: [&str; 7] = ["MAL", "GRN", "OSA", "VLL", "LEV", "LEG", "ALA"];

/// Home win for Barcelona, narrowed to the weak visitors once the league's
/// fixtures are known.
pub struct Xavi {
    account: FixedStake,
    required_weeks: BTreeSet<u32>,
}

impl Xavi {
    pub fn new(manager: Arc<AccountManager>, max_week: u32) -> Self {
        Xavi {
            account: FixedStake::new(manager, 50.0),
            required_weeks: (1..=max_week).collect(),
        }
    }
}

impl Strategy for Xavi {
    fn name(&self) -> &'static str {
        "xavi"
    }

    fn account(&mut self) -> &mut dyn StakingPolicy {
        &mut self.account
    }

    fn forecast(&mut self, view: &LeagueView<'_>) -> Result<Vec<Ticket>> {
        if !self.required_weeks.contains(&view.week) {
            return Ok(Vec::new());
        }
        let Some((event_id, fixture)) = view
            .week_games()
            .and_then(|games| games.iter().find(|(_, f)| f.home == TEAM))
        else {
            return Ok(Vec::new());
        };
        let odd_value = fixture.odd(0)?;
        if odd_value < MIN_ODDS {
            return Ok(Vec::new());
        }
        let stake = self.account.stake(odd_value);
        Ok(vec![view.single_ticket(self.name(), *event_id, fixture, 0, odd_value, stake)?])
    }

    fn on_league_cached(&mut self, view: &LeagueView<'_>) {
        self.required_weeks = view
            .league_games
            .iter()
            .filter(|(_, games)| {
                games
                    .values()
                    .any(|f| f.home == TEAM && OPPONENTS.contains(&f.away.as_str()))
            })
            .map(|(week, _)| *week)
            .collect();
    }
}
