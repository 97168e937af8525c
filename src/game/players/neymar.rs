use std::sync::Arc;

use anyhow::Result;

use super::{LeagueView, Strategy, MIN_ODDS};
use crate::game::accounts::{AccountManager, FixedStake, StakingPolicy};
use crate::game::ticket::Ticket;

const HOME_PLUS_ONE: u32 = 210;
const AWAY_PLUS_ONE: u32 = 211;

/// +1 handicap on whoever is bottom of the table after the last results.
pub struct Neymar {
    account: FixedStake,
    team: Option<String>,
}

impl Neymar {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        Neymar {
            account: FixedStake::new(manager, 100.0),
            team: None,
        }
    }
}

impl Strategy for Neymar {
    fn name(&self) -> &'static str {
        "neymar"
    }

    fn account(&mut self) -> &mut dyn StakingPolicy {
        &mut self.account
    }

    fn forecast(&mut self, view: &LeagueView<'_>) -> Result<Vec<Ticket>> {
        let Some(team) = self.team.as_deref() else {
            return Ok(Vec::new());
        };
        let Some((event_id, fixture)) = view.fixture_of(team) else {
            return Ok(Vec::new());
        };
        let odd_id = if fixture.home == team {
            HOME_PLUS_ONE
        } else {
            AWAY_PLUS_ONE
        };
        let odd_value = fixture.odd(odd_id)?;
        if odd_value < MIN_ODDS {
            return Ok(Vec::new());
        }
        let stake = self.account.stake(odd_value);
        Ok(vec![view.single_ticket(self.name(), event_id, fixture, odd_id, odd_value, stake)?])
    }

    fn on_result(&mut self, view: &LeagueView<'_>) {
        self.team = view.table.get_league_table().last().map(|s| s.team.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::players::testing::*;
    use crate::game::players::WeekGames;
    use std::collections::BTreeMap;

    #[test]
    fn waits_for_results_then_backs_the_bottom_side() {
        let mut neymar = Neymar::new(Arc::new(AccountManager::new(true, 1000.0)));
        let table = table_after(1, &[("BAR", "SEV", 4, 0), ("RMA", "ATM", 1, 0)]);
        let games = BTreeMap::from([(
            2,
            WeekGames::from([
                (1, fixture("BAR", "ATM", 0, &[(210, 1.7), (211, 2.2)])),
                (2, fixture("SEV", "RMA", 1, &[(210, 1.4), (211, 2.9)])),
            ]),
        )]);
        let view = view(&table, &games, 2);
        assert!(neymar.forecast(&view).unwrap().is_empty());

        neymar.on_result(&view);
        let tickets = neymar.forecast(&view).unwrap();
        let bet = &tickets[0].events[0].bets[0];
        assert_eq!(tickets[0].events[0].event_id, 2);
        assert_eq!((bet.odd_id, bet.odd_value), (210, 1.4));
        assert_eq!(tickets[0].stake(), 100.0);
    }
}
