use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use super::{LeagueView, Resolution, Strategy, MIN_ODDS};
use crate::game::accounts::{AccountManager, RecoverAccount, StakingPolicy};
use crate::game::ticket::Ticket;

/// Points the leader must be clear by.
const LEAD: u32 = 15;

/// Once a team runs away with the league, backs it to win every week until
/// one bet lands, then sits out the rest of the league.
pub struct Hazard {
    account: RecoverAccount,
    league: Option<u32>,
    team: Option<String>,
}

impl Hazard {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        Hazard {
            account: RecoverAccount::new(manager),
            league: None,
            team: None,
        }
    }
}

impl Strategy for Hazard {
    fn name(&self) -> &'static str {
        "hazard"
    }

    fn account(&mut self) -> &mut dyn StakingPolicy {
        &mut self.account
    }

    fn min_week(&self) -> u32 {
        2
    }

    fn forecast(&mut self, view: &LeagueView<'_>) -> Result<Vec<Ticket>> {
        if self.league != Some(view.league) {
            self.league = Some(view.league);
            self.team = None;
        }
        if self.team.is_none() {
            if let [first, second, ..] = view.table.get_league_table() {
                if first.points > second.points + LEAD {
                    debug!(
                        "[{}:{}] {} {} {} clear of {}",
                        view.username,
                        view.game_id,
                        self.name(),
                        first.team,
                        first.points - second.points,
                        second.team
                    );
                    self.team = Some(first.team.clone());
                }
            }
        }
        let Some(team) = self.team.as_deref() else {
            return Ok(Vec::new());
        };
        let Some((event_id, fixture)) = view.fixture_of(team) else {
            return Ok(Vec::new());
        };
        let odd_id = if fixture.home == team { 0 } else { 1 };
        let odd_value = fixture.odd(odd_id)?;
        if odd_value < MIN_ODDS {
            return Ok(Vec::new());
        }
        let raw_stake = self.account.stake(odd_value);
        let stake = self.account.base.normalize_stake(raw_stake);
        Ok(vec![view.single_ticket(self.name(), event_id, fixture, odd_id, odd_value, stake)?])
    }

    fn on_ticket_resolve(&mut self, ticket: &Ticket) -> Resolution {
        if ticket.total_won > 0.0 {
            self.team = None;
            return Resolution::LeagueComplete;
        }
        Resolution::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::players::testing::*;
    use crate::game::players::WeekGames;
    use std::collections::BTreeMap;

    #[test]
    fn keeps_backing_the_runaway_leader_after_a_loss() {
        let mut hazard = Hazard::new(Arc::new(AccountManager::new(true, 100.0)));
        let table = table_after(8, &[("BAR", "RMA", 2, 0), ("ATM", "SEV", 0, 0)]);
        let games = BTreeMap::from([(9, WeekGames::from([(4, fixture("BAR", "ATM", 0, &[(0, 1.5)]))]))]);
        let view = view(&table, &games, 9);

        let tickets = hazard.forecast(&view).unwrap();
        assert_eq!(tickets[0].events[0].bets[0].odd_id, 0);
        // recovers the opening 5 at 1.5
        assert_eq!(tickets[0].stake(), 10.0);

        assert_eq!(hazard.on_ticket_resolve(&tickets[0]), Resolution::Continue);
        assert_eq!(hazard.team.as_deref(), Some("BAR"));

        let mut won = tickets[0].clone();
        won.total_won = 15.0;
        assert_eq!(hazard.on_ticket_resolve(&won), Resolution::LeagueComplete);
        assert!(hazard.team.is_none());
    }
}
