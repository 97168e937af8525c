use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;

use super::{LeagueView, Strategy, MIN_ODDS};
use crate::game::accounts::{round2, AccountManager, RecoverAccount, StakingPolicy};
use crate::game::markets;
use crate::game::ticket::{Bet, Ticket};

/// Total goals 2-3 and 4-6.
const TOTAL_GOALS: [u32; 2] = [73, 75];

/// Covers the goal bands of the leader's fixture once the table has settled.
pub struct Ronaldo {
    account: RecoverAccount,
}

impl Ronaldo {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        Ronaldo {
            account: RecoverAccount::new(manager),
        }
    }
}

impl Strategy for Ronaldo {
    fn name(&self) -> &'static str {
        "ronaldo"
    }

    fn account(&mut self) -> &mut dyn StakingPolicy {
        &mut self.account
    }

    fn min_week(&self) -> u32 {
        8
    }

    fn forecast(&mut self, view: &LeagueView<'_>) -> Result<Vec<Ticket>> {
        let team = view.leader().ok_or_else(|| anyhow!("empty table"))?;
        let Some((event_id, fixture)) = view.fixture_of(team) else {
            return Ok(Vec::new());
        };
        let mut event = view.event(event_id, fixture);
        let mut wins = Vec::with_capacity(TOTAL_GOALS.len());
        for odd_id in TOTAL_GOALS {
            let odd_value = fixture.odd(odd_id)?;
            if odd_value < MIN_ODDS {
                return Ok(Vec::new());
            }
            let market = markets::lookup(odd_id).ok_or_else(|| anyhow!("unknown odd id {}", odd_id))?;
            let stake = self.account.base.normalize_stake(10.0);
            event.add_bet(Bet::new(odd_id, market.market, odd_value, &market.name, stake));
            wins.push(round2(stake * odd_value));
            info!(
                "[{}:{}] {} {:?}[{} : {}]",
                view.username,
                view.game_id,
                self.name(),
                [&fixture.home, &fixture.away],
                odd_id,
                odd_value
            );
        }

        let mut ticket = Ticket::new(view.game_id, self.name());
        ticket.add_event(event);
        ticket.min_winning = wins.iter().copied().fold(f64::INFINITY, f64::min);
        ticket.max_winning = wins.iter().copied().fold(0.0, f64::max);
        ticket.grouping = 1;
        ticket.winning_count = TOTAL_GOALS.len() as u32;
        ticket.system_count = TOTAL_GOALS.len() as u32;
        Ok(vec![ticket])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::players::testing::*;
    use crate::game::players::WeekGames;
    use std::collections::BTreeMap;

    #[test]
    fn covers_both_goal_bands() {
        let mut ronaldo = Ronaldo::new(Arc::new(AccountManager::new(true, 100.0)));
        let table = table_after(7, &[("BAR", "SEV", 2, 0)]);
        let games = BTreeMap::from([(
            8,
            WeekGames::from([(5, fixture("SEV", "BAR", 3, &[(73, 1.9), (75, 3.5)]))]),
        )]);
        let tickets = ronaldo.forecast(&view(&table, &games, 8)).unwrap();
        let ticket = &tickets[0];
        assert_eq!(ticket.events.len(), 1);
        assert_eq!(ticket.events[0].bets.len(), 2);
        assert_eq!(ticket.events[0].event_ndx, Some(3));
        assert_eq!(ticket.stake(), 20.0);
        assert_eq!(ticket.min_winning, 19.0);
        assert_eq!(ticket.max_winning, 35.0);
        assert_eq!((ticket.winning_count, ticket.system_count), (2, 2));
    }
}
