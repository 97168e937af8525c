use std::sync::Arc;

use anyhow::Result;

use super::{LeagueView, Strategy};
use crate::game::accounts::{AccountManager, FixedProfitAccount, StakingPolicy};
use crate::game::ticket::Ticket;

const DRAW_NO_BET_AWAY: u32 = 206;
const DRAW_NO_BET_HOME: u32 = 207;
const MIN_DNB_ODDS: f64 = 1.3;

/// Draw-no-bet on the outsider of every fixture.
pub struct Fati {
    account: FixedProfitAccount,
}

impl Fati {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        Fati {
            account: FixedProfitAccount::new(manager),
        }
    }
}

impl Strategy for Fati {
    fn name(&self) -> &'static str {
        "fati"
    }

    fn account(&mut self) -> &mut dyn StakingPolicy {
        &mut self.account
    }

    fn forecast(&mut self, view: &LeagueView<'_>) -> Result<Vec<Ticket>> {
        let Some(games) = view.week_games() else {
            return Ok(Vec::new());
        };
        let mut tickets = Vec::new();
        for (event_id, fixture) in games {
            let odd_id = if fixture.odd(0)? >= fixture.odd(1)? {
                DRAW_NO_BET_HOME
            } else {
                DRAW_NO_BET_AWAY
            };
            let odd_value = fixture.odd(odd_id)?;
            if odd_value < MIN_DNB_ODDS {
                continue;
            }
            let stake = self.account.stake(odd_value);
            tickets.push(view.single_ticket(self.name(), *event_id, fixture, odd_id, odd_value, stake)?);
        }
        Ok(tickets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::players::testing::*;
    use crate::game::players::WeekGames;
    use std::collections::BTreeMap;

    #[test]
    fn draw_no_bet_on_the_outsider() {
        let mut fati = Fati::new(Arc::new(AccountManager::new(true, 100.0)));
        let table = table_after(0, &[]);
        let games = BTreeMap::from([(
            1,
            WeekGames::from([
                (1, fixture("GRN", "BAR", 0, &[(0, 6.0), (1, 1.4), (207, 3.5)])),
                (2, fixture("RMA", "LEV", 1, &[(0, 1.3), (1, 8.0), (206, 1.2)])),
            ]),
        )]);
        let tickets = fati.forecast(&view(&table, &games, 1)).unwrap();
        assert_eq!(tickets.len(), 1);
        let bet = &tickets[0].events[0].bets[0];
        assert_eq!(bet.odd_id, 207);
        assert_eq!(bet.market_id, "Draw_No_Bet");
        assert_eq!(tickets[0].stake(), 2.0);
    }
}
