use std::sync::Arc;

use anyhow::Result;

use super::{LeagueView, Strategy, MIN_ODDS};
use crate::game::accounts::{AccountManager, StakingPolicy, TokenAccount};
use crate::game::ticket::Ticket;

/// The same selection on every fixture of the week, staked off the chip
/// cycle. The selection can be changed from the control plane.
pub struct Puig {
    account: TokenAccount,
    odd_id: u32,
}

impl Puig {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        Puig {
            account: TokenAccount::new(manager),
            odd_id: 0,
        }
    }
}

impl Strategy for Puig {
    fn name(&self) -> &'static str {
        "puig"
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
            let odd_value = fixture.odd(self.odd_id)?;
            if odd_value < MIN_ODDS {
                continue;
            }
            let raw_stake = self.account.stake(odd_value);
            let stake = self.account.base.normalize_stake(raw_stake);
            tickets.push(view.single_ticket(self.name(), *event_id, fixture, self.odd_id, odd_value, stake)?);
        }
        Ok(tickets)
    }

    fn set_odd_id(&mut self, odd_id: u32) {
        self.odd_id = odd_id;
    }
}
