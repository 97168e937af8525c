use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::{LeagueView, Strategy, MIN_ODDS};
use crate::game::accounts::{AccountManager, RecoverAccount, StakingPolicy};
use crate::game::ticket::Ticket;

const OVER_1_5: u32 = 51;

/// Over 1.5 goals in the league leader's fixture.
pub struct Messi {
    account: RecoverAccount,
}

impl Messi {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        Messi {
            account: RecoverAccount::new(manager),
        }
    }
}

impl Strategy for Messi {
    fn name(&self) -> &'static str {
        "messi"
    }

    fn account(&mut self) -> &mut dyn StakingPolicy {
        &mut self.account
    }

    fn min_week(&self) -> u32 {
        2
    }

    fn forecast(&mut self, view: &LeagueView<'_>) -> Result<Vec<Ticket>> {
        let team = view.leader().ok_or_else(|| anyhow!("empty table"))?;
        let Some((event_id, fixture)) = view.fixture_of(team) else {
            return Ok(Vec::new());
        };
        let odd_value = fixture.odd(OVER_1_5)?;
        if odd_value < MIN_ODDS {
            return Ok(Vec::new());
        }
        let stake = self.account.base.normalize_stake(5.0);
        let ticket = view.single_ticket(self.name(), event_id, fixture, OVER_1_5, odd_value, stake)?;
        Ok(vec![ticket])
    }
}
