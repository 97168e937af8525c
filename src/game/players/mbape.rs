use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use super::{get_result_ratio, LeagueView, Strategy, MIN_ODDS};
use crate::game::accounts::{AccountManager, RecoverAccount, StakingPolicy};
use crate::game::ticket::Ticket;

/// Form points gap (20 per win) needed to back a side.
const FORM_GAP: i64 = 60;

/// Backs the in-form side of the first fixture with a wide recent-form gap,
/// and sticks with that pick until its ticket settles.
pub struct Mbape {
    account: RecoverAccount,
    team: Option<String>,
    odd_id: u32,
}

impl Mbape {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        Mbape {
            account: RecoverAccount::new(manager),
            team: None,
            odd_id: 73,
        }
    }

    fn predict(&mut self, view: &LeagueView<'_>) {
        let (Some(games), Some(stats)) = (view.week_games(), view.table.get_week_stats(view.week)) else {
            return;
        };
        for (event_id, fixture) in games {
            let Some(last_result) = stats
                .get(event_id)
                .and_then(|s| s.pointer("/teamToTeam/lastResult"))
                .and_then(Value::as_array)
            else {
                continue;
            };
            let (home, away) = get_result_ratio(last_result);
            let gap = home as i64 - away as i64;
            if gap.abs() > FORM_GAP {
                self.odd_id = if gap > 0 { 0 } else { 1 };
                self.team = Some(fixture.home.clone());
                return;
            }
        }
    }
}

impl Strategy for Mbape {
    fn name(&self) -> &'static str {
        "mbape"
    }

    fn account(&mut self) -> &mut dyn StakingPolicy {
        &mut self.account
    }

    fn forecast(&mut self, view: &LeagueView<'_>) -> Result<Vec<Ticket>> {
        if self.team.is_none() {
            self.predict(view);
        }
        let Some(team) = self.team.as_deref() else {
            return Ok(Vec::new());
        };
        let Some((event_id, fixture)) = view.fixture_of(team) else {
            return Ok(Vec::new());
        };
        let odd_value = fixture.odd(self.odd_id)?;
        if odd_value < MIN_ODDS {
            return Ok(Vec::new());
        }
        let stake = self.account.base.normalize_stake(5.0);
        Ok(vec![view.single_ticket(self.name(), event_id, fixture, self.odd_id, odd_value, stake)?])
    }

    fn on_ticket_resolve(&mut self, _ticket: &Ticket) -> super::Resolution {
        self.team = None;
        super::Resolution::Continue
    }
}
