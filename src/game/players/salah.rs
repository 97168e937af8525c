use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use super::{LeagueView, Strategy, MIN_ODDS};
use crate::game::accounts::{AccountManager, RecoverAccount, StakingPolicy};
use crate::game::ticket::Ticket;

const MIN_REQUIRED_WEEKS: usize = 5;

/// Follows last league's champion through the next league, only in weeks
/// where its win odds sit in a middle band.
pub struct Salah {
    account: RecoverAccount,
    max_week: u32,
    team: Option<String>,
    prev_team: Option<String>,
    required_weeks: BTreeSet<u32>,
}

impl Salah {
    pub fn new(manager: Arc<AccountManager>, max_week: u32) -> Self {
        Salah {
            account: RecoverAccount::new(manager),
            max_week,
            team: None,
            prev_team: None,
            required_weeks: (1..=max_week).collect(),
        }
    }
}

fn win_odd_id(home: &str, team: &str) -> u32 {
    if home == team {
        0
    } else {
        1
    }
}

impl Strategy for Salah {
    fn name(&self) -> &'static str {
        "salah"
    }

    fn account(&mut self) -> &mut dyn StakingPolicy {
        &mut self.account
    }

    fn forecast(&mut self, view: &LeagueView<'_>) -> Result<Vec<Ticket>> {
        if view.week == view.max_week {
            self.prev_team = view.leader().map(str::to_string);
        }
        let Some(team) = self.team.as_deref() else {
            return Ok(Vec::new());
        };
        if !self.required_weeks.contains(&view.week) {
            return Ok(Vec::new());
        }
        let Some((event_id, fixture)) = view.fixture_of(team) else {
            return Ok(Vec::new());
        };
        let odd_id = win_odd_id(&fixture.home, team);
        let odd_value = fixture.odd(odd_id)?;
        if odd_value < MIN_ODDS {
            return Ok(Vec::new());
        }
        let raw_stake = self.account.stake(odd_value);
        let stake = self.account.base.normalize_stake(raw_stake);
        Ok(vec![view.single_ticket(self.name(), event_id, fixture, odd_id, odd_value, stake)?])
    }

    fn on_league_cached(&mut self, view: &LeagueView<'_>) {
        self.team = self.prev_team.clone();
        self.required_weeks = (1..=self.max_week).collect();
        let Some(team) = self.team.as_deref() else {
            return;
        };
        let weeks: BTreeSet<u32> = view
            .league_games
            .iter()
            .filter(|(_, games)| {
                games.values().any(|f| {
                    f.involves(team)
                        && f.odd(win_odd_id(&f.home, team))
                            .map(|odds| odds > 1.4 && odds < 1.9)
                            .unwrap_or(false)
                })
            })
            .map(|(week, _)| *week)
            .collect();
        debug!(
            "[{}:{}] {} {} weeks {:?}",
            view.username,
            view.game_id,
            self.name(),
            team,
            weeks
        );
        if weeks.len() >= MIN_REQUIRED_WEEKS {
            self.required_weeks = weeks;
        }
    }
}
