//! Betting strategies ("players") and the registry that builds them.
//!
//! A strategy looks at the league as seen by its competition and proposes
//! tickets; the [`Player`] wrapper gates it per league, keeps its ledger in
//! step with settled tickets and contains its failures.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::accounts::{AccountManager, StakingPolicy};
use super::markets;
use super::table::LeagueTable;
use super::ticket::{Bet, Event, Ticket};

mod fati;
mod hazard;
mod mbape;
mod messi;
mod neymar;
mod puig;
mod ronaldo;
mod salah;
mod xavi;

/// Below this the bookmaker's margin eats any edge.
pub const MIN_ODDS: f64 = 1.02;

/// One scheduled match as announced in an event or history block.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub home: String,
    pub away: String,
    pub odds: Vec<f64>,
    /// Position inside its block.
    pub index: usize,
    pub participants: Vec<Value>,
}

impl Fixture {
    pub fn involves(&self, team: &str) -> bool {
        self.home == team || self.away == team
    }

    pub fn odd(&self, odd_id: u32) -> Result<f64> {
        markets::odd_value(&self.odds, odd_id)
            .ok_or_else(|| anyhow!("no odds for {} in {} v {}", odd_id, self.home, self.away))
    }
}

/// event id -> fixture
pub type WeekGames = BTreeMap<u64, Fixture>;

/// What a strategy may look at.
#[derive(Clone, Copy)]
pub struct LeagueView<'a> {
    pub game_id: u32,
    pub username: &'a str,
    pub league: u32,
    pub week: u32,
    pub max_week: u32,
    pub table: &'a LeagueTable,
    pub league_games: &'a BTreeMap<u32, WeekGames>,
}

impl<'a> LeagueView<'a> {
    pub fn week_games(&self) -> Option<&'a WeekGames> {
        self.league_games.get(&self.week)
    }

    /// This week's fixture of `team`.
    pub fn fixture_of(&self, team: &str) -> Option<(u64, &'a Fixture)> {
        self.week_games()?
            .iter()
            .find(|(_, f)| f.involves(team))
            .map(|(id, f)| (*id, f))
    }

    pub fn leader(&self) -> Option<&'a str> {
        self.table.get_league_table().first().map(|s| s.team.as_str())
    }

    pub fn event(&self, event_id: u64, fixture: &Fixture) -> Event {
        let mut event = Event::new(event_id, self.league, self.week, fixture.participants.clone());
        event.event_ndx = Some(fixture.index as u32);
        event
    }

    /// A one-bet ticket on `odd_id` of `fixture`.
    pub fn single_ticket(
        &self,
        player: &str,
        event_id: u64,
        fixture: &Fixture,
        odd_id: u32,
        odd_value: f64,
        stake: f64,
    ) -> Result<Ticket> {
        let market = markets::lookup(odd_id).ok_or_else(|| anyhow!("unknown odd id {}", odd_id))?;
        let bet = Bet::new(odd_id, market.market, odd_value, &market.name, stake);
        info!(
            "[{}:{}] {} {:?}[{} : {}]",
            self.username,
            self.game_id,
            player,
            [&fixture.home, &fixture.away],
            odd_id,
            odd_value
        );
        Ok(Ticket::single(self.game_id, player, self.event(event_id, fixture), bet))
    }
}

/// Outcome of a settled ticket as far as the strategy is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Continue,
    /// Stop betting for the rest of this league.
    LeagueComplete,
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn account(&mut self) -> &mut dyn StakingPolicy;

    fn min_week(&self) -> u32 {
        1
    }

    fn forecast(&mut self, view: &LeagueView<'_>) -> Result<Vec<Ticket>>;

    fn on_result(&mut self, _view: &LeagueView<'_>) {}

    /// Every fixture of the league is known.
    fn on_league_cached(&mut self, _view: &LeagueView<'_>) {}

    fn on_ticket_resolve(&mut self, _ticket: &Ticket) -> Resolution {
        Resolution::Continue
    }

    fn set_odd_id(&mut self, _odd_id: u32) {}
}

type Factory = fn(Arc<AccountManager>, u32) -> Box<dyn Strategy>;

const REGISTRY: &[(&str, Factory)] = &[
    ("messi", |m, _| Box::new(messi::Messi::new(m))),
    ("ronaldo", |m, _| Box::new(ronaldo::Ronaldo::new(m))),
    ("neymar", |m, _| Box::new(neymar::Neymar::new(m))),
    ("mbape", |m, _| Box::new(mbape::Mbape::new(m))),
    ("hazard", |m, _| Box::new(hazard::Hazard::new(m))),
    ("salah", |m, max_week| Box::new(salah::Salah::new(m, max_week))),
    ("xavi", |m, max_week| Box::new(xavi::Xavi::new(m, max_week))),
    ("puig", |m, _| Box::new(puig::Puig::new(m))),
    ("fati", |m, _| Box::new(fati::Fati::new(m))),
];

pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

pub fn create(name: &str, accounts: Arc<AccountManager>, max_week: u32) -> Option<Player> {
    REGISTRY
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, factory)| Player::new(factory(accounts, max_week)))
}

/// A strategy bound to one competition.
pub struct Player {
    strategy: Box<dyn Strategy>,
    league: Option<u32>,
    current_league_complete: bool,
}

impl Player {
    pub fn new(strategy: Box<dyn Strategy>) -> Self {
        Player {
            strategy,
            league: None,
            current_league_complete: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.strategy.name()
    }

    /// A new league clears the previous league's completion.
    pub fn can_forecast(&self, view: &LeagueView<'_>) -> bool {
        let complete = self.current_league_complete && self.league == Some(view.league);
        !complete && view.week >= self.strategy.min_week()
    }

    pub fn on_event(&mut self, view: &LeagueView<'_>) -> Vec<Ticket> {
        if self.league != Some(view.league) {
            self.league = Some(view.league);
            self.current_league_complete = false;
        }
        if !self.can_forecast(view) {
            return Vec::new();
        }
        match self.strategy.forecast(view) {
            Ok(tickets) => tickets.into_iter().filter(Ticket::is_valid).collect(),
            Err(e) => {
                warn!("[{}:{}] {} forecast: {:#}", view.username, view.game_id, self.name(), e);
                Vec::new()
            }
        }
    }

    pub fn on_result(&mut self, view: &LeagueView<'_>) {
        self.strategy.on_result(view);
    }

    pub fn on_league_cached(&mut self, view: &LeagueView<'_>) {
        self.strategy.on_league_cached(view);
    }

    /// Book a settled ticket against the strategy's account.
    pub async fn on_ticket(&mut self, ticket: &Ticket) {
        let stake = ticket.stake();
        if ticket.total_won < stake {
            self.strategy.account().on_loose(stake).await;
        } else {
            self.strategy.account().on_win(ticket.total_won).await;
        }
        if self.strategy.on_ticket_resolve(ticket) == Resolution::LeagueComplete {
            debug!("{} done for league {:?}", self.name(), self.league);
            self.current_league_complete = true;
        }
    }

    pub fn set_odd_id(&mut self, odd_id: u32) {
        self.strategy.set_odd_id(odd_id);
    }
}

/// Form points of the two sides from a `lastResult` list: 20 per win.
/// Entries are `"WL"` strings or `["W", "L"]` pairs, home first.
pub fn get_result_ratio(last_result: &[Value]) -> (u32, u32) {
    let mut home_ratio = 0;
    let mut away_ratio = 0;
    for result in last_result {
        let (home, away) = match result {
            Value::String(s) => {
                let mut chars = s.chars();
                (chars.next(), chars.next())
            }
            Value::Array(pair) => (
                pair.first().and_then(Value::as_str).and_then(|s| s.chars().next()),
                pair.get(1).and_then(Value::as_str).and_then(|s| s.chars().next()),
            ),
            _ => (None, None),
        };
        if home == Some('W') {
            home_ratio += 20;
        }
        if away == Some('W') {
            away_ratio += 20;
        }
    }
    (home_ratio, away_ratio)
}
