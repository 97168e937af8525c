//! League competition state machine.
//!
//! One task per game id. It walks its playlist block by block: fetch the next
//! event block, backfill the weeks the table is missing, cache the league's
//! fixtures, ask the players for tickets, wait for them to go through, fetch
//! the block's results and go again. Every request is answered before the
//! next one goes out, so responses are handled one at a time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::markets;
use super::players::{Fixture, LeagueView, Player, WeekGames};
use super::session::{CompetitionSignal, Playlist, Session};
use super::table::{Handicap, LeagueTable, MatchResult, WeekResultIds, WeekResults, WeekWinningIds};
use super::tickets::TicketManager;
use crate::error::VbetError;
use crate::remote::protocol::{participant_code, participant_id, EventBlock, EventData, EventResult};
use crate::remote::{Payload, Resource, Response, SocketEvent, SocketHandle};

pub const EVENTS_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const RESULTS_RETRY_DELAY: Duration = Duration::from_secs(3);
const MAX_RETRY_COUNT: u32 = 3;
const MAX_HISTORY_COUNT: u32 = 5;
const HISTORY_BLOCKS: i64 = 10;
const PROFILE: &str = "MOBILE";

/// Rounds per league of a playlist.
pub fn max_week(game_id: u32) -> u32 {
    match game_id {
        41047 | 14050 => 34,
        _ => 38,
    }
}

/// Where a competition's requests go.
pub trait Outbox: Send + Sync {
    /// Returns the `xs` the response will carry, `None` while disconnected.
    fn send(&self, resource: Resource, payload: Payload) -> Option<u64>;

    fn close(&self);
}

impl Outbox for SocketHandle {
    fn send(&self, resource: Resource, payload: Payload) -> Option<u64> {
        SocketHandle::send(self, resource, payload)
    }

    fn close(&self) {
        SocketHandle::close(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sleeping,
    Events,
    Tickets,
    Results,
}

/// A request in flight, kept until its response arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Events {
        n: i64,
    },
    Results {
        e_block_id: Option<u64>,
        n: i64,
        retry_count: u32,
    },
    /// `future` pages walk forward to cache fixtures; the others backfill results.
    History {
        e_block_id: Option<u64>,
        n: i64,
        retry_count: u32,
        future: bool,
    },
}

/// Everything known about the league currently running.
struct LeagueState {
    league: Option<u32>,
    week: u32,
    max_week: u32,
    table: LeagueTable,
    /// week -> fixtures
    games: BTreeMap<u32, WeekGames>,
    /// block id -> week
    blocks: BTreeMap<u64, u32>,
}

impl LeagueState {
    fn new(max_week: u32) -> Self {
        LeagueState {
            league: None,
            week: 0,
            max_week,
            table: LeagueTable::new(max_week),
            games: BTreeMap::new(),
            blocks: BTreeMap::new(),
        }
    }

    fn view<'a>(&'a self, game_id: u32, username: &'a str) -> LeagueView<'a> {
        LeagueView {
            game_id,
            username,
            league: self.league.unwrap_or_default(),
            week: self.week,
            max_week: self.max_week,
            table: &self.table,
            league_games: &self.games,
        }
    }

    fn is_blocks_complete(&self) -> bool {
        self.blocks.len() >= self.max_week as usize
    }

    fn block_of_week(&self, week: u32) -> Option<u64> {
        self.blocks
            .iter()
            .find(|(_, w)| **w == week)
            .map(|(block, _)| *block)
    }
}

pub struct Competition {
    game_id: u32,
    session: Arc<Session>,
    tickets: Arc<TicketManager>,
    players: Vec<Player>,
    outbox: Arc<dyn Outbox>,
    wake: mpsc::UnboundedSender<Request>,
    wake_rx: Option<mpsc::UnboundedReceiver<Request>>,

    phase: Phase,
    playlist: Playlist,
    state: LeagueState,
    e_block_id: Option<u64>,
    /// Unix seconds the current block is played at.
    event_time: f64,
    team_labels: HashMap<u64, String>,
    pending: HashMap<u64, Request>,
    active_tickets: Vec<u64>,

    online: bool,
    lost: bool,
    restoring: bool,
    auto_skip: bool,
    /// Backfilling missing weeks from history.
    caching: bool,
    /// Collecting the fixtures of the rest of the league.
    caching_future: bool,
    /// Future caching got no new blocks; give up for this league.
    future_stalled: bool,
    /// Every fixture of the league is known.
    cached: bool,
    /// Fetching single missing weeks once cached.
    caching_multiple: bool,
    history_count: u32,
}

fn fixture(index: usize, data: &EventData) -> Option<Fixture> {
    let (home, away) = data.teams()?;
    Some(Fixture {
        home,
        away,
        odds: data.odd_values.clone(),
        index,
        participants: data.participants.clone(),
    })
}

fn handicap(result: &EventResult) -> Handicap {
    Handicap {
        half_lost: result.data.half_lost_markets.clone(),
        half_won: result.data.half_won_markets.clone(),
        refund: result.data.refund_markets.clone(),
    }
}

fn won_ids(result: &EventResult) -> Vec<u32> {
    result
        .won_markets
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect()
}

/// First element of a list body, if it is an event block.
fn first_block(body: &Value) -> Option<EventBlock> {
    let data = body.as_array()?.first()?;
    if !data.is_object() {
        return None;
    }
    serde_json::from_value(data.clone()).ok()
}

/// Event times come as unix seconds or milliseconds, numbers or strings.
fn epoch_seconds(value: &Value) -> Option<f64> {
    let t = value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))?;
    Some(if t > 1e11 { t / 1000.0 } else { t })
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl Competition {
    pub fn new(
        game_id: u32,
        session: Arc<Session>,
        tickets: Arc<TicketManager>,
        players: Vec<Player>,
        outbox: Arc<dyn Outbox>,
    ) -> Self {
        let (wake, wake_rx) = mpsc::unbounded_channel();
        let max_week = max_week(game_id);
        info!("[{}:{}] competition installed", session.username(), game_id);
        Competition {
            game_id,
            session,
            tickets,
            players,
            outbox,
            wake,
            wake_rx: Some(wake_rx),
            phase: Phase::Sleeping,
            playlist: Playlist::default(),
            state: LeagueState::new(max_week),
            e_block_id: None,
            event_time: 0.0,
            team_labels: HashMap::new(),
            pending: HashMap::new(),
            active_tickets: Vec::new(),
            online: false,
            lost: false,
            restoring: false,
            auto_skip: false,
            caching: false,
            caching_future: false,
            future_stalled: false,
            cached: false,
            caching_multiple: false,
            history_count: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn username(&self) -> &str {
        self.session.username()
    }

    /// Drive the competition until its socket goes offline.
    pub async fn run(
        mut self,
        mut socket: mpsc::UnboundedReceiver<SocketEvent>,
        mut signals: mpsc::UnboundedReceiver<CompetitionSignal>,
    ) {
        let Some(mut wake) = self.wake_rx.take() else {
            return;
        };
        let mut signals_open = true;
        loop {
            tokio::select! {
                event = socket.recv() => match event {
                    Some(SocketEvent::Offline) | None => break,
                    Some(event) => self.on_socket_event(event).await,
                },
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => self.on_signal(signal).await,
                    None => {
                        signals_open = false;
                        self.outbox.close();
                    }
                },
                Some(request) = wake.recv() => self.request(request),
            }
        }
        self.online = false;
        self.phase = Phase::Sleeping;
        self.session.unregister_competition(self.game_id);
        debug!("[{}:{}] competition offline", self.username(), self.game_id);
    }

    async fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Online(body) => {
                self.session.setup_session(&body).await;
                self.playlist = self.session.playlist(self.game_id).unwrap_or_default();
                let start = !self.online || self.lost;
                self.online = true;
                if start {
                    self.start();
                }
            }
            SocketEvent::Unauthorized(_) => {
                warn!("[{}:{}] socket not authorized", self.username(), self.game_id);
            }
            SocketEvent::Lost => {
                self.lost = true;
            }
            SocketEvent::Offline => {
                self.online = false;
            }
            SocketEvent::Response(resp) if resp.resource == Some(Resource::Sync) => {
                self.session.on_sync(resp.valid, &resp.body).await;
            }
            SocketEvent::Response(resp) => self.on_response(resp).await,
        }
    }

    async fn on_signal(&mut self, signal: CompetitionSignal) {
        match signal {
            CompetitionSignal::TicketsComplete => self.on_ticket_complete(),
            CompetitionSignal::Jackpot(ready) => {
                debug!("[{}:{}] jackpot ready: {}", self.username(), self.game_id, ready);
            }
            CompetitionSignal::ModifyPlayer { player, odd_id } => {
                if let Some(p) = self.players.iter_mut().find(|p| p.name() == player) {
                    info!("[{}:{}] {} odd id {}", self.session.username(), self.game_id, player, odd_id);
                    p.set_odd_id(odd_id);
                }
            }
            CompetitionSignal::Exit => {
                debug!("[{}:{}] closing", self.username(), self.game_id);
                self.outbox.close();
            }
        }
    }

    fn start(&mut self) {
        if self.lost {
            self.lost = false;
            self.restoring = true;
        }
        self.pending.clear();
        self.next_block_event();
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    fn base_query(&self, n: i64, scheduled: bool) -> Map<String, Value> {
        let settings = self.session.settings();
        let mut query = Map::new();
        query.insert("contentType".into(), json!("PLAYLIST"));
        query.insert("contentId".into(), json!(self.game_id));
        if scheduled && self.playlist.is_scheduled() {
            query.insert("countDown".into(), json!(self.playlist.countdown));
            query.insert("offset".into(), json!(self.playlist.offset));
        } else {
            query.insert("countDown".into(), Value::Null);
            query.insert("offset".into(), Value::Null);
        }
        query.insert("n".into(), json!(n));
        query.insert("profile".into(), json!(PROFILE));
        query.insert("oddSettingId".into(), settings.odd_settings_id);
        query.insert("unitId".into(), json!(settings.unit_id));
        query
    }

    fn payload(&self, request: Request) -> (Resource, Payload) {
        let scheduled = self.playlist.is_scheduled();
        match request {
            Request::Events { n } => {
                let mut query = self.base_query(n, true);
                let event_time = scheduled.then(|| (now_seconds() + self.playlist.offset) as i64);
                query.insert("eventTime".into(), json!(event_time));
                (Resource::Events, Payload::Query(Value::Object(query)))
            }
            Request::Results { e_block_id, n, .. } => {
                let mut query = self.base_query(n, true);
                if scheduled {
                    query.insert("eventTime".into(), json!(self.event_time as i64));
                } else {
                    query.insert("eBlockId".into(), json!(e_block_id));
                    query.insert("eventTime".into(), Value::Null);
                }
                (Resource::Results, Payload::Query(Value::Object(query)))
            }
            Request::History { e_block_id, n, .. } => {
                let mut query = self.base_query(n, false);
                query.insert("eBlockId".into(), json!(e_block_id));
                (Resource::History, Payload::Query(Value::Object(query)))
            }
        }
    }

    fn request(&mut self, request: Request) {
        let (resource, payload) = self.payload(request);
        match self.outbox.send(resource, payload) {
            Some(xs) => {
                self.pending.insert(xs, request);
            }
            None => warn!(
                "[{}:{}] socket down, dropped {:?}",
                self.username(),
                self.game_id,
                request
            ),
        }
    }

    /// Issue `request` after `delay` without blocking the task.
    fn schedule(&self, delay: Duration, request: Request) {
        let wake = self.wake.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = wake.send(request);
        });
    }

    fn next_block_event(&mut self) {
        self.request(Request::Events { n: 1 });
    }

    /// Ask for the current block's results once it has been played.
    fn next_block_result(&mut self) {
        let request = Request::Results {
            e_block_id: self.e_block_id,
            n: 1,
            retry_count: 0,
        };
        let wait = self.event_time - now_seconds();
        if wait > 0.0 {
            self.schedule(Duration::from_secs_f64(wait), request);
        } else {
            self.request(request);
        }
    }

    fn next_history(&mut self, e_block_id: Option<u64>, n: i64) {
        self.request(Request::History {
            e_block_id,
            n,
            retry_count: 0,
            future: n > 0,
        });
    }

    /// Walk the rest of the league's blocks alongside the round. Never
    /// gates a phase.
    fn cache_future(&mut self) {
        if self.cached
            || self.caching_future
            || self.future_stalled
            || self.auto_skip
            || self.state.is_blocks_complete()
        {
            return;
        }
        self.caching_future = true;
        debug!(
            "[{}:{}] Caching league {:?}",
            self.username(),
            self.game_id,
            self.state.league
        );
        let from = self.state.blocks.keys().max().copied().or(self.e_block_id);
        self.next_history(from, HISTORY_BLOCKS);
    }

    fn process_event_time(&mut self, event_time: Option<&Value>) {
        self.event_time = event_time.and_then(epoch_seconds).unwrap_or_else(now_seconds);
    }

    // ── Responses ────────────────────────────────────────────────────────────

    async fn on_response(&mut self, resp: Response) {
        let Some(request) = resp.xs.and_then(|xs| self.pending.remove(&xs)) else {
            debug!(
                "[{}:{}] unexpected response {:?} {:?}",
                self.username(),
                self.game_id,
                resp.xs,
                resp.resource
            );
            return;
        };
        match request {
            Request::Events { n } => self.events_callback(n, resp.valid, &resp.body).await,
            Request::Results {
                e_block_id,
                n,
                retry_count,
            } => {
                self.results_callback(e_block_id, n, retry_count, resp.valid, &resp.body)
                    .await
            }
            Request::History {
                e_block_id,
                n,
                retry_count,
                future,
            } => {
                self.history_callback(e_block_id, n, retry_count, future, resp.valid, &resp.body)
                    .await
            }
        }
    }

    async fn events_callback(&mut self, n: i64, valid: bool, body: &Value) {
        let block = valid.then(|| first_block(body)).flatten();
        let Some(block) = block else {
            warn!(
                "[{}:{}] {}",
                self.username(),
                self.game_id,
                VbetError::InvalidEvents
            );
            self.schedule(EVENTS_RETRY_DELAY, Request::Events { n });
            return;
        };
        if self.restoring {
            self.resume(block).await;
        } else {
            self.process_events(block).await;
        }
    }

    async fn results_callback(
        &mut self,
        e_block_id: Option<u64>,
        n: i64,
        retry_count: u32,
        valid: bool,
        body: &Value,
    ) {
        let parsed = valid
            .then(|| first_block(body))
            .flatten()
            .and_then(|block| {
                let week = self.week_of_block(&block)?;
                let results = self.parse_results(&block)?;
                Some((block.e_block_id, week, results))
            });
        match parsed {
            Some((block_id, week, (results, ids, winning))) => {
                self.process_results(block_id, week, results, ids, winning)
                    .await
            }
            None => {
                let err = VbetError::InvalidResults {
                    e_block_id,
                    n,
                    retry_count,
                };
                warn!(
                    "[{}:{}] {} League: {:?}",
                    self.username(),
                    self.game_id,
                    err,
                    self.state.league
                );
                if retry_count >= MAX_RETRY_COUNT {
                    self.auto_skip = true;
                    self.next_block_event();
                } else {
                    self.schedule(
                        RESULTS_RETRY_DELAY,
                        Request::Results {
                            e_block_id,
                            n,
                            retry_count: retry_count + 1,
                        },
                    );
                }
            }
        }
    }

    async fn history_callback(
        &mut self,
        e_block_id: Option<u64>,
        n: i64,
        retry_count: u32,
        future: bool,
        valid: bool,
        body: &Value,
    ) {
        if !future {
            self.history_count += 1;
            if self.history_count > MAX_HISTORY_COUNT {
                warn!(
                    "[{}:{}] history exhausted, skipping league {:?}",
                    self.username(),
                    self.game_id,
                    self.state.league
                );
                self.caching = false;
                self.auto_skip = true;
                self.next_block_event();
                return;
            }
        }
        let blocks: Option<Vec<EventBlock>> = valid.then(|| body.as_array()).flatten().map(|list| {
            list.iter()
                .filter_map(|b| serde_json::from_value(b.clone()).ok())
                .collect()
        });
        match blocks {
            Some(blocks) => self.process_history(blocks, future).await,
            None => {
                let err = VbetError::InvalidHistory {
                    e_block_id,
                    n,
                    retry_count,
                };
                warn!(
                    "[{}:{}] {} League: {:?}",
                    self.username(),
                    self.game_id,
                    err,
                    self.state.league
                );
                if retry_count < MAX_RETRY_COUNT {
                    self.schedule(
                        RESULTS_RETRY_DELAY,
                        Request::History {
                            e_block_id,
                            n,
                            retry_count: retry_count + 1,
                            future,
                        },
                    );
                } else if future {
                    self.caching_future = false;
                    self.future_stalled = true;
                } else {
                    self.caching = false;
                    self.auto_skip = true;
                    self.next_block_event();
                }
            }
        }
    }

    // ── Processing ───────────────────────────────────────────────────────────

    async fn process_events(&mut self, block: EventBlock) {
        let league = block.data.league_id;
        let week = block.data.match_day;
        self.e_block_id = Some(block.e_block_id);
        if self.state.league != Some(league) {
            if week == 1 {
                self.auto_skip = false;
            }
            self.state.games.clear();
            self.state.blocks.clear();
            self.cached = false;
            self.caching_future = false;
            self.future_stalled = false;
            self.pending
                .retain(|_, r| !matches!(r, Request::History { future: true, .. }));
        }
        self.state.league = Some(league);
        self.state.week = week;
        debug!(
            "[{}:{}] Event Block: {} League: {} Week: {}",
            self.username(),
            self.game_id,
            block.e_block_id,
            league,
            week
        );
        self.process_event_time(block.event_time.as_ref());

        let mut stats = HashMap::new();
        let mut games = WeekGames::new();
        for (index, event) in block.events.iter().enumerate() {
            if let Some(s) = &event.data.stats {
                stats.insert(event.event_id, s.clone());
            }
            for participant in &event.data.participants {
                if let (Some(id), Some(code)) = (participant_id(participant), participant_code(participant)) {
                    self.team_labels.entry(id).or_insert(code);
                }
            }
            if let Some(f) = fixture(index, &event.data) {
                games.insert(event.event_id, f);
            }
        }
        self.state.blocks.insert(block.e_block_id, week);
        self.state.games.insert(week, games);

        if self.auto_skip {
            self.phase = Phase::Results;
            debug!("[{}:{}] Auto skipping league {}", self.username(), self.game_id, league);
            self.next_block_result();
            return;
        }

        self.state.table.on_event(league, week);
        self.state.table.feed_stats(week, stats);
        let missing = self.state.table.get_missing_weeks();
        if missing.is_empty() {
            self.dispatch_events().await;
            return;
        }
        let blocks: Option<Vec<u64>> = missing.iter().map(|w| self.state.block_of_week(*w)).collect();
        match blocks {
            Some(blocks) if self.cached => {
                self.caching_multiple = true;
                for block in blocks {
                    self.request(Request::Results {
                        e_block_id: Some(block),
                        n: 1,
                        retry_count: 0,
                    });
                }
            }
            _ => {
                self.caching = true;
                self.history_count = 0;
                let from = self.state.table.get_min_block().or(self.e_block_id);
                self.next_history(from, -HISTORY_BLOCKS);
            }
        }
    }

    fn week_of_block(&self, block: &EventBlock) -> Option<u32> {
        self.state
            .blocks
            .get(&block.e_block_id)
            .copied()
            .or_else(|| (block.data.match_day > 0).then_some(block.data.match_day))
    }

    /// Results of a block. `None` unless every event carries a readable score.
    fn parse_results(&self, block: &EventBlock) -> Option<(WeekResults, WeekResultIds, WeekWinningIds)> {
        let week = self.week_of_block(block)?;
        let fixtures = self.state.games.get(&week);
        let mut results = WeekResults::new();
        let mut ids = WeekResultIds::new();
        let mut winning = WeekWinningIds::new();
        for event in &block.events {
            let result = event.result.as_ref()?;
            let score = markets::score_from_won(&result.won_markets)?;
            let labels = result.data.video_team_ids().and_then(|(home, away)| {
                Some((self.team_labels.get(&home)?.clone(), self.team_labels.get(&away)?.clone()))
            });
            let (home, away) = labels
                .or_else(|| {
                    fixtures
                        .and_then(|f| f.get(&event.event_id))
                        .map(|f| (f.home.clone(), f.away.clone()))
                })
                .or_else(|| event.data.teams())?;
            results.insert(
                event.event_id,
                MatchResult {
                    event_id: event.event_id,
                    home,
                    away,
                    score,
                },
            );
            ids.insert(event.event_id, won_ids(result));
            winning.insert(event.event_id, handicap(result));
        }
        Some((results, ids, winning))
    }

    async fn process_results(
        &mut self,
        e_block_id: u64,
        week: u32,
        results: WeekResults,
        ids: WeekResultIds,
        winning: WeekWinningIds,
    ) {
        debug!(
            "[{}:{}] Result Block: {} Week: {}",
            self.username(),
            self.game_id,
            e_block_id,
            week
        );
        if self.auto_skip {
            self.phase = Phase::Events;
            self.next_block_event();
            return;
        }
        let Some(league) = self.state.league else {
            return;
        };
        self.state
            .table
            .feed_result(e_block_id, league, week, results, ids, winning);

        if self.caching_multiple {
            if self.state.table.get_missing_weeks().is_empty() {
                self.caching_multiple = false;
                self.dispatch_events().await;
            }
            return;
        }

        let view = self.state.view(self.game_id, self.session.username());
        for player in &mut self.players {
            player.on_result(&view);
        }
        self.validate_tickets().await;
        if self.state.week == self.state.max_week {
            self.on_league_completed().await;
        }
        if Some(e_block_id) == self.e_block_id {
            self.phase = Phase::Events;
            self.next_block_event();
            self.cache_future();
        }
    }

    async fn process_history(&mut self, blocks: Vec<EventBlock>, future: bool) {
        let known = self.state.blocks.len();
        for block in blocks {
            let league = block.data.league_id;
            if Some(league) != self.state.league {
                continue;
            }
            let week = block.data.match_day;
            debug!(
                "[{}:{}] History Block: {} League: {} Week: {}",
                self.username(),
                self.game_id,
                block.e_block_id,
                league,
                week
            );
            self.state.blocks.insert(block.e_block_id, week);

            let mut games = WeekGames::new();
            let mut results = WeekResults::new();
            let mut ids = WeekResultIds::new();
            let mut winning = WeekWinningIds::new();
            for (index, event) in block.events.iter().enumerate() {
                let Some(f) = fixture(index, &event.data) else {
                    continue;
                };
                if !future {
                    if let Some(result) = &event.result {
                        if let Some(score) = markets::score_from_won(&result.won_markets) {
                            results.insert(
                                event.event_id,
                                MatchResult {
                                    event_id: event.event_id,
                                    home: f.home.clone(),
                                    away: f.away.clone(),
                                    score,
                                },
                            );
                            ids.insert(event.event_id, won_ids(result));
                            winning.insert(event.event_id, handicap(result));
                        }
                    }
                }
                games.insert(event.event_id, f);
            }
            self.state.games.insert(week, games);
            if !future && !results.is_empty() {
                self.state
                    .table
                    .feed_result(block.e_block_id, league, week, results, ids, winning);
            }
        }

        if future {
            if self.state.is_blocks_complete() {
                self.caching_future = false;
                self.on_league_cached();
            } else if self.state.blocks.len() == known {
                warn!(
                    "[{}:{}] league {:?} partly cached [{}/{}]",
                    self.username(),
                    self.game_id,
                    self.state.league,
                    known,
                    self.state.max_week
                );
                self.caching_future = false;
                self.future_stalled = true;
            } else {
                let from = self.state.blocks.keys().max().copied();
                self.next_history(from, HISTORY_BLOCKS);
            }
        } else if self.caching {
            if self.state.table.get_missing_weeks().is_empty() {
                self.caching = false;
                debug!(
                    "[{}:{}] History completed {:?}",
                    self.username(),
                    self.game_id,
                    self.state.league
                );
                self.dispatch_events().await;
            } else {
                let from = self.state.table.get_min_block().or(self.e_block_id);
                self.next_history(from, -HISTORY_BLOCKS);
            }
        }
    }

    async fn resume(&mut self, block: EventBlock) {
        self.restoring = false;
        if Some(block.e_block_id) == self.e_block_id {
            debug!("[{}:{}] Competition resume success", self.username(), self.game_id);
            if !self.session.is_demo()
                && !self.active_tickets.is_empty()
                && self.tickets.resume_competition_tickets(self.game_id)
            {
                info!("[{}:{}] resuming tickets", self.username(), self.game_id);
            } else {
                self.next_block_result();
            }
        } else {
            debug!("[{}:{}] Competition resume failed", self.username(), self.game_id);
            self.tickets.reset_competition_tickets(self.game_id);
            self.active_tickets.clear();
            self.process_events(block).await;
        }
    }

    /// Tell the players once every block of the league is known.
    fn on_league_cached(&mut self) {
        if self.cached || !self.state.is_blocks_complete() {
            return;
        }
        self.cached = true;
        debug!(
            "[{}:{}] All events cached {:?}",
            self.username(),
            self.game_id,
            self.state.league
        );
        let view = self.state.view(self.game_id, self.session.username());
        for player in &mut self.players {
            player.on_league_cached(&view);
        }
    }

    /// Collect the players' tickets for the current block.
    async fn dispatch_events(&mut self) {
        self.on_league_cached();
        self.history_count = 0;
        let view = self.state.view(self.game_id, self.session.username());
        let mut pool = Vec::new();
        for player in &mut self.players {
            pool.extend(player.on_event(&view));
        }
        if pool.is_empty() {
            self.phase = Phase::Results;
            debug!("[{}:{}] No Tickets available", self.username(), self.game_id);
            self.next_block_result();
        } else {
            self.phase = Phase::Tickets;
            debug!(
                "[{}:{}] Processing tickets : {}",
                self.username(),
                self.game_id,
                pool.len()
            );
            self.active_tickets = self.tickets.add_tickets(self.game_id, pool).await;
        }
    }

    fn on_ticket_complete(&mut self) {
        if self.phase != Phase::Tickets {
            return;
        }
        debug!(
            "[{}:{}] Tickets completed : {}",
            self.username(),
            self.game_id,
            self.active_tickets.len()
        );
        self.phase = Phase::Results;
        self.next_block_result();
    }

    async fn validate_tickets(&mut self) {
        let resolved = self
            .tickets
            .validate_competition_tickets(
                self.game_id,
                self.state.table.results_ids_pool(),
                self.state.table.winning_ids_pool(),
            )
            .await;
        for ticket in resolved {
            if let Some(player) = self.players.iter_mut().find(|p| p.name() == ticket.player) {
                player.on_ticket(&ticket).await;
            }
        }
    }

    /// Archive a fully played league.
    async fn on_league_completed(&self) {
        let Some(league) = self.state.league else {
            return;
        };
        if !self.state.table.is_complete() {
            return;
        }
        let mut data = Map::new();
        for (week, games) in &self.state.games {
            let results = self.state.table.get_week_results(*week);
            let stats = self.state.table.get_week_stats(*week);
            let mut week_info = Map::new();
            for (event_id, f) in games {
                let score = results
                    .and_then(|r| r.get(event_id))
                    .map(|r| json!([r.score.0, r.score.1]));
                week_info.insert(
                    event_id.to_string(),
                    json!({
                        "team_a": f.home,
                        "team_b": f.away,
                        "stats": stats.and_then(|s| s.get(event_id)),
                        "odds": f.odds,
                        "score": score,
                    }),
                );
            }
            data.insert(week.to_string(), Value::Object(week_info));
        }
        let weeks = data.len();
        let body = json!({
            "username": self.username(),
            "league": league,
            "game_id": self.game_id,
            "data": data,
        });
        let store = self.session.store();
        let path = store.league_path(self.game_id, self.username(), league);
        match store.write(&path, &body).await {
            Ok(()) => debug!(
                "[{}:{}] uploaded data League: [{}:{}]",
                self.username(),
                self.game_id,
                league,
                weeks
            ),
            Err(e) => error!(
                "[{}:{}] failed to archive league {}: {:#}",
                self.username(),
                self.game_id,
                league,
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::accounts::AccountManager;
    use crate::game::players;
    use crate::game::tickets::TicketSettings;
    use crate::store::Store;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    const GAME: u32 = 14036;
    const LEAGUE: u32 = 7;

    static ROOT: AtomicU64 = AtomicU64::new(0);

    #[derive(Default)]
    struct Recorder {
        xs: AtomicU64,
        sent: Mutex<Vec<(u64, Resource, Value)>>,
        closed: AtomicBool,
    }

    impl Recorder {
        fn last(&self) -> (u64, Resource, Value) {
            self.sent.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Outbox for Recorder {
        fn send(&self, resource: Resource, payload: Payload) -> Option<u64> {
            let xs = self.xs.fetch_add(1, Ordering::SeqCst);
            let query = match payload {
                Payload::Query(q) | Payload::Body(q) => q,
            };
            self.sent.lock().unwrap().push((xs, resource, query));
            Some(xs)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn competition(demo: bool, player: Option<&str>, max_week: u32) -> (Competition, Arc<Recorder>) {
        let root = std::env::temp_dir().join(format!(
            "vbet-competition-{}-{}",
            std::process::id(),
            ROOT.fetch_add(1, Ordering::SeqCst)
        ));
        let store = Store::open_in_memory(&root).unwrap();
        let accounts = Arc::new(AccountManager::new(demo, 1000.0));
        let session = Arc::new(Session::new("test", demo, false, vec![GAME], accounts.clone(), store));
        let tickets = Arc::new(TicketManager::new(session.clone(), TicketSettings::default()));
        let players = player
            .into_iter()
            .filter_map(|name| players::create(name, accounts.clone(), max_week))
            .collect();
        let recorder = Arc::new(Recorder::default());
        let mut c = Competition::new(GAME, session, tickets, players, recorder.clone());
        c.state = LeagueState::new(max_week);
        (c, recorder)
    }

    fn reply(xs: u64, body: Value) -> Response {
        Response {
            xs: Some(xs),
            resource: None,
            status_code: Some(200),
            valid: true,
            body,
        }
    }

    /// A block with one BAR v RMA fixture. `score` adds a 1-0 result.
    fn block(e_block_id: u64, league: u32, week: u32, event_id: u64, score: bool) -> Value {
        let mut event = json!({
            "eventId": event_id,
            "data": {
                "participants": [{"id": 11, "fifaCode": "BAR"}, {"id": 12, "fifaCode": "RMA"}],
                "oddValues": vec!["1.50"; 212],
                "stats": {"teamToTeam": {"lastResult": []}}
            }
        });
        if score {
            event["result"] = json!({
                "wonMarkets": ["0", "22", "51"],
                "data": {"videoURL": "https://cdn/v/11/12/replay.mp4"}
            });
        }
        json!({
            "eBlockId": e_block_id,
            "data": {"leagueId": league, "matchDay": week},
            "events": [event]
        })
    }

    async fn online(c: &mut Competition) {
        c.on_socket_event(SocketEvent::Online(json!({}))).await;
    }

    #[tokio::test]
    async fn full_round_without_backfill() {
        let (mut c, out) = competition(true, Some("puig"), 2);
        online(&mut c).await;
        let (xs, resource, query) = out.last();
        assert_eq!(resource, Resource::Events);
        assert_eq!(query["contentId"], GAME);
        assert_eq!(query["n"], 1);

        // week 1: nothing missing, tickets go out straight away
        c.on_response(reply(xs, json!([block(100, LEAGUE, 1, 1, false)]))).await;
        assert_eq!(out.count(), 1);
        assert!(!c.caching_future);
        assert!(!c.cached);
        assert_eq!(c.phase(), Phase::Tickets);
        assert_eq!(c.tickets.competition_tickets(GAME).len(), 1);

        c.on_signal(CompetitionSignal::TicketsComplete).await;
        assert_eq!(c.phase(), Phase::Results);
        let (xs, resource, query) = out.last();
        assert_eq!(out.count(), 2);
        assert_eq!(resource, Resource::Results);
        assert_eq!(query["eBlockId"], 100);

        // results: next events, and the rest of the league cached alongside
        c.on_response(reply(xs, json!([block(100, LEAGUE, 1, 1, true)]))).await;
        assert!(c.state.table.has_week(1));
        assert_eq!(c.state.table.get_league_table()[0].team, "BAR");
        assert_eq!(c.phase(), Phase::Events);
        let sent = out.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2].1, Resource::Events);
        let (xs, resource, query) = sent[3].clone();
        assert_eq!(resource, Resource::History);
        assert_eq!(query["n"], HISTORY_BLOCKS);
        assert_eq!(query["eBlockId"], 100);
        assert!(c.caching_future);

        c.on_response(reply(
            xs,
            json!([block(101, LEAGUE, 2, 2, false), block(900, LEAGUE + 1, 1, 3, false)]),
        ))
        .await;
        assert!(c.cached);
        assert!(!c.caching_future);
        assert_eq!(c.phase(), Phase::Events);
        assert_eq!(out.count(), 4);
    }

    #[tokio::test]
    async fn future_caching_stalls_without_blocking_the_round() {
        let (mut c, out) = competition(true, None, 38);
        online(&mut c).await;
        let (xs, ..) = out.last();
        c.on_response(reply(xs, json!([block(100, LEAGUE, 1, 1, false)]))).await;
        let (xs, resource, _) = out.last();
        assert_eq!(resource, Resource::Results);
        c.on_response(reply(xs, json!([block(100, LEAGUE, 1, 1, true)]))).await;
        let (xs, resource, _) = out.last();
        assert_eq!(resource, Resource::History);

        // a page with nothing new: give up on this league
        c.on_response(reply(xs, json!([block(100, LEAGUE, 1, 1, false)]))).await;
        assert!(c.future_stalled);
        assert!(!c.caching_future);
        assert!(!c.cached);
        let count = out.count();

        // week 2 dispatches and fetches results, no more history
        let (xs, ..) = out.sent.lock().unwrap()[2].clone();
        c.on_response(reply(xs, json!([block(101, LEAGUE, 2, 2, false)]))).await;
        assert_eq!(c.phase(), Phase::Results);
        assert_eq!(out.count(), count + 1);
        assert_eq!(out.last().1, Resource::Results);
    }

    #[tokio::test]
    async fn new_league_drops_pending_future_pages() {
        let (mut c, out) = competition(true, None, 38);
        c.e_block_id = Some(100);
        c.state.league = Some(LEAGUE);
        c.state.blocks.insert(100, 1);
        c.cache_future();
        let (xs, resource, _) = out.last();
        assert_eq!(resource, Resource::History);
        assert!(c.pending.contains_key(&xs));

        c.next_block_event();
        let (events_xs, ..) = out.last();
        c.on_response(reply(events_xs, json!([block(500, LEAGUE + 1, 1, 1, false)])))
            .await;
        assert!(!c.pending.contains_key(&xs));
        assert!(!c.caching_future);
    }

    #[tokio::test]
    async fn missing_weeks_are_backfilled_from_history() {
        let (mut c, out) = competition(true, None, 3);
        online(&mut c).await;
        let (xs, ..) = out.last();
        c.on_response(reply(xs, json!([block(102, LEAGUE, 3, 3, false)]))).await;
        let (xs, resource, query) = out.last();
        assert!(c.caching);
        assert_eq!(resource, Resource::History);
        assert_eq!(query["n"], -HISTORY_BLOCKS);
        assert_eq!(query["eBlockId"], 102);

        c.on_response(reply(
            xs,
            json!([block(100, LEAGUE, 1, 1, true), block(101, LEAGUE, 2, 2, true)]),
        ))
        .await;
        assert!(!c.caching);
        assert!(c.state.table.get_missing_weeks().is_empty());
        // blocks 100..=102 cover the league, so no players means straight to results
        assert!(c.cached);
        assert_eq!(c.phase(), Phase::Results);
        let (_, resource, query) = out.last();
        assert_eq!(resource, Resource::Results);
        assert_eq!(query["eBlockId"], 102);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_results_retry_then_skip() {
        let (mut c, out) = competition(true, None, 38);
        c.e_block_id = Some(100);
        c.next_block_result();
        let (xs, ..) = out.last();

        c.on_response(Response {
            valid: false,
            ..reply(xs, Value::Null)
        })
        .await;
        let mut wake = c.wake_rx.take().unwrap();
        let retry = wake.recv().await.unwrap();
        assert_eq!(
            retry,
            Request::Results {
                e_block_id: Some(100),
                n: 1,
                retry_count: 1
            }
        );

        c.results_callback(Some(100), 1, MAX_RETRY_COUNT - 1, false, &Value::Null)
            .await;
        assert!(!c.auto_skip);
        c.results_callback(Some(100), 1, MAX_RETRY_COUNT, false, &Value::Null)
            .await;
        assert!(c.auto_skip);
        assert_eq!(out.last().1, Resource::Events);

        // skipping: events go straight to results, results straight to events
        let (xs, ..) = out.last();
        c.on_response(reply(xs, json!([block(101, LEAGUE, 5, 1, false)]))).await;
        assert_eq!(c.phase(), Phase::Results);
        let (xs, resource, _) = out.last();
        assert_eq!(resource, Resource::Results);
        c.on_response(reply(xs, json!([block(101, LEAGUE, 5, 1, true)]))).await;
        assert_eq!(c.phase(), Phase::Events);
        assert!(!c.state.table.has_week(5));
    }

    #[tokio::test]
    async fn history_guard_turns_on_auto_skip() {
        let (mut c, out) = competition(true, None, 38);
        c.history_count = MAX_HISTORY_COUNT;
        c.history_callback(Some(1), -HISTORY_BLOCKS, 0, false, true, &json!([]))
            .await;
        assert!(c.auto_skip);
        assert_eq!(out.last().1, Resource::Events);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_future_history_stalls_after_retries() {
        let (mut c, out) = competition(true, None, 38);
        c.caching_future = true;
        c.history_count = MAX_HISTORY_COUNT;
        c.history_callback(Some(100), HISTORY_BLOCKS, MAX_RETRY_COUNT, true, false, &Value::Null)
            .await;
        assert!(c.future_stalled);
        assert!(!c.caching_future);
        assert!(!c.auto_skip);
        assert_eq!(out.count(), 0);
    }

    #[tokio::test]
    async fn resume_on_other_block_voids_tickets_and_starts_over() {
        let (mut c, out) = competition(false, None, 2);
        c.e_block_id = Some(100);
        c.online = true;
        let keys = c
            .tickets
            .add_tickets(GAME, vec![crate::game::ticket::Ticket::new(GAME, "puig")])
            .await;
        c.active_tickets = keys;

        c.on_socket_event(SocketEvent::Lost).await;
        online(&mut c).await;
        assert!(c.restoring);
        let (xs, ..) = out.last();
        c.on_response(reply(xs, json!([block(105, LEAGUE, 1, 1, false)]))).await;
        assert!(!c.restoring);
        assert!(c.active_tickets.is_empty());
        assert!(c.tickets.competition_tickets(GAME).is_empty());
        assert_eq!(c.e_block_id, Some(105));
    }

    #[tokio::test]
    async fn resume_on_same_block_fetches_results() {
        let (mut c, out) = competition(true, None, 2);
        c.e_block_id = Some(100);
        c.online = true;
        c.lost = true;
        online(&mut c).await;
        let (xs, ..) = out.last();
        c.on_response(reply(xs, json!([block(100, LEAGUE, 1, 1, false)]))).await;
        let (_, resource, query) = out.last();
        assert_eq!(resource, Resource::Results);
        assert_eq!(query["eBlockId"], 100);
    }

    #[tokio::test]
    async fn signals_reach_players_and_socket() {
        let (mut c, out) = competition(true, Some("puig"), 38);
        c.on_signal(CompetitionSignal::Jackpot(true)).await;
        assert_eq!(out.count(), 0);
        c.on_signal(CompetitionSignal::ModifyPlayer {
            player: "puig".into(),
            odd_id: 2,
        })
        .await;
        c.on_signal(CompetitionSignal::Exit).await;
        assert!(out.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn event_time_accepts_seconds_and_millis() {
        assert_eq!(epoch_seconds(&json!(1_700_000_000)), Some(1_700_000_000.0));
        assert_eq!(epoch_seconds(&json!("1700000000500")), Some(1_700_000_000.5));
        assert_eq!(epoch_seconds(&json!({})), None);
        assert_eq!(max_week(41047), 34);
        assert_eq!(max_week(14036), 38);
    }
}
