use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

/// One finished match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub event_id: u64,
    pub home: String,
    pub away: String,
    pub score: (u8, u8),
}

/// Partial-settlement markets of one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Handicap {
    pub half_lost: Vec<String>,
    pub half_won: Vec<String>,
    pub refund: Vec<String>,
}

/// event id -> match result
pub type WeekResults = BTreeMap<u64, MatchResult>;
/// event id -> won odd ids
pub type WeekResultIds = HashMap<u64, Vec<u32>>;
/// event id -> partial settlements
pub type WeekWinningIds = HashMap<u64, Handicap>;

/// A team's result in one week.
#[derive(Debug, Clone, PartialEq)]
pub struct WeekRow {
    pub points: u32,
    pub goals_for: u32,
    pub goals_against: u32,
    pub opponent: String,
    pub away: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Standing {
    pub team: String,
    pub pos: usize,
    pub points: u32,
    pub goals_for: u32,
    pub goals_against: u32,
    pub goal_difference: i32,
    /// Points per known week, oldest first.
    pub streak: Vec<u32>,
}

/// Standings of the league currently running in one competition.
#[derive(Debug, Clone)]
pub struct LeagueTable {
    league: Option<u32>,
    week: u32,
    max_week: u32,
    results_pool: BTreeMap<u32, WeekResults>,
    results_ids_pool: HashMap<u32, WeekResultIds>,
    winning_ids_pool: HashMap<u32, WeekWinningIds>,
    raw_table: HashMap<String, BTreeMap<u32, WeekRow>>,
    team_order: Vec<String>,
    standings: Vec<Standing>,
    event_block_map: BTreeMap<u32, u64>,
    league_stats: HashMap<u32, HashMap<u64, Value>>,
}

impl LeagueTable {
    pub fn new(max_week: u32) -> Self {
        LeagueTable {
            league: None,
            week: 1,
            max_week,
            results_pool: BTreeMap::new(),
            results_ids_pool: HashMap::new(),
            winning_ids_pool: HashMap::new(),
            raw_table: HashMap::new(),
            team_order: Vec::new(),
            standings: Vec::new(),
            event_block_map: BTreeMap::new(),
            league_stats: HashMap::new(),
        }
    }

    pub fn league(&self) -> Option<u32> {
        self.league
    }

    pub fn week(&self) -> u32 {
        self.week
    }

    pub fn max_week(&self) -> u32 {
        self.max_week
    }

    /// Track the block currently on offer. A new league wipes the table.
    pub fn on_event(&mut self, league: u32, week: u32) {
        if self.league != Some(league) {
            self.clear_table();
            self.league = Some(league);
        }
        self.week = week;
    }

    pub fn is_empty(&self) -> bool {
        self.event_block_map.is_empty()
    }

    /// Record one week's results. Results for any other league than the
    /// tracked one are stale and dropped.
    pub fn feed_result(
        &mut self,
        e_block_id: u64,
        league: u32,
        week: u32,
        results: WeekResults,
        results_ids: WeekResultIds,
        winning_ids: WeekWinningIds,
    ) {
        if self.league != Some(league) {
            return;
        }
        self.event_block_map.insert(week, e_block_id);
        self.parse_week(week, &results);
        self.results_pool.insert(week, results);
        self.results_ids_pool.insert(week, results_ids);
        self.winning_ids_pool.insert(week, winning_ids);
        self.rebuild();
    }

    pub fn feed_stats(&mut self, week: u32, stats: HashMap<u64, Value>) {
        self.league_stats.insert(week, stats);
    }

    fn parse_week(&mut self, week: u32, results: &WeekResults) {
        for result in results.values() {
            let (home, away) = (result.score.0 as u32, result.score.1 as u32);
            let (home_points, away_points) = match home.cmp(&away) {
                std::cmp::Ordering::Greater => (3, 0),
                std::cmp::Ordering::Less => (0, 3),
                std::cmp::Ordering::Equal => (1, 1),
            };
            self.row(&result.home).insert(
                week,
                WeekRow {
                    points: home_points,
                    goals_for: home,
                    goals_against: away,
                    opponent: result.away.clone(),
                    away: false,
                },
            );
            self.row(&result.away).insert(
                week,
                WeekRow {
                    points: away_points,
                    goals_for: away,
                    goals_against: home,
                    opponent: result.home.clone(),
                    away: true,
                },
            );
        }
    }

    fn row(&mut self, team: &str) -> &mut BTreeMap<u32, WeekRow> {
        if !self.raw_table.contains_key(team) {
            self.team_order.push(team.to_string());
        }
        self.raw_table.entry(team.to_string()).or_default()
    }

    /// Recompute standings from every known week: points, then goal
    /// difference, then first appearance in the table.
    fn rebuild(&mut self) {
        let mut table: Vec<Standing> = self
            .team_order
            .iter()
            .filter_map(|team| {
                let weeks = self.raw_table.get(team)?;
                let mut standing = Standing {
                    team: team.clone(),
                    pos: 0,
                    points: 0,
                    goals_for: 0,
                    goals_against: 0,
                    goal_difference: 0,
                    streak: Vec::with_capacity(weeks.len()),
                };
                for row in weeks.values() {
                    standing.points += row.points;
                    standing.goals_for += row.goals_for;
                    standing.goals_against += row.goals_against;
                    standing.streak.push(row.points);
                }
                standing.goal_difference = standing.goals_for as i32 - standing.goals_against as i32;
                Some(standing)
            })
            .collect();

        table.sort_by(|a, b| {
            b.points
                .cmp(&a.points)
                .then(b.goal_difference.cmp(&a.goal_difference))
        });
        for (i, standing) in table.iter_mut().enumerate() {
            standing.pos = i + 1;
        }
        self.standings = table;
    }

    pub fn get_league_table(&self) -> &[Standing] {
        &self.standings
    }

    pub fn standing(&self, team: &str) -> Option<&Standing> {
        self.standings.iter().find(|s| s.team == team)
    }

    /// A team's rows, latest week first.
    pub fn get_last_matches(&self, team: &str) -> Vec<(u32, &WeekRow)> {
        self.raw_table
            .get(team)
            .map(|weeks| weeks.iter().rev().map(|(w, r)| (*w, r)).collect())
            .unwrap_or_default()
    }

    pub fn get_min_block(&self) -> Option<u64> {
        self.event_block_map.values().min().copied()
    }

    pub fn clear_table(&mut self) {
        self.results_pool.clear();
        self.results_ids_pool.clear();
        self.winning_ids_pool.clear();
        self.raw_table.clear();
        self.team_order.clear();
        self.standings.clear();
        self.event_block_map.clear();
        self.league_stats.clear();
    }

    /// Weeks before the current one that have no results yet.
    pub fn get_missing_weeks(&self) -> BTreeSet<u32> {
        (1..self.week)
            .filter(|w| !self.event_block_map.contains_key(w))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.event_block_map.len() == self.max_week as usize
    }

    pub fn has_week(&self, week: u32) -> bool {
        self.event_block_map.contains_key(&week)
    }

    pub fn get_week_results(&self, week: u32) -> Option<&WeekResults> {
        self.results_pool.get(&week)
    }

    pub fn get_week_stats(&self, week: u32) -> Option<&HashMap<u64, Value>> {
        self.league_stats.get(&week)
    }

    /// Subset of `weeks` whose results are not known yet.
    pub fn check_weeks(&self, weeks: &[u32]) -> Vec<u32> {
        weeks
            .iter()
            .copied()
            .filter(|w| !self.event_block_map.contains_key(w))
            .collect()
    }

    pub fn results_ids_pool(&self) -> &HashMap<u32, WeekResultIds> {
        &self.results_ids_pool
    }

    pub fn winning_ids_pool(&self) -> &HashMap<u32, WeekWinningIds> {
        &self.winning_ids_pool
    }
}
