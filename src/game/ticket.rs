use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::accounts::round2;
use super::table::{Handicap, WeekResultIds, WeekWinningIds};
use crate::remote::protocol::participant_code;

const LIMIT_MAX_PAYOUT: f64 = 200_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Ready,
    Waiting,
    Sent,
    Failed,
    Success,
    Void,
    ErrorCredit,
    Network,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bet {
    pub odd_id: u32,
    pub market_id: String,
    pub odd_value: f64,
    pub odd_name: String,
    pub stake: f64,
}

impl Bet {
    pub fn new(odd_id: u32, market_id: &str, odd_value: f64, odd_name: &str, stake: f64) -> Self {
        Bet {
            odd_id,
            market_id: market_id.to_string(),
            odd_value,
            odd_name: odd_name.to_string(),
            stake,
        }
    }
}

/// One match on a ticket.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: u64,
    pub league: u32,
    pub week: u32,
    pub participants: Vec<Value>,
    pub bets: Vec<Bet>,
    pub event_time: Option<Value>,
    pub ext_id: Option<Value>,
    pub event_ndx: Option<u32>,
    pub is_banker: bool,
}

impl Event {
    pub fn new(event_id: u64, league: u32, week: u32, participants: Vec<Value>) -> Self {
        Event {
            event_id,
            league,
            week,
            participants,
            bets: Vec::new(),
            event_time: None,
            ext_id: None,
            event_ndx: None,
            is_banker: false,
        }
    }

    pub fn add_bet(&mut self, bet: Bet) {
        self.bets.push(bet);
    }

    pub fn stake(&self) -> f64 {
        self.bets.iter().map(|b| b.stake).sum()
    }

    /// Fifa codes of the participants.
    pub fn teams(&self) -> Vec<String> {
        self.participants.iter().filter_map(participant_code).collect()
    }
}

/// Settlement data of one event: won odd ids plus partial settlements.
pub type EventSettlement = (Vec<u32>, Handicap);

#[derive(Debug, Clone)]
pub struct Ticket {
    pub key: Option<u64>,
    pub game_id: u32,
    pub player: String,
    pub events: Vec<Event>,
    pub min_winning: f64,
    pub max_winning: f64,
    pub total_won: f64,
    pub status: TicketStatus,
    pub grouping: u32,
    pub system_count: u32,
    pub winning_count: u32,
    pub xs: Option<u64>,
    pub socket_id: Option<u32>,
    pub sent_time: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub registered: bool,
}

impl Ticket {
    pub fn new(game_id: u32, player: &str) -> Self {
        Ticket {
            key: None,
            game_id,
            player: player.to_string(),
            events: Vec::new(),
            min_winning: 0.0,
            max_winning: 0.0,
            total_won: 0.0,
            status: TicketStatus::Ready,
            grouping: 0,
            system_count: 0,
            winning_count: 0,
            xs: None,
            socket_id: None,
            sent_time: None,
            resolved: false,
            registered: false,
        }
    }

    /// A one-event, one-bet ticket: the shape most strategies emit.
    pub fn single(game_id: u32, player: &str, mut event: Event, bet: Bet) -> Self {
        let win = round2(bet.stake * bet.odd_value);
        event.add_bet(bet);
        let mut ticket = Ticket::new(game_id, player);
        ticket.add_event(event);
        ticket.min_winning = win;
        ticket.max_winning = win;
        ticket.grouping = 1;
        ticket.winning_count = 1;
        ticket.system_count = 1;
        ticket
    }

    pub fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Sum of every bet's stake, to the cent.
    pub fn stake(&self) -> f64 {
        round2(self.events.iter().map(Event::stake).sum())
    }

    pub fn is_valid(&self) -> bool {
        !self.events.is_empty() && self.events.iter().all(|e| !e.bets.is_empty())
    }

    pub fn is_single(&self) -> bool {
        self.events.len() == 1
    }

    pub fn ticket_type(&self) -> &'static str {
        if self.is_single() {
            "SINGLE"
        } else {
            "MULTIPLE"
        }
    }

    pub fn sent_notify(&mut self, xs: u64, socket_id: u32) {
        self.xs = Some(xs);
        self.socket_id = Some(socket_id);
        self.sent_time = Some(Utc::now());
    }

    /// Collect the settlement data of every event, or `None` while any
    /// event's week has not been settled yet.
    pub fn can_resolve(
        &self,
        results: &HashMap<u32, WeekResultIds>,
        winning_ids: &HashMap<u32, WeekWinningIds>,
    ) -> Option<HashMap<u64, EventSettlement>> {
        let mut required = HashMap::new();
        for event in &self.events {
            let won = results.get(&event.week)?.get(&event.event_id)?;
            let handicap = winning_ids
                .get(&event.week)
                .and_then(|w| w.get(&event.event_id))
                .cloned()
                .unwrap_or_default();
            required.insert(event.event_id, (won.clone(), handicap));
        }
        Some(required)
    }

    /// Compute `total_won` from settlement data.
    pub fn resolve(&mut self, settlements: &HashMap<u64, EventSettlement>) -> f64 {
        if self.is_single() {
            let event = &self.events[0];
            if let Some((won, handicap)) = settlements.get(&event.event_id) {
                for bet in &event.bets {
                    let id = bet.odd_id.to_string();
                    if handicap.refund.contains(&id) {
                        self.total_won += bet.stake;
                    } else if handicap.half_lost.contains(&id) {
                        self.total_won += bet.stake / 2.0;
                    } else if handicap.half_won.contains(&id) {
                        self.total_won += round2(bet.stake / 2.0 * bet.odd_value);
                    } else if won.contains(&bet.odd_id) {
                        self.total_won += round2(bet.stake * bet.odd_value);
                    }
                }
            }
            return self.total_won;
        }

        let is_won = |event: &Event, bet: &Bet| {
            settlements
                .get(&event.event_id)
                .map(|(won, _)| won.contains(&bet.odd_id))
                .unwrap_or(false)
        };
        if self.grouping == 1 && self.winning_count >= 1 {
            for event in &self.events {
                for bet in &event.bets {
                    if is_won(event, bet) {
                        self.total_won += round2(bet.stake * bet.odd_value);
                    }
                }
            }
        } else if self.grouping > 1 && self.winning_count == 1 {
            let mut total_odd = 1.0;
            for event in &self.events {
                for bet in &event.bets {
                    if !is_won(event, bet) {
                        return self.total_won;
                    }
                    total_odd *= bet.odd_value;
                }
            }
            self.total_won = total_odd * self.stake();
        }
        self.total_won
    }

    /// The `details` section of a ticket send request.
    pub fn details(&self, playlist_id: u32) -> TicketDetails {
        let events = self
            .events
            .iter()
            .map(|event| TicketEventWire {
                event_id: event.event_id,
                game_type: GameTypeWire { val: "GL".into() },
                playlist_id,
                event_time: event.event_time.clone(),
                ext_id: event.ext_id.clone(),
                is_banker: event.is_banker,
                final_outcome: Vec::new(),
                bets: event
                    .bets
                    .iter()
                    .map(|bet| BetWire {
                        market_id: bet.market_id.clone(),
                        odd_id: bet.odd_id,
                        odd_name: bet.odd_name.clone(),
                        odd_value: bet.odd_value,
                        status: "OPEN".into(),
                        profit_type: "NONE".into(),
                        stake: bet.stake,
                    })
                    .collect(),
                data: EventDataWire {
                    class_type: "FootballTicketEventData".into(),
                    participants: event.participants.clone(),
                    league_id: event.league,
                    match_day: event.week,
                    event_ndx: event.event_ndx,
                },
            })
            .collect();

        TicketDetails {
            events,
            system_bets: vec![SystemBetWire {
                grouping: self.grouping,
                system_count: self.system_count,
                stake: self.stake(),
                winning_data: WinningDataWire {
                    limit_max_payout: LIMIT_MAX_PAYOUT,
                    min_winning: self.min_winning,
                    max_winning: self.max_winning,
                    min_bonus: 0.0,
                    max_bonus: 0.0,
                    winning_count: self.winning_count,
                },
            }],
            ticket_type: self.ticket_type().to_string(),
        }
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ticket : {} State : {:?} Stake : {}",
            self.ticket_type(),
            self.status,
            self.stake()
        )?;
        for event in &self.events {
            write!(f, "\n  Event Id : {} {:?}", event.event_id, event.teams())?;
            for bet in &event.bets {
                write!(
                    f,
                    "\n    OddId: {} MarketId: {} OddName: {} OddValue: {} Stake {}",
                    bet.odd_id, bet.market_id, bet.odd_name, bet.odd_value, bet.stake
                )?;
            }
        }
        Ok(())
    }
}

// ── Wire format ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketDetails {
    pub events: Vec<TicketEventWire>,
    pub system_bets: Vec<SystemBetWire>,
    pub ticket_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketEventWire {
    pub event_id: u64,
    pub game_type: GameTypeWire,
    pub playlist_id: u32,
    pub event_time: Option<Value>,
    pub ext_id: Option<Value>,
    pub is_banker: bool,
    pub final_outcome: Vec<Value>,
    pub bets: Vec<BetWire>,
    pub data: EventDataWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameTypeWire {
    pub val: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetWire {
    pub market_id: String,
    pub odd_id: u32,
    pub odd_name: String,
    pub odd_value: f64,
    pub status: String,
    pub profit_type: String,
    pub stake: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDataWire {
    pub class_type: String,
    pub participants: Vec<Value>,
    pub league_id: u32,
    pub match_day: u32,
    pub event_ndx: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemBetWire {
    pub grouping: u32,
    pub system_count: u32,
    pub stake: f64,
    pub winning_data: WinningDataWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinningDataWire {
    pub limit_max_payout: f64,
    pub min_winning: f64,
    pub max_winning: f64,
    pub min_bonus: f64,
    pub max_bonus: f64,
    pub winning_count: u32,
}
