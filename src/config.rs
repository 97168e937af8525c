use std::time::Duration;

use clap::Parser;

use crate::game::accounts::MIN_BET_AMOUNT;
use crate::game::players;
use crate::game::{TicketSettings, UserSettings};
use crate::remote::{ApiBackend, Credentials};

/// Virtual football betting engine
#[derive(Parser, Debug, Clone)]
#[command(name = "vbet", version, about)]
pub struct Config {
    /// Control-plane listen address
    #[arg(long, env = "CONTROL_ADDR", default_value = "0.0.0.0:8098")]
    pub control_addr: String,

    /// SQLite session cache path
    #[arg(long, env = "DATABASE_PATH", default_value = "vbet.db")]
    pub database_path: String,

    /// Directory for per-user rotation state
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: String,

    /// Directory for archived leagues
    #[arg(long, env = "CACHE_DIR", default_value = "cache")]
    pub cache_dir: String,

    /// Bookmaker issuing logins and online hashes
    #[arg(long, env = "API_BACKEND", value_enum, default_value = "betika")]
    pub api: ApiBackend,

    /// Virtual-games proxy WebSocket URL
    #[arg(
        long,
        env = "SOCKET_URL",
        default_value = "wss://virtual-proxy.golden-race.net:9443/vs"
    )]
    pub socket_url: String,

    /// Proxy server IPs sockets are spread over (comma separated)
    #[arg(long, env = "SERVER_HOSTS", value_delimiter = ',')]
    pub server_hosts: Vec<String>,

    /// Playlist ids to run a competition on (comma separated)
    #[arg(
        long,
        env = "GAME_IDS",
        value_delimiter = ',',
        default_value = "14036,14045"
    )]
    pub game_ids: Vec<u32>,

    /// Play against a simulated balance; tickets never leave the process
    #[arg(long, env = "DEMO", default_value = "false")]
    pub demo: bool,

    /// Starting balance in demo mode
    #[arg(long, env = "DEMO_CREDIT", default_value = "10000.0")]
    pub demo_credit: f64,

    /// Smallest stake the bookmaker accepts
    #[arg(long, env = "MIN_BET_AMOUNT", default_value_t = MIN_BET_AMOUNT)]
    pub min_bet: f64,

    /// Minimum seconds between two live tickets
    #[arg(long, env = "TICKET_INTERVAL_SECS", default_value = "2")]
    pub ticket_interval_secs: f64,

    /// Minimum seconds between two demo tickets
    #[arg(long, env = "DEMO_TICKET_INTERVAL_SECS", default_value = "0.5")]
    pub demo_ticket_interval_secs: f64,

    /// Ticket sockets per user
    #[arg(long, env = "TICKET_SOCKETS", default_value = "2")]
    pub ticket_sockets: usize,

    /// Ticket sockets per user while the jackpot window is open
    #[arg(long, env = "JACKPOT_SOCKETS", default_value = "4")]
    pub jackpot_sockets: usize,

    /// Tickets queued for submission at once
    #[arg(long, env = "QUEUE_CAPACITY", default_value = "50")]
    pub queue_capacity: usize,

    /// Send tickets competition by competition in rotation order
    #[arg(long, env = "COMPETITION_ALIGN", default_value = "false")]
    pub competition_align: bool,

    /// Players run on every competition (comma separated)
    #[arg(long, env = "PLAYERS", value_delimiter = ',', default_value = "messi")]
    pub players: Vec<String>,

    /// Open the jackpot window once this much has been staked
    #[arg(long, env = "BONUS_TARGET")]
    pub bonus_target: Option<f64>,

    /// Log in and start this user at boot
    #[arg(long, env = "VBET_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "VBET_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.game_ids.is_empty() {
            anyhow::bail!("at least one game id is required");
        }
        if self.demo && self.demo_credit <= 0.0 {
            anyhow::bail!("demo_credit must be positive");
        }
        if self.min_bet <= 0.0 {
            anyhow::bail!("min_bet must be positive");
        }
        if self.ticket_interval_secs < 0.0 || self.demo_ticket_interval_secs < 0.0 {
            anyhow::bail!("ticket intervals must not be negative");
        }
        if self.ticket_sockets == 0 {
            anyhow::bail!("ticket_sockets must be at least 1");
        }
        if self.jackpot_sockets < self.ticket_sockets {
            anyhow::bail!("jackpot_sockets must not be below ticket_sockets");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if let Some(unknown) = self.players.iter().find(|p| !players::names().any(|n| n == p.as_str())) {
            anyhow::bail!("unknown player {}", unknown);
        }
        if self.bonus_target.is_some_and(|t| t <= 0.0) {
            anyhow::bail!("bonus_target must be positive");
        }
        if self.username.is_some() != self.password.is_some() {
            anyhow::bail!("VBET_USERNAME and VBET_PASSWORD go together");
        }
        Ok(())
    }

    pub fn ticket_settings(&self) -> TicketSettings {
        TicketSettings {
            interval: Duration::from_secs_f64(self.ticket_interval_secs),
            demo_interval: Duration::from_secs_f64(self.demo_ticket_interval_secs),
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn user_settings(&self, username: &str, credentials: Credentials) -> UserSettings {
        UserSettings {
            username: username.to_string(),
            credentials,
            demo: self.demo,
            demo_credit: self.demo_credit,
            min_bet: self.min_bet,
            bonus_target: self.bonus_target,
            games: self.game_ids.clone(),
            players: self.players.clone(),
            hosts: self.server_hosts.clone(),
            ticket_sockets: self.ticket_sockets,
            jackpot_sockets: self.jackpot_sockets,
            competition_align: self.competition_align,
            tickets: self.ticket_settings(),
        }
    }

    /// Key the control plane caches a user's session under.
    pub fn session_key(&self, username: &str) -> String {
        let api = match self.api {
            ApiBackend::Betika => "betika",
            ApiBackend::Mozzart => "mozzart",
        };
        format!("{}_session_{}", api, username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::parse_from(std::iter::once("vbet").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]);
        config.validate().unwrap();
        assert_eq!(config.game_ids, vec![14036, 14045]);
        assert_eq!(config.session_key("0700"), "betika_session_0700");
        assert_eq!(config.ticket_settings().interval, Duration::from_secs(2));
    }

    #[test]
    fn lists_are_comma_separated() {
        let config = parse(&["--players", "messi,xavi", "--game-ids", "14050", "--api", "mozzart"]);
        config.validate().unwrap();
        assert_eq!(config.players, vec!["messi", "xavi"]);
        assert_eq!(config.session_key("u"), "mozzart_session_u");
        let user = config.user_settings("u", Credentials::default());
        assert_eq!(user.games, vec![14050]);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse(&["--players", "arthur"]).validate().is_err());
        assert!(parse(&["--ticket-sockets", "3", "--jackpot-sockets", "2"]).validate().is_err());
        assert!(parse(&["--username", "u"]).validate().is_err());
        assert!(parse(&["--min-bet", "0"]).validate().is_err());
    }
}
