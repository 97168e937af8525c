//! One logged-in bettor: a session, a ticket manager, a pool of ticket
//! sockets and one competition per game id.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::accounts::AccountManager;
use super::competition::{max_week, Competition};
use super::players;
use super::session::{CompetitionSignal, Session};
use super::tickets::{TicketManager, TicketSettings};
use crate::remote::{Credentials, Remote, Resource, Socket, SocketEvent, SocketHandle, SocketMode, SocketSpec};
use crate::store::Store;

/// Per-user knobs, taken from the process configuration.
#[derive(Debug, Clone)]
pub struct UserSettings {
    pub username: String,
    pub credentials: Credentials,
    pub demo: bool,
    pub demo_credit: f64,
    pub min_bet: f64,
    pub bonus_target: Option<f64>,
    pub games: Vec<u32>,
    pub players: Vec<String>,
    /// Proxy hosts sockets are spread over. Empty means DNS.
    pub hosts: Vec<String>,
    pub ticket_sockets: usize,
    pub jackpot_sockets: usize,
    pub competition_align: bool,
    pub tickets: TicketSettings,
}

/// Snapshot reported to the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    pub username: String,
    pub demo: bool,
    pub credit: f64,
    pub total_stake: f64,
    pub bonus_level: i64,
    pub jackpot_ready: bool,
    pub competitions: Vec<u32>,
    pub ticket_sockets: usize,
}

pub struct User {
    settings: UserSettings,
    session: Arc<Session>,
    tickets: Arc<TicketManager>,
    remote: Remote,
    next_socket_id: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl User {
    /// Build the user's session and bring every competition and ticket
    /// socket up.
    pub async fn start(settings: UserSettings, remote: Remote, store: Store) -> Result<Arc<Self>> {
        let mut accounts = AccountManager::new(settings.demo, settings.demo_credit).with_min_bet(settings.min_bet);
        if let Some(target) = settings.bonus_target {
            accounts = accounts.with_bonus_target(target);
        }
        let session = Arc::new(Session::new(
            &settings.username,
            settings.demo,
            settings.competition_align,
            settings.games.clone(),
            Arc::new(accounts),
            store,
        ));
        session
            .load_rotation()
            .await
            .with_context(|| format!("Failed to load rotation for {}", settings.username))?;

        let tickets = Arc::new(TicketManager::new(session.clone(), settings.tickets.clone()));
        tickets.start();

        let user = Arc::new(User {
            settings,
            session,
            tickets,
            remote,
            next_socket_id: AtomicU32::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        for game_id in user.settings.games.clone() {
            user.spawn_competition(game_id);
        }
        user.resize_ticket_pool(user.settings.ticket_sockets);

        let watcher = tokio::spawn(user.clone().watch_jackpot());
        user.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(watcher);

        info!(
            "[{}] user started [demo: {}] games {:?}",
            user.username(),
            user.settings.demo,
            user.settings.games
        );
        Ok(user)
    }

    pub fn username(&self) -> &str {
        &self.settings.username
    }

    fn spawn_socket(&self, mode: SocketMode) -> (SocketHandle, mpsc::UnboundedReceiver<SocketEvent>) {
        let id = self.next_socket_id.fetch_add(1, Ordering::SeqCst);
        let host = match self.settings.hosts.len() {
            0 => None,
            n => Some(self.settings.hosts[id as usize % n].clone()),
        };
        let spec = SocketSpec {
            id,
            username: self.settings.username.clone(),
            credentials: self.settings.credentials.clone(),
            host,
            mode,
        };
        Socket::spawn(spec, self.remote.clone())
    }

    fn spawn_competition(&self, game_id: u32) {
        let mode = SocketMode::Competition {
            sync: self.session.sync_flag(),
        };
        let (socket, events) = self.spawn_socket(mode);
        let (tx, signals) = mpsc::unbounded_channel();
        self.session.register_competition(game_id, tx);

        let accounts = self.session.accounts().clone();
        let players = self
            .settings
            .players
            .iter()
            .filter_map(|name| {
                let player = players::create(name, accounts.clone(), max_week(game_id));
                if player.is_none() {
                    warn!("[{}:{}] unknown player {}", self.username(), game_id, name);
                }
                player
            })
            .collect();

        let competition = Competition::new(
            game_id,
            self.session.clone(),
            self.tickets.clone(),
            players,
            Arc::new(socket),
        );
        tokio::spawn(competition.run(events, signals));
    }

    fn spawn_ticket_socket(self: &Arc<Self>) {
        let (socket, events) = self.spawn_socket(SocketMode::Ticket);
        let id = socket.id();
        self.tickets.add_socket(socket);
        tokio::spawn(self.clone().ticket_events(id, events));
    }

    /// Grow or shrink the ticket socket pool to `target` sockets.
    fn resize_ticket_pool(self: &Arc<Self>, target: usize) {
        let count = self.tickets.socket_count();
        if count < target {
            for _ in count..target {
                self.spawn_ticket_socket();
            }
        } else {
            self.tickets.shrink_sockets(target);
        }
        debug!("[{}] ticket sockets {} -> {}", self.username(), count, target);
    }

    async fn ticket_events(self: Arc<Self>, id: u32, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Online(body) => {
                    self.session.setup_session(&body).await;
                    self.tickets.socket_online();
                }
                SocketEvent::Unauthorized(_) => {
                    warn!("[{}:{}] ticket socket not authorized", self.username(), id);
                }
                SocketEvent::Lost => debug!("[{}:{}] ticket socket lost", self.username(), id),
                SocketEvent::Offline => break,
                SocketEvent::Response(resp) => match resp.resource {
                    Some(Resource::Sync) => self.session.on_sync(resp.valid, &resp.body).await,
                    Some(Resource::Tickets) => self.tickets.on_ticket_response(id, &resp).await,
                    _ => {}
                },
            }
        }
    }

    async fn watch_jackpot(self: Arc<Self>) {
        let mut jackpot = self.session.subscribe_jackpot();
        while jackpot.changed().await.is_ok() {
            let ready = *jackpot.borrow_and_update();
            let target = if ready {
                self.settings.jackpot_sockets
            } else {
                self.settings.ticket_sockets
            };
            self.resize_ticket_pool(target);
        }
    }

    /// Change the odd a player bets on, for one competition or all of them.
    pub fn modify_player(&self, game_id: Option<u32>, player: &str, odd_id: u32) -> bool {
        let signal = CompetitionSignal::ModifyPlayer {
            player: player.to_string(),
            odd_id,
        };
        match game_id {
            Some(game_id) => self.session.notify(game_id, signal),
            None => {
                self.session.broadcast(signal);
                true
            }
        }
    }

    pub async fn status(&self) -> UserStatus {
        let accounts = self.session.accounts();
        UserStatus {
            username: self.settings.username.clone(),
            demo: self.settings.demo,
            credit: accounts.credit().await,
            total_stake: accounts.total_stake(),
            bonus_level: accounts.bonus_level(),
            jackpot_ready: self.session.jackpot_ready(),
            competitions: self.session.competition_ids(),
            ticket_sockets: self.tickets.socket_count(),
        }
    }

    /// Close every competition and socket of the user.
    pub fn exit(&self) {
        info!("[{}] user exit", self.username());
        self.session.broadcast(CompetitionSignal::Exit);
        self.tickets.exit();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{MockAuth, SilentConnector};
    use std::sync::atomic::AtomicU64;

    static ROOT: AtomicU64 = AtomicU64::new(0);

    fn settings(games: Vec<u32>) -> UserSettings {
        UserSettings {
            username: "0700000000".into(),
            credentials: Credentials::default(),
            demo: true,
            demo_credit: 1000.0,
            min_bet: 5.0,
            bonus_target: None,
            games,
            players: vec!["messi".into(), "arthur".into()],
            hosts: vec!["10.0.0.1".into(), "10.0.0.2".into()],
            ticket_sockets: 2,
            jackpot_sockets: 4,
            competition_align: false,
            tickets: TicketSettings::default(),
        }
    }

    async fn user(games: Vec<u32>) -> Arc<User> {
        let root = std::env::temp_dir().join(format!(
            "vbet-user-{}-{}",
            std::process::id(),
            ROOT.fetch_add(1, Ordering::SeqCst)
        ));
        let store = Store::open_in_memory(&root).unwrap();
        let remote = Remote {
            auth: Arc::new(MockAuth),
            connector: Arc::new(SilentConnector),
            proxy_host: "wss://proxy:9443".into(),
        };
        User::start(settings(games), remote, store).await.unwrap()
    }

    #[tokio::test]
    async fn start_registers_competitions_and_ticket_sockets() {
        let user = user(vec![14036, 14045]).await;
        let status = user.status().await;
        assert_eq!(status.competitions, vec![14036, 14045]);
        assert_eq!(status.ticket_sockets, 2);
        assert_eq!(status.credit, 1000.0);
        assert!(user.modify_player(Some(14036), "messi", 2));
        assert!(!user.modify_player(Some(1), "messi", 2));
        user.exit();
        assert_eq!(user.tickets.socket_count(), 0);
    }

    #[tokio::test]
    async fn ticket_pool_follows_jackpot_window() {
        let user = user(vec![14036]).await;
        user.resize_ticket_pool(user.settings.jackpot_sockets);
        assert_eq!(user.tickets.socket_count(), 4);
        user.resize_ticket_pool(user.settings.ticket_sockets);
        assert_eq!(user.tickets.socket_count(), 2);
        user.exit();
    }
}
