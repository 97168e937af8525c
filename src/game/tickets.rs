//! Ticket lifecycle: the active pool, the admission queue, submission over
//! the ticket socket pool, and reconciliation of the platform's answers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::session::{CompetitionSignal, Session};
use super::table::{WeekResultIds, WeekWinningIds};
use super::ticket::{Ticket, TicketStatus};
use crate::remote::{Payload, Resource, Response, SocketHandle};

pub const DEFAULT_TICKET_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;
const SCAN_INTERVAL: Duration = Duration::from_secs(1);
/// A sent ticket with no answer after this long is retried.
const SENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Block already closed; nothing else of the round can go through.
const ERROR_INVALID_BLOCK: i64 = 602;
/// Event no longer on offer.
const ERROR_INVALID_EVENT: i64 = 603;
const ERROR_RETRY: i64 = 604;
const ERROR_LOW_BALANCE: i64 = 605;
const ERROR_SERVER: i64 = 500;

#[derive(Debug, Clone)]
pub struct TicketSettings {
    pub interval: Duration,
    pub demo_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for TicketSettings {
    fn default() -> Self {
        TicketSettings {
            interval: DEFAULT_TICKET_INTERVAL,
            demo_interval: DEFAULT_TICKET_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

type Pool = BTreeMap<u32, BTreeMap<u64, Ticket>>;

pub struct TicketManager {
    session: Arc<Session>,
    settings: TicketSettings,
    pool: Mutex<Pool>,
    next_key: AtomicU64,
    queue: mpsc::Sender<(u32, u64)>,
    queue_rx: Mutex<Option<mpsc::Receiver<(u32, u64)>>>,
    last_ticket: Mutex<Option<Instant>>,
    send_lock: tokio::sync::Mutex<()>,
    sockets: Mutex<Vec<SocketHandle>>,
    socket_ready: Notify,
    /// (socket id, xs) -> game id and send time of the ticket in flight.
    socket_map: Mutex<HashMap<(u32, u64), (u32, Instant)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TicketManager {
    pub fn new(session: Arc<Session>, settings: TicketSettings) -> Self {
        let (queue, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        TicketManager {
            session,
            settings,
            pool: Mutex::new(BTreeMap::new()),
            next_key: AtomicU64::new(0),
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
            last_ticket: Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
            sockets: Mutex::new(Vec::new()),
            socket_ready: Notify::new(),
            socket_map: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn tag(&self) -> &str {
        self.session.username()
    }

    /// Spawn the queue listener and the scanner.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);
        if let Some(rx) = lock(&self.queue_rx).take() {
            let manager = self.clone();
            tasks.push(tokio::spawn(async move { manager.ticket_listener(rx).await }));
        }
        let manager = self.clone();
        tasks.push(tokio::spawn(async move { manager.ticket_scanner().await }));
    }

    pub fn exit(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.close_sockets();
    }

    // ── Pool ─────────────────────────────────────────────────────────────────

    /// Take ownership of a competition's tickets. Returns their keys.
    pub async fn add_tickets(&self, game_id: u32, tickets: Vec<Ticket>) -> Vec<u64> {
        let keys = {
            let mut pool = lock(&self.pool);
            let competition = pool.entry(game_id).or_default();
            tickets
                .into_iter()
                .map(|mut ticket| {
                    let key = self.next_key.fetch_add(1, Ordering::SeqCst) + 1;
                    ticket.key = Some(key);
                    ticket.status = TicketStatus::Ready;
                    competition.insert(key, ticket);
                    key
                })
                .collect()
        };
        self.poll_ticket().await;
        keys
    }

    pub fn ticket(&self, game_id: u32, key: u64) -> Option<Ticket> {
        lock(&self.pool).get(&game_id)?.get(&key).cloned()
    }

    pub fn competition_tickets(&self, game_id: u32) -> Vec<Ticket> {
        lock(&self.pool)
            .get(&game_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    fn with_ticket<R>(&self, game_id: u32, key: u64, f: impl FnOnce(&mut Ticket) -> R) -> Option<R> {
        lock(&self.pool).get_mut(&game_id)?.get_mut(&key).map(f)
    }

    fn set_status(&self, game_id: u32, key: u64, status: TicketStatus) {
        self.with_ticket(game_id, key, |t| t.status = status);
    }

    /// Queue every READY or FAILED ticket that may go out now.
    pub async fn poll_ticket(&self) {
        let next = if self.session.competition_align() {
            match self.session.game_map().await.first() {
                Some(game_id) => Some(*game_id),
                None => return,
            }
        } else {
            None
        };
        let mut pool = lock(&self.pool);
        for (game_id, tickets) in pool.iter_mut() {
            if next.is_some_and(|n| n != *game_id) {
                continue;
            }
            for (key, ticket) in tickets.iter_mut() {
                if matches!(ticket.status, TicketStatus::Ready | TicketStatus::Failed)
                    && self.queue.try_send((*game_id, *key)).is_ok()
                {
                    ticket.status = TicketStatus::Waiting;
                }
            }
        }
    }

    /// `true` while some ticket of the competition still has to go out.
    pub fn resume_competition_tickets(&self, game_id: u32) -> bool {
        lock(&self.pool).get(&game_id).is_some_and(|tickets| {
            tickets.values().any(|t| {
                matches!(
                    t.status,
                    TicketStatus::Ready | TicketStatus::Waiting | TicketStatus::Failed
                )
            })
        })
    }

    /// Void and drop every ticket of the competition.
    pub fn reset_competition_tickets(&self, game_id: u32) {
        if let Some(tickets) = lock(&self.pool).get_mut(&game_id) {
            for ticket in tickets.values_mut() {
                ticket.status = TicketStatus::Void;
            }
            tickets.clear();
        }
    }

    /// Signal the competition once every ticket is through or void.
    /// Returns `true` while tickets are still pending.
    pub fn check_pending_tickets(&self, game_id: u32) -> bool {
        let pending = lock(&self.pool).get(&game_id).is_some_and(|tickets| {
            tickets
                .values()
                .any(|t| !matches!(t.status, TicketStatus::Success | TicketStatus::Void))
        });
        if !pending {
            self.session.notify(game_id, CompetitionSignal::TicketsComplete);
        }
        pending
    }

    /// Settle every accepted ticket whose results are all known. Returns
    /// the tickets resolved by this call.
    pub async fn validate_competition_tickets(
        &self,
        game_id: u32,
        results: &HashMap<u32, WeekResultIds>,
        winning_ids: &HashMap<u32, WeekWinningIds>,
    ) -> Vec<Ticket> {
        let resolved: Vec<Ticket> = {
            let mut pool = lock(&self.pool);
            let Some(tickets) = pool.get_mut(&game_id) else {
                return Vec::new();
            };
            tickets
                .values_mut()
                .filter(|t| t.status == TicketStatus::Success && !t.resolved)
                .filter_map(|t| {
                    let settlements = t.can_resolve(results, winning_ids)?;
                    t.resolve(&settlements);
                    t.resolved = true;
                    Some(t.clone())
                })
                .collect()
        };

        let accounts = self.session.accounts();
        for ticket in &resolved {
            let credit = accounts.credit().await;
            let jackpot = format!("{:.2}%", accounts.jackpot_value());
            info!(
                "[{}:{}] {} [Ksh : {:<9.2}] [L{} : {:<6} : {:<7.2}] [stake : {:<9.2} won : {:<9.2} total : {:<9.2}]",
                self.tag(),
                game_id,
                ticket.player,
                credit,
                accounts.bonus_level() + 1,
                jackpot,
                accounts.jackpot_amount(),
                ticket.stake(),
                ticket.total_won,
                accounts.total_stake()
            );
        }
        resolved
    }

    // ── Sockets ──────────────────────────────────────────────────────────────

    pub fn add_socket(&self, socket: SocketHandle) {
        lock(&self.sockets).push(socket);
    }

    pub fn socket_count(&self) -> usize {
        lock(&self.sockets).len()
    }

    /// Close and forget every socket above `keep`.
    pub fn shrink_sockets(&self, keep: usize) {
        let mut closed = Vec::new();
        {
            let mut sockets = lock(&self.sockets);
            while sockets.len() > keep {
                if let Some(socket) = sockets.pop() {
                    socket.close();
                    closed.push(socket.id());
                }
            }
        }
        self.forget_sockets(&closed);
    }

    pub fn close_sockets(&self) {
        let closed: Vec<u32> = lock(&self.sockets)
            .drain(..)
            .map(|socket| {
                socket.close();
                socket.id()
            })
            .collect();
        self.forget_sockets(&closed);
    }

    /// Fail the tickets still in flight on sockets that are gone.
    fn forget_sockets(&self, socket_ids: &[u32]) {
        if socket_ids.is_empty() {
            return;
        }
        let orphans: Vec<((u32, u64), u32)> = {
            let mut socket_map = lock(&self.socket_map);
            let keys: Vec<(u32, u64)> = socket_map
                .keys()
                .filter(|(socket_id, _)| socket_ids.contains(socket_id))
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|k| socket_map.remove(&k).map(|(game_id, _)| (k, game_id)))
                .collect()
        };
        self.fail_unanswered(orphans);
    }

    /// Drop correlations older than `SENT_TIMEOUT`.
    fn expire_sent(&self) {
        let now = Instant::now();
        let expired: Vec<((u32, u64), u32)> = {
            let mut socket_map = lock(&self.socket_map);
            let keys: Vec<(u32, u64)> = socket_map
                .iter()
                .filter(|(_, (_, sent_at))| now.duration_since(*sent_at) >= SENT_TIMEOUT)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| socket_map.remove(&k).map(|(game_id, _)| (k, game_id)))
                .collect()
        };
        self.fail_unanswered(expired);
    }

    fn fail_unanswered(&self, entries: Vec<((u32, u64), u32)>) {
        let mut pool = lock(&self.pool);
        for ((socket_id, xs), game_id) in entries {
            let Some(tickets) = pool.get_mut(&game_id) else {
                continue;
            };
            for ticket in tickets.values_mut() {
                if ticket.status == TicketStatus::Sent
                    && ticket.xs == Some(xs)
                    && ticket.socket_id == Some(socket_id)
                {
                    warn!(
                        "[{}:{}] {} ticket unanswered [{}:{}]",
                        self.tag(),
                        game_id,
                        ticket.player,
                        socket_id,
                        xs
                    );
                    ticket.status = TicketStatus::Failed;
                }
            }
        }
    }

    /// Wake senders blocked on an authorized socket.
    pub fn socket_online(&self) {
        self.socket_ready.notify_waiters();
    }

    fn pick_socket(&self) -> Option<SocketHandle> {
        let sockets = lock(&self.sockets);
        let socket = sockets
            .iter()
            .filter(|s| s.is_authorized())
            .min_by_key(|s| s.last_used())?
            .clone();
        socket.touch();
        Some(socket)
    }

    /// Least recently used authorized socket, waiting for one if needed.
    async fn available_socket(&self) -> SocketHandle {
        loop {
            let notified = self.socket_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(socket) = self.pick_socket() {
                return socket;
            }
            notified.await;
        }
    }

    // ── Submission ───────────────────────────────────────────────────────────

    async fn ticket_listener(self: Arc<Self>, mut queue: mpsc::Receiver<(u32, u64)>) {
        debug!("[{}] queue listener started", self.tag());
        loop {
            self.poll_ticket().await;
            self.wait_ticket_interval().await;
            let Some((game_id, key)) = queue.recv().await else {
                break;
            };
            if self.ticket(game_id, key).is_none() {
                continue;
            }
            self.session.refresh_jackpot();
            self.send_ticket(game_id, key).await;
        }
        debug!("[{}] queue listener stopped", self.tag());
    }

    async fn ticket_scanner(self: Arc<Self>) {
        debug!("[{}] ticket scanner started", self.tag());
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        loop {
            interval.tick().await;
            self.scan().await;
        }
    }

    /// One scanner pass: retry unanswered and credit-starved tickets,
    /// drop finished ones, refill the queue.
    pub async fn scan(&self) {
        self.expire_sent();
        let credit = self.session.accounts().credit().await;
        {
            let mut pool = lock(&self.pool);
            for tickets in pool.values_mut() {
                for ticket in tickets.values_mut() {
                    if ticket.status == TicketStatus::ErrorCredit {
                        if credit > ticket.stake() {
                            ticket.status = TicketStatus::Ready;
                            info!("[{}] Ticket Resume [{} : {}]", self.tag(), credit, ticket.stake());
                        } else {
                            warn!("[{}] Ticket Check [{} : {}]", self.tag(), credit, ticket.stake());
                        }
                    }
                }
                tickets.retain(|_, t| {
                    t.status != TicketStatus::Void && !(t.status == TicketStatus::Success && t.resolved)
                });
            }
        }
        self.poll_ticket().await;
    }

    async fn wait_ticket_interval(&self) {
        if self.session.jackpot_ready() {
            *lock(&self.last_ticket) = Some(Instant::now());
            return;
        }
        let interval = if self.session.is_demo() {
            self.settings.demo_interval
        } else {
            self.settings.interval
        };
        let last = *lock(&self.last_ticket);
        if let Some(last) = last {
            tokio::time::sleep_until(last + interval).await;
        }
        *lock(&self.last_ticket) = Some(Instant::now());
    }

    pub(crate) async fn send_ticket(&self, game_id: u32, key: u64) {
        let _guard = self.send_lock.lock().await;
        let Some((stake, player)) = self.with_ticket(game_id, key, |t| (t.stake(), t.player.clone())) else {
            return;
        };

        if self.session.is_demo() {
            self.send_demo_ticket(game_id, key, stake, &player).await;
            return;
        }

        let credit = self.session.accounts().credit().await;
        if credit < stake {
            self.set_status(game_id, key, TicketStatus::ErrorCredit);
            warn!("[{}:{}] [{}] error-credit [{}]", self.tag(), game_id, player, stake);
            // nothing went out, the next ticket need not wait
            *lock(&self.last_ticket) = None;
            return;
        }

        debug!("[{}:{}] [{}] stake : {}", self.tag(), game_id, player, stake);
        let Some(details) = self.with_ticket(game_id, key, |t| t.details(game_id)) else {
            return;
        };
        let body = self.session.resource_tickets(&details);
        loop {
            let socket = self.available_socket().await;
            if let Some(xs) = socket.send(Resource::Tickets, Payload::Body(body.clone())) {
                self.mark_sent(game_id, key, socket.id(), xs);
                if !self.session.jackpot_ready() {
                    socket.sync();
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn mark_sent(&self, game_id: u32, key: u64, socket_id: u32, xs: u64) {
        self.with_ticket(game_id, key, |t| {
            t.status = TicketStatus::Sent;
            t.sent_notify(xs, socket_id);
        });
        lock(&self.socket_map).insert((socket_id, xs), (game_id, Instant::now()));
    }

    async fn send_demo_ticket(&self, game_id: u32, key: u64, stake: f64, player: &str) {
        let accounts = self.session.accounts();
        match accounts.borrow(stake).await {
            Some(amount) => {
                self.set_status(game_id, key, TicketStatus::Success);
                self.register_ticket(game_id, key).await;
                self.poll_ticket().await;
                accounts.add_stake(amount);
                debug!("[{}:{}] [{}] simulation stake : [{}]", self.tag(), game_id, player, amount);
            }
            None => {
                self.set_status(game_id, key, TicketStatus::ErrorCredit);
                debug!("[{}:{}] [{}] out_of_credit", self.tag(), game_id, player);
            }
        }
        self.check_pending_tickets(game_id);
    }

    async fn register_ticket(&self, game_id: u32, key: u64) {
        let first = self
            .with_ticket(game_id, key, |t| !std::mem::replace(&mut t.registered, true))
            .unwrap_or(false);
        if first {
            if let Err(e) = self.session.rotate(game_id).await {
                error!("[{}:{}] rotation write failed: {:#}", self.tag(), game_id, e);
            }
        }
    }

    // ── Responses ────────────────────────────────────────────────────────────

    /// Route a ticket send response from socket `socket_id`.
    pub async fn on_ticket_response(&self, socket_id: u32, resp: &Response) {
        let Some(xs) = resp.xs else {
            return;
        };
        let Some((game_id, _)) = lock(&self.socket_map).remove(&(socket_id, xs)) else {
            warn!("[{}] unmatched ticket response {}:{}", self.tag(), socket_id, xs);
            return;
        };
        self.socket_ready.notify_waiters();

        let found = lock(&self.pool).get(&game_id).and_then(|tickets| {
            tickets
                .values()
                .find(|t| t.xs == Some(xs) && t.socket_id == Some(socket_id))
                .map(|t| (t.key, t.stake(), t.player.clone()))
        });
        let Some((Some(key), stake, player)) = found else {
            return;
        };

        if let Some(new_credit) = resp.body.get("transaction").map(|t| t["newCredit"].as_f64()) {
            let accounts = self.session.accounts();
            accounts.add_stake(stake);
            if let Some(credit) = new_credit {
                accounts.update(credit).await;
            }
            debug!("[{}:{}] {} ticket success", self.tag(), game_id, player);
            self.ticket_success(game_id, key).await;
        } else {
            let code = error_code(&resp.body["errorCode"]).unwrap_or(-1);
            let message = resp.body["message"].as_str().unwrap_or_default();
            warn!(
                "[{}:{}] {} ticket error Code: {} Message: {}",
                self.tag(),
                game_id,
                player,
                code,
                message
            );
            self.ticket_failed(code, game_id, key).await;
        }
    }

    async fn ticket_success(&self, game_id: u32, key: u64) {
        self.set_status(game_id, key, TicketStatus::Success);
        self.register_ticket(game_id, key).await;
        self.poll_ticket().await;
        self.check_pending_tickets(game_id);
    }

    async fn ticket_failed(&self, code: i64, game_id: u32, key: u64) {
        let status = match code {
            ERROR_INVALID_BLOCK | ERROR_INVALID_EVENT => TicketStatus::Void,
            ERROR_LOW_BALANCE => TicketStatus::ErrorCredit,
            _ => TicketStatus::Failed,
        };
        self.set_status(game_id, key, status);
        match code {
            ERROR_RETRY | ERROR_SERVER | ERROR_INVALID_EVENT => self.poll_ticket().await,
            ERROR_INVALID_BLOCK => {
                self.check_pending_tickets(game_id);
            }
            _ => {}
        }
    }
}

fn error_code(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::accounts::AccountManager;
    use crate::game::table::Handicap;
    use crate::game::ticket::{Bet, Event};
    use crate::store::Store;
    use approx::assert_relative_eq;
    use serde_json::json;

    const GAME: u32 = 14036;
    static KEY: AtomicU64 = AtomicU64::new(0);

    fn manager(
        demo: bool,
        credit: f64,
        align: bool,
    ) -> (Arc<TicketManager>, mpsc::UnboundedReceiver<CompetitionSignal>) {
        let root = std::env::temp_dir().join(format!(
            "vbet-tickets-{}-{}",
            std::process::id(),
            KEY.fetch_add(1, Ordering::SeqCst)
        ));
        let store = Store::open_in_memory(&root).unwrap();
        let accounts = Arc::new(AccountManager::new(demo, credit));
        let session = Arc::new(Session::new("0700", demo, align, vec![GAME, 14045], accounts, store));
        let (tx, rx) = mpsc::unbounded_channel();
        session.register_competition(GAME, tx);
        (Arc::new(TicketManager::new(session, TicketSettings::default())), rx)
    }

    fn ticket(game_id: u32, event_id: u64, stake: f64) -> Ticket {
        let event = Event::new(event_id, 7, 3, vec![json!({"fifaCode": "BAR"}), json!({"fifaCode": "RMA"})]);
        Ticket::single(game_id, "messi", event, Bet::new(0, "Match_Result", 2.0, "1", stake))
    }

    fn response(xs: u64, body: Value) -> Response {
        Response {
            xs: Some(xs),
            resource: Some(Resource::Tickets),
            status_code: Some(200),
            valid: true,
            body,
        }
    }

    #[tokio::test]
    async fn demo_ticket_borrows_and_completes_round() {
        let (tm, mut signals) = manager(true, 20.0, false);
        let keys = tm.add_tickets(GAME, vec![ticket(GAME, 1, 15.0)]).await;
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::Waiting);

        tm.send_ticket(GAME, keys[0]).await;
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::Success);
        assert_relative_eq!(tm.session.accounts().credit().await, 5.0, epsilon = 1e-9);
        assert_relative_eq!(tm.session.accounts().total_stake(), 15.0, epsilon = 1e-9);
        assert_eq!(signals.try_recv().unwrap(), CompetitionSignal::TicketsComplete);
    }

    #[tokio::test]
    async fn demo_ticket_without_credit_waits_for_funds() {
        let (tm, mut signals) = manager(true, 10.0, false);
        let keys = tm.add_tickets(GAME, vec![ticket(GAME, 1, 15.0)]).await;
        tm.send_ticket(GAME, keys[0]).await;
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::ErrorCredit);
        assert!(signals.try_recv().is_err());

        tm.scan().await;
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::ErrorCredit);
        tm.session.accounts().fund(10.0).await;
        tm.scan().await;
        // promoted to READY then queued again by the same pass
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::Waiting);
    }

    #[tokio::test]
    async fn live_ticket_without_credit_is_error_credit() {
        let (tm, _signals) = manager(false, 4.0, false);
        let keys = tm.add_tickets(GAME, vec![ticket(GAME, 1, 5.0)]).await;
        tm.send_ticket(GAME, keys[0]).await;
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::ErrorCredit);
    }

    #[tokio::test]
    async fn void_ticket_does_not_hold_the_round() {
        let (tm, mut signals) = manager(false, 100.0, false);
        let keys = tm.add_tickets(GAME, vec![ticket(GAME, 1, 5.0), ticket(GAME, 2, 5.0)]).await;
        tm.mark_sent(GAME, keys[0], 0, 11);
        tm.mark_sent(GAME, keys[1], 1, 11);

        tm.on_ticket_response(0, &response(11, json!({"transaction": {"newCredit": 95.0}}))).await;
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::Success);
        assert_relative_eq!(tm.session.accounts().credit().await, 95.0, epsilon = 1e-9);
        assert!(signals.try_recv().is_err());
        assert!(tm.check_pending_tickets(GAME));

        tm.on_ticket_response(1, &response(11, json!({"errorCode": "602", "message": "closed"}))).await;
        assert_eq!(tm.ticket(GAME, keys[1]).unwrap().status, TicketStatus::Void);
        assert_eq!(signals.try_recv().unwrap(), CompetitionSignal::TicketsComplete);
        assert!(!tm.resume_competition_tickets(GAME));

        tm.scan().await;
        assert!(tm.ticket(GAME, keys[1]).is_none());
        assert!(tm.ticket(GAME, keys[0]).is_some());
    }

    #[tokio::test]
    async fn rejection_codes_map_to_states() {
        let (tm, _signals) = manager(false, 100.0, false);
        let keys = tm.add_tickets(GAME, vec![ticket(GAME, 1, 5.0), ticket(GAME, 2, 5.0), ticket(GAME, 3, 5.0)]).await;
        for (i, key) in keys.iter().enumerate() {
            tm.mark_sent(GAME, *key, 0, i as u64);
        }
        tm.on_ticket_response(0, &response(0, json!({"errorCode": 605}))).await;
        tm.on_ticket_response(0, &response(2, json!({"errorCode": 999}))).await;
        assert_eq!(tm.ticket(GAME, keys[2]).unwrap().status, TicketStatus::Failed);
        tm.on_ticket_response(0, &response(1, json!({"errorCode": 604}))).await;

        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::ErrorCredit);
        // 604 requeues straight away; the generic failure rides along
        assert_eq!(tm.ticket(GAME, keys[1]).unwrap().status, TicketStatus::Waiting);
        assert_eq!(tm.ticket(GAME, keys[2]).unwrap().status, TicketStatus::Waiting);
        assert!(tm.resume_competition_tickets(GAME));

        // unknown correlation is ignored
        tm.on_ticket_response(0, &response(42, json!({"errorCode": 602}))).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ticket_is_retried_after_timeout() {
        let (tm, _signals) = manager(false, 100.0, false);
        let keys = tm.add_tickets(GAME, vec![ticket(GAME, 1, 5.0)]).await;
        tm.mark_sent(GAME, keys[0], 0, 1);

        tm.scan().await;
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::Sent);
        assert_eq!(lock(&tm.socket_map).len(), 1);

        tokio::time::advance(SENT_TIMEOUT).await;
        tm.scan().await;
        assert!(lock(&tm.socket_map).is_empty());
        // failed, then queued again by the same pass
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::Waiting);
        assert!(tm.resume_competition_tickets(GAME));

        // a late answer no longer matches anything
        tm.on_ticket_response(0, &response(1, json!({"transaction": {"newCredit": 95.0}}))).await;
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::Waiting);
    }

    #[tokio::test]
    async fn closed_socket_releases_its_tickets() {
        let (tm, _signals) = manager(false, 100.0, false);
        let keys = tm.add_tickets(GAME, vec![ticket(GAME, 1, 5.0), ticket(GAME, 2, 5.0)]).await;
        tm.mark_sent(GAME, keys[0], 3, 1);
        tm.mark_sent(GAME, keys[1], 4, 1);

        tm.forget_sockets(&[3]);
        assert_eq!(tm.ticket(GAME, keys[0]).unwrap().status, TicketStatus::Failed);
        assert_eq!(tm.ticket(GAME, keys[1]).unwrap().status, TicketStatus::Sent);
        assert_eq!(lock(&tm.socket_map).keys().copied().collect::<Vec<_>>(), vec![(4, 1)]);
    }

    #[tokio::test]
    async fn alignment_only_queues_the_next_competition() {
        let (tm, _signals) = manager(true, 100.0, true);
        tm.session.load_rotation().await.unwrap();
        let a = tm.add_tickets(14045, vec![ticket(14045, 1, 5.0)]).await;
        let b = tm.add_tickets(GAME, vec![ticket(GAME, 2, 5.0)]).await;
        assert_eq!(tm.ticket(14045, a[0]).unwrap().status, TicketStatus::Ready);
        assert_eq!(tm.ticket(GAME, b[0]).unwrap().status, TicketStatus::Waiting);

        tm.send_ticket(GAME, b[0]).await;
        assert_eq!(tm.session.game_map().await, vec![14045, GAME]);
        assert_eq!(tm.ticket(14045, a[0]).unwrap().status, TicketStatus::Waiting);
    }

    #[tokio::test]
    async fn validation_resolves_once_and_scanner_drops_settled() {
        let (tm, _signals) = manager(true, 100.0, false);
        let keys = tm.add_tickets(GAME, vec![ticket(GAME, 1, 10.0)]).await;
        tm.send_ticket(GAME, keys[0]).await;

        let empty = tm.validate_competition_tickets(GAME, &HashMap::new(), &HashMap::new()).await;
        assert!(empty.is_empty());

        let results = HashMap::from([(3, HashMap::from([(1, vec![0, 16])]))]);
        let winning = HashMap::from([(3, HashMap::from([(1, Handicap::default())]))]);
        let resolved = tm.validate_competition_tickets(GAME, &results, &winning).await;
        assert_eq!(resolved.len(), 1);
        assert_relative_eq!(resolved[0].total_won, 20.0, epsilon = 1e-9);
        assert!(tm.validate_competition_tickets(GAME, &results, &winning).await.is_empty());

        tm.scan().await;
        assert!(tm.competition_tickets(GAME).is_empty());
    }

    #[tokio::test]
    async fn reset_voids_and_clears() {
        let (tm, _signals) = manager(true, 100.0, false);
        tm.add_tickets(GAME, vec![ticket(GAME, 1, 10.0)]).await;
        assert!(tm.resume_competition_tickets(GAME));
        tm.reset_competition_tickets(GAME);
        assert!(tm.competition_tickets(GAME).is_empty());
        assert!(!tm.resume_competition_tickets(GAME));
    }
}
