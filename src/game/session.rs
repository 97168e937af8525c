//! State shared by everything one user runs: platform settings from the
//! login response, the ledger, the jackpot window, the competition rotation
//! and the signal lines into each competition task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::accounts::{AccountManager, StakeLimits};
use super::ticket::TicketDetails;
use crate::remote::protocol::ticket_timestamp;
use crate::store::Store;

/// Game type whose stake limits apply to football tickets.
const FOOTBALL_GAME_TYPE: &str = "GL";

/// Messages a competition task accepts from the rest of the user.
#[derive(Debug, Clone, PartialEq)]
pub enum CompetitionSignal {
    /// Every ticket of the round is settled or void.
    TicketsComplete,
    /// Jackpot window opened (`true`) or closed.
    Jackpot(bool),
    ModifyPlayer { player: String, odd_id: u32 },
    Exit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Playlist {
    pub countdown: f64,
    pub offset: f64,
}

impl Playlist {
    pub fn is_scheduled(&self) -> bool {
        self.countdown > 0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameLimits {
    #[serde(default, rename = "currencyCode")]
    pub currency: Option<String>,
    #[serde(default)]
    pub min_stake: f64,
    #[serde(default)]
    pub max_stake: f64,
    #[serde(default)]
    pub max_payout: f64,
}

/// Platform settings announced in the login response.
#[derive(Debug, Clone, Default)]
pub struct GameSettings {
    pub odd_settings_id: Value,
    pub taxes_settings_id: Value,
    pub currency: Value,
    pub unit_id: Option<u64>,
    pub ext_id: Value,
    pub ext_data: Value,
    pub player_name: Value,
    pub playlists: HashMap<u32, Playlist>,
    pub limits: HashMap<String, GameLimits>,
    configured: bool,
}

impl GameSettings {
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn configure(&mut self, body: &Value) {
        self.configured = true;
        self.process_displays(&body["displays"]);
        self.process_game_settings(&body["gameSettings"]);

        let unit = &body["auth"]["unit"];
        self.unit_id = unit["id"].as_u64();
        self.ext_id = unit["extId"].clone();
        self.player_name = unit["name"].clone();

        self.currency = body["localization"]["currencySett"]["currency"].clone();
        self.taxes_settings_id = body["taxesSettings"]["taxesSettingsId"].clone();
        self.ext_data = body["extData"].clone();
        self.odd_settings_id = body["oddSettingsId"].clone();
    }

    fn process_displays(&mut self, displays: &Value) {
        self.playlists.clear();
        for content in displays.as_array().into_iter().flatten().map(|d| &d["content"]) {
            let Some(id) = content["playlistId"].as_u64() else {
                continue;
            };
            let countdown = content
                .get("countDown")
                .or_else(|| content.get("countdown"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let offset = content["offset"].as_f64().unwrap_or(0.0);
            self.playlists.insert(id as u32, Playlist { countdown, offset });
        }
    }

    fn process_game_settings(&mut self, settings: &Value) {
        for setting in settings.as_array().into_iter().flatten() {
            let Some(val) = setting["gameType"]["val"].as_str() else {
                continue;
            };
            let limits = setting["limits"]
                .get(0)
                .and_then(|l| GameLimits::deserialize(l).ok())
                .unwrap_or_default();
            self.limits.insert(val.to_string(), limits);
        }
    }

    pub fn stake_limits(&self, game_type: &str) -> Option<StakeLimits> {
        self.limits.get(game_type).map(|l| StakeLimits {
            min_stake: l.min_stake,
            max_stake: l.max_stake,
        })
    }
}

pub struct Session {
    username: String,
    demo: bool,
    competition_align: bool,
    live_games: Vec<u32>,
    accounts: Arc<AccountManager>,
    store: Store,
    settings: RwLock<GameSettings>,
    sync_enabled: Arc<AtomicBool>,
    jackpot: watch::Sender<bool>,
    game_map: tokio::sync::Mutex<Vec<u32>>,
    competitions: Mutex<HashMap<u32, mpsc::UnboundedSender<CompetitionSignal>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(
        username: &str,
        demo: bool,
        competition_align: bool,
        live_games: Vec<u32>,
        accounts: Arc<AccountManager>,
        store: Store,
    ) -> Self {
        let (jackpot, _) = watch::channel(false);
        Session {
            username: username.to_string(),
            demo,
            competition_align,
            live_games,
            accounts,
            store,
            settings: RwLock::new(GameSettings::default()),
            sync_enabled: Arc::new(AtomicBool::new(true)),
            jackpot,
            game_map: tokio::sync::Mutex::new(Vec::new()),
            competitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_demo(&self) -> bool {
        self.demo
    }

    pub fn competition_align(&self) -> bool {
        self.competition_align
    }

    pub fn accounts(&self) -> &Arc<AccountManager> {
        &self.accounts
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Flag shared with competition sockets; heartbeats skip sync while off.
    pub fn sync_flag(&self) -> Arc<AtomicBool> {
        self.sync_enabled.clone()
    }

    pub fn settings(&self) -> GameSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn playlist(&self, game_id: u32) -> Option<Playlist> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .playlists
            .get(&game_id)
            .copied()
    }

    // ── Session status ───────────────────────────────────────────────────────

    /// Apply a login response. Settings are taken from the first one only.
    pub async fn setup_session(&self, body: &Value) {
        self.process_session_status(&body["sessionStatus"]).await;
        let limits = {
            let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            if settings.is_configured() {
                return;
            }
            settings.configure(body);
            settings.stake_limits(FOOTBALL_GAME_TYPE)
        };
        self.accounts.set_stake_limits(limits);
        debug!("[{}] session configured", self.username);
    }

    pub async fn on_sync(&self, valid: bool, body: &Value) {
        if !valid {
            return;
        }
        if let Some(status) = body.get("sessionStatus").filter(|s| s.is_object()) {
            self.process_session_status(status).await;
        }
    }

    pub async fn process_session_status(&self, status: &Value) {
        if let Some(jackpot) = status["jackpots"].get(0) {
            self.accounts.set_bonus_level(jackpot["bonusLevel"].as_i64());
            if let Some(amount) = jackpot["amount"].as_f64() {
                self.accounts.set_jackpot_amount(amount);
            }
        }
        self.refresh_jackpot();

        if !self.demo {
            if let Some(credit) = status["credit"].as_f64().filter(|c| *c > 0.0) {
                self.accounts.update(credit).await;
            }
        }
    }

    // ── Jackpot window ───────────────────────────────────────────────────────

    pub fn jackpot_ready(&self) -> bool {
        *self.jackpot.borrow()
    }

    pub fn subscribe_jackpot(&self) -> watch::Receiver<bool> {
        self.jackpot.subscribe()
    }

    /// Open or close the jackpot window to match the ledger.
    pub fn refresh_jackpot(&self) {
        let ready = self.accounts.is_bonus_ready();
        if ready && !self.jackpot_ready() {
            self.jackpot_setup();
        } else if !ready && self.jackpot_ready() {
            self.jackpot_reset();
        }
    }

    fn jackpot_setup(&self) {
        self.broadcast(CompetitionSignal::Jackpot(true));
        self.sync_enabled.store(false, Ordering::SeqCst);
        self.jackpot.send_replace(true);
        info!(
            "[{}] Jackpot ready [{}]",
            self.username,
            self.accounts.jackpot_amount()
        );
    }

    fn jackpot_reset(&self) {
        self.broadcast(CompetitionSignal::Jackpot(false));
        self.sync_enabled.store(true, Ordering::SeqCst);
        self.jackpot.send_replace(false);
        info!("[{}] Jackpot reset", self.username);
    }

    // ── Competitions ─────────────────────────────────────────────────────────

    pub fn register_competition(&self, game_id: u32, tx: mpsc::UnboundedSender<CompetitionSignal>) {
        lock(&self.competitions).insert(game_id, tx);
    }

    pub fn unregister_competition(&self, game_id: u32) {
        lock(&self.competitions).remove(&game_id);
    }

    pub fn competition_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = lock(&self.competitions).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn notify(&self, game_id: u32, signal: CompetitionSignal) -> bool {
        match lock(&self.competitions).get(&game_id) {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    pub fn broadcast(&self, signal: CompetitionSignal) {
        for tx in lock(&self.competitions).values() {
            let _ = tx.send(signal.clone());
        }
    }

    // ── Resources ────────────────────────────────────────────────────────────

    /// Body of a ticket send request.
    pub fn resource_tickets(&self, details: &TicketDetails) -> Value {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        let ext_id = match &settings.ext_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        json!({
            "tagsId": null,
            "timeSend": ticket_timestamp(),
            "oddSettingsId": settings.odd_settings_id,
            "taxesSettingsId": settings.taxes_settings_id,
            "currency": settings.currency,
            "sellStaff": {
                "entityType": [{"val": "STAFF"}],
                "id": settings.unit_id,
                "name": settings.player_name,
                "lastName": null,
                "extId": ext_id,
                "extData": null,
                "parentId": null,
                "enabled": null,
                "testMode": null,
                "hardwareId": null,
                "pinHash": null
            },
            "gameType": {"val": "ME"},
            "details": details,
        })
    }

    // ── Rotation ─────────────────────────────────────────────────────────────

    /// Load the persisted rotation, resetting it to the live games when
    /// any of them is missing.
    pub async fn load_rotation(&self) -> Result<()> {
        let path = self.store.user_data_path(&self.username);
        let stored: Vec<u32> = match self.store.read(&path).await {
            Ok(Some(body)) => serde_json::from_value(body["data"].clone()).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("[{}] unreadable rotation: {:#}", self.username, e);
                Vec::new()
            }
        };
        let mut game_map = self.game_map.lock().await;
        if self.live_games.iter().any(|g| !stored.contains(g)) {
            *game_map = self.live_games.clone();
            self.store
                .write(&path, &json!({ "data": *game_map }))
                .await?;
        } else {
            *game_map = stored;
        }
        Ok(())
    }

    pub async fn game_map(&self) -> Vec<u32> {
        self.game_map.lock().await.clone()
    }

    /// Move `game_id` to the back of the rotation after one of its
    /// tickets went through.
    pub async fn rotate(&self, game_id: u32) -> Result<()> {
        if !self.competition_align {
            return Ok(());
        }
        let snapshot = {
            let mut game_map = self.game_map.lock().await;
            game_map.retain(|g| *g != game_id);
            game_map.push(game_id);
            game_map.clone()
        };
        let path = self.store.user_data_path(&self.username);
        self.store.write(&path, &json!({ "data": snapshot })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::ticket::Ticket;
    use approx::assert_relative_eq;

    fn session(demo: bool, align: bool, name: &str) -> (Session, std::path::PathBuf) {
        let root = std::env::temp_dir().join(format!("vbet-session-{}-{}", name, std::process::id()));
        let store = Store::open_in_memory(&root).unwrap();
        let accounts = Arc::new(AccountManager::new(demo, 100.0));
        (
            Session::new("0700", demo, align, vec![14035, 14036, 14045], accounts, store),
            root,
        )
    }

    fn login_body() -> Value {
        json!({
            "sessionStatus": {"credit": 250.5, "jackpots": [{"bonusLevel": 2, "amount": 60.0}]},
            "displays": [
                {"content": {"playlistId": 14036, "countDown": 0, "offset": 0}},
                {"content": {"playlistId": 14045, "countDown": 180, "offset": 30}}
            ],
            "gameSettings": [{
                "gameType": {"val": "GL"},
                "limits": [{"currencyCode": "KES", "minStake": 10, "maxStake": 20000, "maxPayout": 200000}]
            }],
            "auth": {"unit": {"id": 991, "extId": 4411, "name": "0700"}},
            "localization": {"currencySett": {"currency": {"code": "KES"}}},
            "taxesSettings": {"taxesSettingsId": 3},
            "extData": null,
            "oddSettingsId": 8
        })
    }

    #[tokio::test]
    async fn login_configures_settings_limits_and_credit() {
        let (session, root) = session(false, false, "login");
        session.setup_session(&login_body()).await;

        let settings = session.settings();
        assert_eq!(settings.unit_id, Some(991));
        assert_eq!(settings.odd_settings_id, json!(8));
        assert_eq!(settings.taxes_settings_id, json!(3));
        assert!(!session.playlist(14036).unwrap().is_scheduled());
        assert!(session.playlist(14045).unwrap().is_scheduled());
        assert_eq!(settings.limits["GL"].currency.as_deref(), Some("KES"));

        assert_relative_eq!(session.accounts().credit().await, 250.5, epsilon = 1e-9);
        assert_eq!(session.accounts().bonus_level(), 2);
        // stake limits now clamp proposals
        assert_relative_eq!(session.accounts().normalize_amount(6.0), 10.0, epsilon = 1e-9);

        let body = session.resource_tickets(&Ticket::new(14036, "x").details(14036));
        assert_eq!(body["sellStaff"]["extId"], "4411");
        assert_eq!(body["sellStaff"]["id"], 991);
        assert_eq!(body["gameType"]["val"], "ME");
        assert_eq!(body["details"]["ticketType"], "MULTIPLE");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn demo_credit_is_not_overwritten_by_platform() {
        let (session, root) = session(true, false, "demo");
        session.setup_session(&login_body()).await;
        assert_relative_eq!(session.accounts().credit().await, 100.0, epsilon = 1e-9);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn jackpot_window_toggles_sync_and_notifies_competitions() {
        let (session, root) = session(false, false, "jackpot");
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.register_competition(14036, tx);

        let ready = json!({"credit": 0, "jackpots": [{"bonusLevel": 6, "amount": 2490.0}]});
        session.process_session_status(&ready).await;
        assert!(session.jackpot_ready());
        assert!(!session.sync_flag().load(Ordering::SeqCst));
        assert_eq!(rx.try_recv().unwrap(), CompetitionSignal::Jackpot(true));

        let over = json!({"credit": 0, "jackpots": [{"bonusLevel": 0, "amount": 5.0}]});
        session.process_session_status(&over).await;
        assert!(!session.jackpot_ready());
        assert!(session.sync_flag().load(Ordering::SeqCst));
        assert_eq!(rx.try_recv().unwrap(), CompetitionSignal::Jackpot(false));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn rotation_resets_then_rotates_on_registered_tickets() {
        let (session, root) = session(true, true, "rotation");
        session.load_rotation().await.unwrap();
        assert_eq!(session.game_map().await, vec![14035, 14036, 14045]);
        assert_eq!(session.game_map().await.first(), Some(&14035));

        session.rotate(14035).await.unwrap();
        assert_eq!(session.game_map().await, vec![14036, 14045, 14035]);

        let path = session.store().user_data_path("0700");
        let stored = session.store().read(&path).await.unwrap().unwrap();
        assert_eq!(stored, json!({"data": [14036, 14045, 14035]}));

        // a complete stored rotation is kept as is
        session.load_rotation().await.unwrap();
        assert_eq!(session.game_map().await.first(), Some(&14036));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn rotation_keeps_every_game_once() {
        let (session, root) = session(true, true, "rotation-repeat");
        session.load_rotation().await.unwrap();

        // two tickets of the same game in a row
        session.rotate(14035).await.unwrap();
        session.rotate(14035).await.unwrap();
        assert_eq!(session.game_map().await, vec![14036, 14045, 14035]);

        session.rotate(14045).await.unwrap();
        assert_eq!(session.game_map().await, vec![14036, 14035, 14045]);
        let _ = std::fs::remove_dir_all(root);
    }
}
