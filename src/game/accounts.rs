//! Per-user ledger and the per-strategy staking policies that draw on it.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

pub const MIN_BET_AMOUNT: f64 = 5.0;

/// Jackpot thresholds per bonus level.
pub const BONUS_LEVELS: [f64; 6] = [25.0, 50.0, 125.0, 500.0, 1250.0, 2500.0];

/// Share of the top bonus level at which the jackpot window opens.
const JACKPOT_READY_PERCENT: f64 = 99.3;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Remote stake bounds for one game type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StakeLimits {
    pub min_stake: f64,
    pub max_stake: f64,
}

#[derive(Debug)]
struct Progress {
    bonus_level: i64,
    jackpot_amount: f64,
    total_stake: f64,
    lost_amount: f64,
    limits: Option<StakeLimits>,
}

/// The single credit ledger of a user.
pub struct AccountManager {
    demo: bool,
    min_bet: f64,
    bonus_mode: bool,
    bonus_total: f64,
    credit: tokio::sync::Mutex<f64>,
    progress: Mutex<Progress>,
}

impl AccountManager {
    pub fn new(demo: bool, credit: f64) -> Self {
        AccountManager {
            demo,
            min_bet: MIN_BET_AMOUNT,
            bonus_mode: false,
            bonus_total: 0.0,
            credit: tokio::sync::Mutex::new(credit),
            progress: Mutex::new(Progress {
                bonus_level: 0,
                jackpot_amount: BONUS_LEVELS[0],
                total_stake: 0.0,
                lost_amount: 0.0,
                limits: None,
            }),
        }
    }

    pub fn with_min_bet(mut self, min_bet: f64) -> Self {
        self.min_bet = min_bet;
        self
    }

    /// Open the jackpot window once `target` has been staked instead of
    /// waiting for the platform jackpot.
    pub fn with_bonus_target(mut self, target: f64) -> Self {
        self.bonus_mode = true;
        self.bonus_total = target;
        self
    }

    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_demo(&self) -> bool {
        self.demo
    }

    pub async fn credit(&self) -> f64 {
        let credit = *self.credit.lock().await;
        if self.demo {
            round2(credit)
        } else {
            credit
        }
    }

    pub async fn update(&self, credit: f64) {
        *self.credit.lock().await = credit;
    }

    pub async fn fund(&self, amount: f64) {
        *self.credit.lock().await += amount;
    }

    /// Debit `amount` (rounded to cents) if the balance covers it.
    pub async fn borrow(&self, amount: f64) -> Option<f64> {
        let amount = round2(amount);
        let mut credit = self.credit.lock().await;
        if *credit >= amount {
            *credit -= amount;
            Some(amount)
        } else {
            None
        }
    }

    /// Winnings only move the local balance in demo mode; live balances
    /// come from the platform.
    pub async fn on_win(&self, amount: f64) {
        if self.demo {
            self.fund(amount).await;
        }
    }

    pub async fn on_loose(&self, amount: f64) {
        self.progress().lost_amount += amount;
    }

    pub fn lost_amount(&self) -> f64 {
        self.progress().lost_amount
    }

    pub fn set_stake_limits(&self, limits: Option<StakeLimits>) {
        self.progress().limits = limits;
    }

    /// Clamp to the platform's stake bounds, then to the minimum bet.
    pub fn normalize_amount(&self, amount: f64) -> f64 {
        let mut amount = amount;
        if let Some(limits) = self.progress().limits {
            if amount < limits.min_stake {
                amount = limits.min_stake;
            }
            if amount > limits.max_stake {
                amount = limits.max_stake;
            }
        }
        if amount < self.min_bet {
            amount = self.min_bet;
        }
        round2(amount)
    }

    pub fn add_stake(&self, stake: f64) {
        self.progress().total_stake += stake;
    }

    pub fn total_stake(&self) -> f64 {
        self.progress().total_stake
    }

    /// A missing level from the platform is stored as -1.
    pub fn set_bonus_level(&self, level: Option<i64>) {
        self.progress().bonus_level = level.unwrap_or(-1);
    }

    pub fn bonus_level(&self) -> i64 {
        self.progress().bonus_level
    }

    pub fn set_jackpot_amount(&self, amount: f64) {
        self.progress().jackpot_amount = amount;
    }

    pub fn jackpot_amount(&self) -> f64 {
        self.progress().jackpot_amount
    }

    /// Jackpot progress towards the current level, in percent.
    pub fn jackpot_value(&self) -> f64 {
        let p = self.progress();
        if p.bonus_level < 0 {
            return 0.0;
        }
        let idx = (p.bonus_level as usize).min(BONUS_LEVELS.len() - 1);
        round2(p.jackpot_amount / BONUS_LEVELS[idx] * 100.0)
    }

    pub fn is_bonus_ready(&self) -> bool {
        let p = self.progress();
        if self.bonus_mode {
            return p.total_stake >= self.bonus_total;
        }
        if p.bonus_level == BONUS_LEVELS.len() as i64 {
            let top = BONUS_LEVELS[BONUS_LEVELS.len() - 1];
            return p.jackpot_amount / top * 100.0 >= JACKPOT_READY_PERCENT;
        }
        false
    }
}

/// Stake sizing owned by one strategy.
#[async_trait]
pub trait StakingPolicy: Send + Sync {
    /// Stake for a bet at `odds`. Odds-independent policies ignore it.
    fn stake(&mut self, odds: f64) -> f64;

    async fn on_win(&mut self, amount: f64);

    async fn on_loose(&mut self, amount: f64);
}

/// Bookkeeping shared by every staking policy.
pub struct Account {
    manager: Arc<AccountManager>,
    won_amount: f64,
    lost_amount: f64,
    initial_token: f64,
    profit_token: f64,
}

impl Account {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        Account {
            manager,
            won_amount: 0.0,
            lost_amount: 5.0,
            initial_token: 5.0,
            profit_token: 0.0,
        }
    }

    pub fn manager(&self) -> &Arc<AccountManager> {
        &self.manager
    }

    pub fn won_amount(&self) -> f64 {
        self.won_amount
    }

    pub fn lost_amount(&self) -> f64 {
        self.lost_amount
    }

    pub fn normalize_stake(&self, amount: f64) -> f64 {
        self.manager.normalize_amount(amount)
    }

    async fn on_win(&mut self, amount: f64) {
        self.manager.on_win(amount).await;
        self.won_amount += amount;
    }

    async fn on_loose(&mut self, amount: f64) {
        self.manager.on_loose(amount).await;
        self.lost_amount += amount;
    }
}

/// Martingale-style recovery: every stake aims to win back what has been
/// lost since the last win.
pub struct RecoverAccount {
    pub base: Account,
    amount_lost: f64,
    max_stake: f64,
    max_stake_lost: f64,
}

impl RecoverAccount {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        let base = Account::new(manager);
        RecoverAccount {
            amount_lost: base.initial_token,
            base,
            max_stake: 100_000.0,
            max_stake_lost: 100_000.0,
        }
    }

    pub fn amount_lost(&self) -> f64 {
        self.amount_lost
    }
}

#[async_trait]
impl StakingPolicy for RecoverAccount {
    fn stake(&mut self, odds: f64) -> f64 {
        let stake = self.amount_lost / (odds - 1.0);
        if stake > self.max_stake || stake + self.amount_lost > self.max_stake_lost {
            self.amount_lost = self.base.initial_token;
            return self.amount_lost / (odds - 1.0);
        }
        stake
    }

    async fn on_win(&mut self, amount: f64) {
        self.base.on_win(amount).await;
        self.amount_lost = self.base.initial_token;
    }

    async fn on_loose(&mut self, amount: f64) {
        self.base.on_loose(amount).await;
        self.amount_lost += amount + self.base.profit_token;
    }
}

/// Recovery spread over four wins instead of one.
pub struct RecoverAccountShare {
    pub base: Account,
    amount_lost: f64,
}

impl RecoverAccountShare {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        let base = Account::new(manager);
        RecoverAccountShare {
            amount_lost: base.initial_token,
            base,
        }
    }

    pub fn amount_lost(&self) -> f64 {
        self.amount_lost
    }
}

#[async_trait]
impl StakingPolicy for RecoverAccountShare {
    fn stake(&mut self, odds: f64) -> f64 {
        (self.amount_lost / 4.0) / (odds - 1.0)
    }

    async fn on_win(&mut self, amount: f64) {
        self.base.on_win(amount).await;
        self.amount_lost = (self.amount_lost - amount).max(self.base.initial_token);
    }

    async fn on_loose(&mut self, amount: f64) {
        self.base.on_loose(amount).await;
        self.amount_lost += amount + self.base.profit_token;
    }
}

/// Cycles through fixed chip sizes: one step per loss, back to the first
/// chip on a win.
pub struct TokenAccount {
    pub base: Account,
    chips: Vec<f64>,
    index: usize,
}

impl TokenAccount {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        TokenAccount {
            base: Account::new(manager),
            chips: vec![100.0, 150.0, 75.0, 75.0, 100.0],
            index: 0,
        }
    }
}

#[async_trait]
impl StakingPolicy for TokenAccount {
    fn stake(&mut self, _odds: f64) -> f64 {
        self.chips[self.index]
    }

    async fn on_win(&mut self, amount: f64) {
        self.base.on_win(amount).await;
        self.index = 0;
    }

    async fn on_loose(&mut self, amount: f64) {
        self.index = (self.index + 1) % self.chips.len();
        self.base.on_loose(amount).await;
    }
}

pub struct FixedStake {
    pub base: Account,
    stake: f64,
}

impl FixedStake {
    pub fn new(manager: Arc<AccountManager>, stake: f64) -> Self {
        FixedStake {
            base: Account::new(manager),
            stake,
        }
    }
}

#[async_trait]
impl StakingPolicy for FixedStake {
    fn stake(&mut self, _odds: f64) -> f64 {
        self.stake
    }

    async fn on_win(&mut self, amount: f64) {
        self.base.on_win(amount).await;
    }

    async fn on_loose(&mut self, amount: f64) {
        self.base.on_loose(amount).await;
    }
}

/// Stakes whatever realises a fixed profit at the given odds.
pub struct FixedProfitAccount {
    pub base: Account,
    profit: f64,
}

impl FixedProfitAccount {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        FixedProfitAccount {
            base: Account::new(manager),
            profit: 5.0,
        }
    }
}

#[async_trait]
impl StakingPolicy for FixedProfitAccount {
    fn stake(&mut self, odds: f64) -> f64 {
        round2(self.profit / (odds - 1.0))
    }

    async fn on_win(&mut self, amount: f64) {
        self.base.on_win(amount).await;
    }

    async fn on_loose(&mut self, amount: f64) {
        self.base.on_loose(amount).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn manager(credit: f64) -> Arc<AccountManager> {
        Arc::new(AccountManager::new(true, credit))
    }

    #[tokio::test]
    async fn test_borrow_only_when_covered() {
        let m = manager(10.0);
        assert_eq!(m.borrow(4.999).await, Some(5.0));
        assert_eq!(m.borrow(6.0).await, None);
        assert_relative_eq!(m.credit().await, 5.0, epsilon = 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_borrow_and_fund_balance() {
        let m = manager(100.0);
        let mut handles = Vec::new();
        for i in 0..200 {
            let m = m.clone();
            handles.push(tokio::spawn(async move {
                if i % 3 == 0 {
                    m.fund(7.0).await;
                    (7.0, 0.0)
                } else {
                    let borrowed = m.borrow(13.0).await.unwrap_or(0.0);
                    (0.0, borrowed)
                }
            }));
        }
        let (mut funded, mut borrowed) = (0.0, 0.0);
        for h in handles {
            let (f, b) = h.await.unwrap();
            funded += f;
            borrowed += b;
        }
        let credit = m.credit().await;
        assert!(credit >= 0.0);
        assert_relative_eq!(credit, 100.0 + funded - borrowed, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_recover_loss_adds_stake_and_win_resets() {
        let m = manager(1000.0);
        let mut acc = RecoverAccount::new(m.clone());
        assert_relative_eq!(acc.stake(2.0), 5.0, epsilon = 1e-9);

        acc.on_loose(5.0).await;
        assert_relative_eq!(acc.amount_lost(), 10.0, epsilon = 1e-9);
        assert_relative_eq!(acc.stake(3.0), 5.0, epsilon = 1e-9);
        acc.on_loose(5.0).await;
        assert_relative_eq!(acc.amount_lost(), 15.0, epsilon = 1e-9);
        assert_relative_eq!(m.lost_amount(), 10.0, epsilon = 1e-9);

        acc.on_win(30.0).await;
        assert_relative_eq!(acc.amount_lost(), 5.0, epsilon = 1e-9);
        // demo winnings are credited back
        assert_relative_eq!(m.credit().await, 1030.0, epsilon = 1e-9);
    }

    #[test]
    fn test_recover_cap_resets_loss() {
        let mut acc = RecoverAccount::new(manager(0.0));
        acc.amount_lost = 90_000.0;
        // 90000 / 0.5 = 180000 > max stake
        assert_relative_eq!(acc.stake(1.5), 10.0, epsilon = 1e-9);
        assert_relative_eq!(acc.amount_lost(), 5.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_recover_share_quarter_and_floor() {
        let mut acc = RecoverAccountShare::new(manager(0.0));
        acc.on_loose(35.0).await;
        assert_relative_eq!(acc.stake(2.0), 10.0, epsilon = 1e-9);
        acc.on_win(20.0).await;
        assert_relative_eq!(acc.amount_lost(), 20.0, epsilon = 1e-9);
        acc.on_win(100.0).await;
        assert_relative_eq!(acc.amount_lost(), 5.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_token_chips_wrap_and_reset() {
        let mut acc = TokenAccount::new(manager(0.0));
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(acc.stake(2.0));
            acc.on_loose(1.0).await;
        }
        assert_eq!(seen, vec![100.0, 150.0, 75.0, 75.0, 100.0, 100.0]);
        assert_relative_eq!(acc.stake(2.0), 150.0, epsilon = 1e-9);
        acc.on_win(1.0).await;
        assert_relative_eq!(acc.stake(2.0), 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fixed_profit_and_fixed_stake() {
        let mut profit = FixedProfitAccount::new(manager(0.0));
        assert_relative_eq!(profit.stake(1.5), 10.0, epsilon = 1e-9);
        assert_relative_eq!(profit.stake(4.0), 1.67, epsilon = 1e-9);
        let mut fixed = FixedStake::new(manager(0.0), 50.0);
        assert_relative_eq!(fixed.stake(9.0), 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_normalize_amount_clamps_then_floors() {
        let m = manager(0.0);
        assert_relative_eq!(m.normalize_amount(1.234), 5.0, epsilon = 1e-9);
        m.set_stake_limits(Some(StakeLimits {
            min_stake: 10.0,
            max_stake: 20_000.0,
        }));
        assert_relative_eq!(m.normalize_amount(3.0), 10.0, epsilon = 1e-9);
        assert_relative_eq!(m.normalize_amount(12.346), 12.35, epsilon = 1e-9);
        assert_relative_eq!(m.normalize_amount(50_000.0), 20_000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bonus_ready() {
        let m = AccountManager::new(false, 0.0);
        m.set_bonus_level(Some(6));
        m.set_jackpot_amount(2480.0);
        assert!(!m.is_bonus_ready());
        m.set_jackpot_amount(2485.0);
        assert!(m.is_bonus_ready());
        m.set_bonus_level(Some(5));
        assert!(!m.is_bonus_ready());
        m.set_bonus_level(None);
        assert_eq!(m.jackpot_value(), 0.0);

        let target = AccountManager::new(true, 0.0).with_bonus_target(100.0);
        target.add_stake(60.0);
        assert!(!target.is_bonus_ready());
        target.add_stake(40.0);
        assert!(target.is_bonus_ready());
    }
}
