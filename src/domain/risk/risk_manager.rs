//! Pre-trade risk gate and post-trade position/PnL bookkeeping.
//!
//! [`RiskManager::check_order`] is the hot path: every limit field and every
//! counter it reads is a relaxed atomic load, ending in a single fetch-add
//! for the rate-limit counter. No lock is ever taken there, so a concurrent
//! [`RiskManager::update_limits`] can tear across fields without blocking or
//! poisoning a check in flight. Only `halt_reason` and `daily_reset_time_ms`,
//! which have no hot-path reader, live behind a short-lived mutex.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde_json::{json, Value};

use crate::domain::config::RiskLimits;
use crate::domain::types::OrderSide;
use crate::infrastructure::audit::{AuditEvent, AuditEventType, AuditLogger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskCheckResult {
    Approved,
    RejectedPositionLimit,
    RejectedExposureLimit,
    RejectedDrawdownLimit,
    RejectedDailyLossLimit,
    RejectedOrderSizeLimit,
    RejectedRateLimit,
    RejectedCircuitBreaker,
    RejectedVolumeLimit,
    RejectedHalted,
}

impl RiskCheckResult {
    pub fn is_approved(self) -> bool {
        self == RiskCheckResult::Approved
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskCheckResult::Approved => "APPROVED",
            RiskCheckResult::RejectedPositionLimit => "REJECTED_POSITION_LIMIT",
            RiskCheckResult::RejectedExposureLimit => "REJECTED_EXPOSURE_LIMIT",
            RiskCheckResult::RejectedDrawdownLimit => "REJECTED_DRAWDOWN_LIMIT",
            RiskCheckResult::RejectedDailyLossLimit => "REJECTED_DAILY_LOSS_LIMIT",
            RiskCheckResult::RejectedOrderSizeLimit => "REJECTED_ORDER_SIZE_LIMIT",
            RiskCheckResult::RejectedRateLimit => "REJECTED_RATE_LIMIT",
            RiskCheckResult::RejectedCircuitBreaker => "REJECTED_CIRCUIT_BREAKER",
            RiskCheckResult::RejectedVolumeLimit => "REJECTED_VOLUME_LIMIT",
            RiskCheckResult::RejectedHalted => "REJECTED_HALTED",
        }
    }
}

/// Point-in-time snapshot of position, PnL, and exposure counters.
///
/// Field list matches the external persistence contract exactly (see
/// `to_json`/`from_json`); it intentionally omits `current_drawdown` as a
/// stored field since it's always derived from `peak_pnl`/`total_pnl`.
#[derive(Debug, Clone, Default)]
pub struct RiskState {
    pub current_position: f64,
    pub total_pnl: f64,
    pub peak_pnl: f64,
    pub daily_pnl: f64,
    pub daily_volume: f64,
    pub current_drawdown: f64,
    pub net_exposure: f64,
    pub gross_exposure: f64,
    pub is_halted: bool,
    pub halt_reason: String,
    pub last_update_time_ns: u64,
    pub daily_reset_time_ms: u64,
    pub orders_this_second: u32,
    pub current_second: u64,
}

pub type HedgeCallback = Box<dyn Fn(OrderSide, f64) + Send + Sync>;

/// Every field `check_order`'s hot path (or the equally lock-free
/// `needs_hedge`/utilization getters) consults, stored as relaxed atomics so
/// a concurrent [`RiskManager::update_limits`] never blocks a check. A
/// reader can observe one limit from the old config and another from the
/// new one mid-update; that torn read is accepted the same way the source's
/// lock-free limit reads accept it.
struct LimitsSnapshot {
    max_position_size: AtomicU64,
    max_notional_exposure: AtomicU64,
    max_net_exposure: AtomicU64,
    max_gross_exposure: AtomicU64,
    max_drawdown_pct: AtomicU64,
    daily_loss_limit: AtomicU64,
    max_order_size: AtomicU64,
    max_order_value: AtomicU64,
    max_daily_volume: AtomicU64,
    auto_hedge_enabled: AtomicBool,
    hedge_threshold_pct: AtomicU64,
    hedge_interval_ms: AtomicU64,
    max_orders_per_second: AtomicU32,
}

impl LimitsSnapshot {
    fn new(limits: &RiskLimits) -> Self {
        let snapshot = LimitsSnapshot {
            max_position_size: AtomicU64::new(0),
            max_notional_exposure: AtomicU64::new(0),
            max_net_exposure: AtomicU64::new(0),
            max_gross_exposure: AtomicU64::new(0),
            max_drawdown_pct: AtomicU64::new(0),
            daily_loss_limit: AtomicU64::new(0),
            max_order_size: AtomicU64::new(0),
            max_order_value: AtomicU64::new(0),
            max_daily_volume: AtomicU64::new(0),
            auto_hedge_enabled: AtomicBool::new(false),
            hedge_threshold_pct: AtomicU64::new(0),
            hedge_interval_ms: AtomicU64::new(0),
            max_orders_per_second: AtomicU32::new(0),
        };
        snapshot.store(limits);
        snapshot
    }

    fn store(&self, limits: &RiskLimits) {
        store_f64(&self.max_position_size, limits.max_position_size, Ordering::Relaxed);
        store_f64(&self.max_notional_exposure, limits.max_notional_exposure, Ordering::Relaxed);
        store_f64(&self.max_net_exposure, limits.max_net_exposure, Ordering::Relaxed);
        store_f64(&self.max_gross_exposure, limits.max_gross_exposure, Ordering::Relaxed);
        store_f64(&self.max_drawdown_pct, limits.max_drawdown_pct, Ordering::Relaxed);
        store_f64(&self.daily_loss_limit, limits.daily_loss_limit, Ordering::Relaxed);
        store_f64(&self.max_order_size, limits.max_order_size, Ordering::Relaxed);
        store_f64(&self.max_order_value, limits.max_order_value, Ordering::Relaxed);
        store_f64(&self.max_daily_volume, limits.max_daily_volume, Ordering::Relaxed);
        self.auto_hedge_enabled.store(limits.auto_hedge_enabled, Ordering::Relaxed);
        store_f64(&self.hedge_threshold_pct, limits.hedge_threshold_pct, Ordering::Relaxed);
        self.hedge_interval_ms.store(limits.hedge_interval_ms, Ordering::Relaxed);
        self.max_orders_per_second.store(limits.max_orders_per_second, Ordering::Relaxed);
    }

    fn load(&self) -> RiskLimits {
        RiskLimits {
            max_position_size: load_f64(&self.max_position_size, Ordering::Relaxed),
            max_notional_exposure: load_f64(&self.max_notional_exposure, Ordering::Relaxed),
            max_net_exposure: load_f64(&self.max_net_exposure, Ordering::Relaxed),
            max_gross_exposure: load_f64(&self.max_gross_exposure, Ordering::Relaxed),
            max_drawdown_pct: load_f64(&self.max_drawdown_pct, Ordering::Relaxed),
            daily_loss_limit: load_f64(&self.daily_loss_limit, Ordering::Relaxed),
            max_order_size: load_f64(&self.max_order_size, Ordering::Relaxed),
            max_order_value: load_f64(&self.max_order_value, Ordering::Relaxed),
            max_daily_volume: load_f64(&self.max_daily_volume, Ordering::Relaxed),
            auto_hedge_enabled: self.auto_hedge_enabled.load(Ordering::Relaxed),
            hedge_threshold_pct: load_f64(&self.hedge_threshold_pct, Ordering::Relaxed),
            hedge_interval_ms: self.hedge_interval_ms.load(Ordering::Relaxed),
            max_orders_per_second: self.max_orders_per_second.load(Ordering::Relaxed),
        }
    }
}

struct MutState {
    halt_reason: String,
    daily_reset_time_ms: u64,
}

pub struct RiskManager {
    position: AtomicU64,
    total_pnl: AtomicU64,
    peak_pnl: AtomicU64,
    daily_pnl: AtomicU64,
    daily_volume: AtomicU64,
    net_exposure: AtomicU64,
    gross_exposure: AtomicU64,
    halted: AtomicBool,
    orders_this_second: std::sync::atomic::AtomicU32,
    current_second: AtomicU64,

    limits: LimitsSnapshot,
    state: Mutex<MutState>,
    hedge_callback: Mutex<Option<HedgeCallback>>,
    hedge_running: Arc<AtomicBool>,
    hedge_thread: Mutex<Option<JoinHandle<()>>>,
    audit: Arc<AuditLogger>,
}

fn load_f64(a: &AtomicU64, order: Ordering) -> f64 {
    f64::from_bits(a.load(order))
}

fn store_f64(a: &AtomicU64, v: f64, order: Ordering) {
    a.store(v.to_bits(), order)
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Arc<Self> {
        Self::with_audit(limits, Arc::new(AuditLogger::new()))
    }

    /// Same as [`RiskManager::new`] but sharing a caller-supplied audit
    /// trail instead of creating a private one.
    pub fn with_audit(limits: RiskLimits, audit: Arc<AuditLogger>) -> Arc<Self> {
        let now = now_millis();
        let manager = Arc::new(RiskManager {
            position: AtomicU64::new(0f64.to_bits()),
            total_pnl: AtomicU64::new(0f64.to_bits()),
            peak_pnl: AtomicU64::new(0f64.to_bits()),
            daily_pnl: AtomicU64::new(0f64.to_bits()),
            daily_volume: AtomicU64::new(0f64.to_bits()),
            net_exposure: AtomicU64::new(0f64.to_bits()),
            gross_exposure: AtomicU64::new(0f64.to_bits()),
            halted: AtomicBool::new(false),
            orders_this_second: std::sync::atomic::AtomicU32::new(0),
            current_second: AtomicU64::new(0),
            limits: LimitsSnapshot::new(&limits),
            state: Mutex::new(MutState { halt_reason: String::new(), daily_reset_time_ms: now }),
            hedge_callback: Mutex::new(None),
            hedge_running: Arc::new(AtomicBool::new(false)),
            hedge_thread: Mutex::new(None),
            audit,
        });

        tracing::info!(
            max_position = limits.max_position_size,
            max_order_size = limits.max_order_size,
            daily_loss_limit = limits.daily_loss_limit,
            max_drawdown_pct = limits.max_drawdown_pct,
            "risk manager initialized"
        );

        if limits.auto_hedge_enabled {
            manager.start_hedge_loop();
        }

        manager
    }

    /// Resets all counters and re-applies `limits`, restarting the
    /// auto-hedge thread if newly enabled. Mirrors `new` but on an existing
    /// instance, for test setup and disaster-recovery restarts.
    pub fn initialize(self: &Arc<Self>, limits: RiskLimits) {
        self.stop_hedge_loop();
        self.limits.store(&limits);
        {
            let mut state = self.state.lock().unwrap();
            state.daily_reset_time_ms = now_millis();
            state.halt_reason.clear();
        }
        store_f64(&self.position, 0.0, Ordering::Relaxed);
        store_f64(&self.total_pnl, 0.0, Ordering::Relaxed);
        store_f64(&self.peak_pnl, 0.0, Ordering::Relaxed);
        store_f64(&self.daily_pnl, 0.0, Ordering::Relaxed);
        store_f64(&self.daily_volume, 0.0, Ordering::Relaxed);
        store_f64(&self.net_exposure, 0.0, Ordering::Relaxed);
        store_f64(&self.gross_exposure, 0.0, Ordering::Relaxed);
        self.halted.store(false, Ordering::Relaxed);
        self.orders_this_second.store(0, Ordering::Relaxed);
        self.current_second.store(0, Ordering::Relaxed);

        if limits.auto_hedge_enabled {
            self.start_hedge_loop();
        }
    }

    /// Lock-free hot path. Checks run in a fixed order; the first failure
    /// short-circuits the rest. `symbol` is accepted for API parity with the
    /// consumer contract and future per-instrument breakdowns; this single
    /// risk manager instance aggregates across whatever the caller feeds it,
    /// so it plays no role in the checks themselves.
    pub fn check_order(&self, side: OrderSide, price: f64, quantity: f64, symbol: &str) -> RiskCheckResult {
        let _ = symbol;
        if self.halted.load(Ordering::Acquire) {
            return RiskCheckResult::RejectedHalted;
        }

        let now_sec = now_seconds();
        let prev_sec = self.current_second.load(Ordering::Relaxed);
        if now_sec != prev_sec
            && self.current_second.compare_exchange(prev_sec, now_sec, Ordering::Relaxed, Ordering::Relaxed).is_ok()
        {
            self.orders_this_second.store(0, Ordering::Relaxed);
        }

        let max_ops = self.limits.max_orders_per_second.load(Ordering::Relaxed);
        let current_ops = self.orders_this_second.fetch_add(1, Ordering::Relaxed);
        if u64::from(current_ops) >= u64::from(max_ops) {
            return RiskCheckResult::RejectedRateLimit;
        }

        let max_order_size = load_f64(&self.limits.max_order_size, Ordering::Relaxed);
        let max_order_value = load_f64(&self.limits.max_order_value, Ordering::Relaxed);
        if quantity > max_order_size || (price * quantity) > max_order_value {
            return RiskCheckResult::RejectedOrderSizeLimit;
        }

        let current_pos = load_f64(&self.position, Ordering::Relaxed);
        let projected_pos = current_pos + side.sign() * quantity;
        let max_pos = load_f64(&self.limits.max_position_size, Ordering::Relaxed);
        if projected_pos.abs() > max_pos {
            return RiskCheckResult::RejectedPositionLimit;
        }

        let current_vol = load_f64(&self.daily_volume, Ordering::Relaxed);
        let max_daily_vol = load_f64(&self.limits.max_daily_volume, Ordering::Relaxed);
        if current_vol + quantity > max_daily_vol {
            return RiskCheckResult::RejectedVolumeLimit;
        }

        let daily_pnl = load_f64(&self.daily_pnl, Ordering::Relaxed);
        let daily_loss_limit = load_f64(&self.limits.daily_loss_limit, Ordering::Relaxed);
        if daily_pnl < 0.0 && daily_pnl.abs() >= daily_loss_limit {
            return RiskCheckResult::RejectedDailyLossLimit;
        }

        let peak_pnl = load_f64(&self.peak_pnl, Ordering::Relaxed);
        let total_pnl = load_f64(&self.total_pnl, Ordering::Relaxed);
        let drawdown_pct = if peak_pnl > 0.0 { (peak_pnl - total_pnl) / peak_pnl * 100.0 } else { 0.0 };
        let max_drawdown_pct = load_f64(&self.limits.max_drawdown_pct, Ordering::Relaxed);
        if drawdown_pct >= max_drawdown_pct {
            return RiskCheckResult::RejectedDrawdownLimit;
        }

        let notional = price * quantity;
        let gross = load_f64(&self.gross_exposure, Ordering::Relaxed);
        let net = load_f64(&self.net_exposure, Ordering::Relaxed);
        let projected_gross = gross + notional;
        let projected_net = net + side.sign() * notional;
        let max_gross = load_f64(&self.limits.max_gross_exposure, Ordering::Relaxed);
        let max_net = load_f64(&self.limits.max_net_exposure, Ordering::Relaxed);
        let max_notional = load_f64(&self.limits.max_notional_exposure, Ordering::Relaxed);
        if projected_gross > max_gross || projected_net.abs() > max_net || notional > max_notional {
            return RiskCheckResult::RejectedExposureLimit;
        }

        RiskCheckResult::Approved
    }

    pub fn on_fill(&self, side: OrderSide, price: f64, quantity: f64, symbol: &str) {
        let notional = price * quantity;

        let prev_pos = load_f64(&self.position, Ordering::Relaxed);
        let new_pos = prev_pos + side.sign() * quantity;
        store_f64(&self.position, new_pos, Ordering::Release);

        let prev_vol = load_f64(&self.daily_volume, Ordering::Relaxed);
        store_f64(&self.daily_volume, prev_vol + quantity, Ordering::Release);

        {
            let _guard = self.state.lock().unwrap();
            let gross = load_f64(&self.gross_exposure, Ordering::Relaxed) + notional;
            let net = load_f64(&self.net_exposure, Ordering::Relaxed) + side.sign() * notional;
            store_f64(&self.gross_exposure, gross, Ordering::Release);
            store_f64(&self.net_exposure, net, Ordering::Release);
        }

        tracing::debug!(?side, quantity, price, symbol, position = new_pos, notional, "fill applied");
        self.check_daily_reset();
    }

    pub fn on_pnl_update(&self, new_pnl: f64) {
        store_f64(&self.total_pnl, new_pnl, Ordering::Release);

        let mut current_peak = load_f64(&self.peak_pnl, Ordering::Relaxed);
        while new_pnl > current_peak {
            match self.peak_pnl.compare_exchange_weak(
                current_peak.to_bits(),
                new_pnl.to_bits(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_peak = f64::from_bits(actual),
            }
        }

        let peak = load_f64(&self.peak_pnl, Ordering::Relaxed);
        let drawdown_pct = if peak > 0.0 { (peak - new_pnl) / peak * 100.0 } else { 0.0 };

        store_f64(&self.daily_pnl, new_pnl, Ordering::Release);

        let max_drawdown = load_f64(&self.limits.max_drawdown_pct, Ordering::Relaxed);
        let daily_loss_limit = load_f64(&self.limits.daily_loss_limit, Ordering::Relaxed);

        if drawdown_pct >= max_drawdown && !self.halted.load(Ordering::Relaxed) {
            let reason = format!("drawdown limit breached: {drawdown_pct:.4}% >= {max_drawdown:.4}%");
            tracing::error!("auto-halt: {reason}");
            self.halt(&reason);
        }

        if new_pnl < 0.0 && new_pnl.abs() >= daily_loss_limit && !self.halted.load(Ordering::Relaxed) {
            let reason = format!("daily loss limit breached: {:.4} >= {:.4}", new_pnl.abs(), daily_loss_limit);
            tracing::error!("auto-halt: {reason}");
            self.halt(&reason);
        }
    }

    pub fn halt(&self, reason: &str) {
        self.halted.store(true, Ordering::Release);
        self.state.lock().unwrap().halt_reason = reason.to_string();
        tracing::warn!("trading halted: {reason}");
        self.audit.log_event(AuditEvent::new(AuditEventType::SuspiciousActivity, format!("trading halted: {reason}"), true));
    }

    pub fn resume(&self) {
        self.halted.store(false, Ordering::Release);
        self.state.lock().unwrap().halt_reason.clear();
        tracing::info!("trading resumed");
        self.audit.log_event(AuditEvent::new(AuditEventType::SystemStart, "trading resumed", true));
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn needs_hedge(&self) -> bool {
        let pos = load_f64(&self.position, Ordering::Relaxed).abs();
        let max_pos = load_f64(&self.limits.max_position_size, Ordering::Relaxed);
        let threshold_pct = load_f64(&self.limits.hedge_threshold_pct, Ordering::Relaxed);
        if max_pos <= 0.0 {
            return false;
        }
        (pos / max_pos) * 100.0 >= threshold_pct
    }

    fn evaluate_hedge(&self) {
        if !self.needs_hedge() {
            return;
        }
        let pos = load_f64(&self.position, Ordering::Relaxed);
        if pos.abs() < 1e-12 {
            return;
        }

        let callback = self.hedge_callback.lock().unwrap();
        let Some(cb) = callback.as_ref() else {
            tracing::warn!("hedge needed but no callback registered");
            return;
        };

        let position_side = if pos > 0.0 { OrderSide::Buy } else { OrderSide::Sell };
        let hedge_side = position_side.opposite();
        let hedge_qty = pos.abs();
        tracing::info!(?hedge_side, hedge_qty, "executing auto-hedge");

        let result = panic::catch_unwind(AssertUnwindSafe(|| cb(hedge_side, hedge_qty)));
        if result.is_err() {
            tracing::error!("hedge callback panicked");
        }
    }

    pub fn set_hedge_callback(&self, callback: HedgeCallback) {
        *self.hedge_callback.lock().unwrap() = Some(callback);
    }

    fn start_hedge_loop(self: &Arc<Self>) {
        if self.hedge_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = Arc::clone(self);
        let running = Arc::clone(&self.hedge_running);
        let handle = std::thread::spawn(move || {
            tracing::info!("hedge loop started");
            while running.load(Ordering::Acquire) {
                let interval_ms = manager.limits.hedge_interval_ms.load(Ordering::Relaxed);
                std::thread::sleep(std::time::Duration::from_millis(interval_ms));
                if !running.load(Ordering::Acquire) {
                    break;
                }
                manager.evaluate_hedge();
            }
            tracing::info!("hedge loop stopped");
        });
        *self.hedge_thread.lock().unwrap() = Some(handle);
    }

    fn stop_hedge_loop(&self) {
        self.hedge_running.store(false, Ordering::Release);
        if let Some(handle) = self.hedge_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn state(&self) -> RiskState {
        let peak_pnl = load_f64(&self.peak_pnl, Ordering::Relaxed);
        let total_pnl = load_f64(&self.total_pnl, Ordering::Relaxed);
        let current_drawdown = if peak_pnl > 0.0 { (peak_pnl - total_pnl) / peak_pnl * 100.0 } else { 0.0 };

        let (halt_reason, daily_reset_time_ms) = {
            let s = self.state.lock().unwrap();
            (s.halt_reason.clone(), s.daily_reset_time_ms)
        };

        RiskState {
            current_position: load_f64(&self.position, Ordering::Relaxed),
            total_pnl,
            peak_pnl,
            daily_pnl: load_f64(&self.daily_pnl, Ordering::Relaxed),
            daily_volume: load_f64(&self.daily_volume, Ordering::Relaxed),
            current_drawdown,
            net_exposure: load_f64(&self.net_exposure, Ordering::Relaxed),
            gross_exposure: load_f64(&self.gross_exposure, Ordering::Relaxed),
            is_halted: self.halted.load(Ordering::Relaxed),
            halt_reason,
            last_update_time_ns: now_nanos(),
            daily_reset_time_ms,
            orders_this_second: self.orders_this_second.load(Ordering::Relaxed),
            current_second: self.current_second.load(Ordering::Relaxed),
        }
    }

    pub fn limits(&self) -> RiskLimits {
        self.limits.load()
    }

    pub fn position(&self) -> f64 {
        load_f64(&self.position, Ordering::Relaxed)
    }

    pub fn daily_pnl(&self) -> f64 {
        load_f64(&self.daily_pnl, Ordering::Relaxed)
    }

    pub fn drawdown(&self) -> f64 {
        let peak = load_f64(&self.peak_pnl, Ordering::Relaxed);
        let total = load_f64(&self.total_pnl, Ordering::Relaxed);
        if peak > 0.0 { (peak - total) / peak * 100.0 } else { 0.0 }
    }

    pub fn position_utilization(&self) -> f64 {
        let pos = load_f64(&self.position, Ordering::Relaxed).abs();
        let max_pos = load_f64(&self.limits.max_position_size, Ordering::Relaxed);
        if max_pos <= 0.0 { 0.0 } else { (pos / max_pos) * 100.0 }
    }

    pub fn daily_loss_utilization(&self) -> f64 {
        let pnl = load_f64(&self.daily_pnl, Ordering::Relaxed);
        let limit = load_f64(&self.limits.daily_loss_limit, Ordering::Relaxed);
        if limit <= 0.0 || pnl >= 0.0 { 0.0 } else { (pnl.abs() / limit) * 100.0 }
    }

    pub fn update_limits(&self, limits: RiskLimits) {
        self.limits.store(&limits);
        tracing::info!("risk limits updated");
    }

    pub fn to_json(&self) -> Value {
        let s = self.state();
        json!({
            "current_position": s.current_position,
            "total_pnl": s.total_pnl,
            "peak_pnl": s.peak_pnl,
            "daily_pnl": s.daily_pnl,
            "daily_volume": s.daily_volume,
            "current_drawdown": s.current_drawdown,
            "net_exposure": s.net_exposure,
            "gross_exposure": s.gross_exposure,
            "is_halted": s.is_halted,
            "halt_reason": s.halt_reason,
            "last_update_time": s.last_update_time_ns,
            "daily_reset_time": s.daily_reset_time_ms,
            "orders_this_second": s.orders_this_second,
            "current_second": s.current_second,
        })
    }

    pub fn from_json(&self, j: &Value) {
        let num = |key: &str| j.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        store_f64(&self.position, num("current_position"), Ordering::Relaxed);
        store_f64(&self.total_pnl, num("total_pnl"), Ordering::Relaxed);
        store_f64(&self.peak_pnl, num("peak_pnl"), Ordering::Relaxed);
        store_f64(&self.daily_pnl, num("daily_pnl"), Ordering::Relaxed);
        store_f64(&self.daily_volume, num("daily_volume"), Ordering::Relaxed);
        store_f64(&self.net_exposure, num("net_exposure"), Ordering::Relaxed);
        store_f64(&self.gross_exposure, num("gross_exposure"), Ordering::Relaxed);
        self.halted.store(j.get("is_halted").and_then(Value::as_bool).unwrap_or(false), Ordering::Relaxed);
        self.orders_this_second.store(
            j.get("orders_this_second").and_then(Value::as_u64).unwrap_or(0) as u32,
            Ordering::Relaxed,
        );
        self.current_second.store(j.get("current_second").and_then(Value::as_u64).unwrap_or(0), Ordering::Relaxed);

        let mut state = self.state.lock().unwrap();
        state.halt_reason = j.get("halt_reason").and_then(Value::as_str).unwrap_or("").to_string();
        state.daily_reset_time_ms = j.get("daily_reset_time").and_then(Value::as_u64).unwrap_or(0);
        drop(state);

        tracing::info!("risk manager state restored from JSON");
    }

    pub fn reset_daily(&self) {
        store_f64(&self.daily_pnl, 0.0, Ordering::Release);
        store_f64(&self.daily_volume, 0.0, Ordering::Release);
        self.orders_this_second.store(0, Ordering::Release);
        self.state.lock().unwrap().daily_reset_time_ms = now_millis();
        tracing::info!("daily risk counters reset");
    }

    fn check_daily_reset(&self) {
        let today_ms = today_midnight_millis();
        let last_reset = self.state.lock().unwrap().daily_reset_time_ms;
        if last_reset < today_ms {
            self.reset_daily();
        }
    }
}

impl Drop for RiskManager {
    fn drop(&mut self) {
        self.stop_hedge_loop();
    }
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

fn now_millis() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn now_seconds() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn today_midnight_millis() -> u64 {
    const MS_PER_DAY: u64 = 86_400_000;
    (now_millis() / MS_PER_DAY) * MS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_size: 10.0,
            max_notional_exposure: 1_000_000.0,
            max_net_exposure: 500_000.0,
            max_gross_exposure: 2_000_000.0,
            max_drawdown_pct: 5.0,
            daily_loss_limit: 10_000.0,
            max_order_size: 5.0,
            max_order_value: 50_000.0,
            max_daily_volume: 100.0,
            auto_hedge_enabled: false,
            hedge_threshold_pct: 50.0,
            hedge_interval_ms: 5000,
            max_orders_per_second: 3,
        }
    }

    #[test]
    fn approves_order_within_all_limits() {
        let rm = RiskManager::new(limits());
        assert_eq!(rm.check_order(OrderSide::Buy, 100.0, 1.0, "TEST"), RiskCheckResult::Approved);
    }

    #[test]
    fn rejects_halted() {
        let rm = RiskManager::new(limits());
        rm.halt("manual test halt");
        assert_eq!(rm.check_order(OrderSide::Buy, 100.0, 1.0, "TEST"), RiskCheckResult::RejectedHalted);
    }

    #[test]
    fn rejects_order_size_over_limit() {
        let rm = RiskManager::new(limits());
        assert_eq!(rm.check_order(OrderSide::Buy, 100.0, 6.0, "TEST"), RiskCheckResult::RejectedOrderSizeLimit);
    }

    #[test]
    fn rejects_position_limit_breach() {
        let rm = RiskManager::new(limits());
        rm.on_fill(OrderSide::Buy, 100.0, 5.0, "TEST");
        rm.on_fill(OrderSide::Buy, 100.0, 5.0, "TEST");
        assert_eq!(rm.check_order(OrderSide::Buy, 100.0, 1.0, "TEST"), RiskCheckResult::RejectedPositionLimit);
    }

    #[test]
    fn rate_limit_trips_after_max_orders_per_second() {
        let rm = RiskManager::new(limits());
        for _ in 0..3 {
            assert_eq!(rm.check_order(OrderSide::Buy, 1.0, 0.1, "TEST"), RiskCheckResult::Approved);
        }
        assert_eq!(rm.check_order(OrderSide::Buy, 1.0, 0.1, "TEST"), RiskCheckResult::RejectedRateLimit);
    }

    #[test]
    fn drawdown_breach_auto_halts() {
        let rm = RiskManager::new(limits());
        rm.on_pnl_update(1000.0);
        rm.on_pnl_update(900.0);
        assert!(rm.is_halted());
        assert!(rm.drawdown() >= 5.0);
    }

    #[test]
    fn daily_loss_breach_auto_halts() {
        let rm = RiskManager::new(limits());
        rm.on_pnl_update(-10_001.0);
        assert!(rm.is_halted());
    }

    #[test]
    fn peak_pnl_only_increases() {
        let rm = RiskManager::new(limits());
        rm.on_pnl_update(500.0);
        rm.on_pnl_update(200.0);
        assert_eq!(rm.state().peak_pnl, 500.0);
    }

    #[test]
    fn halt_then_resume_clears_reason() {
        let rm = RiskManager::new(limits());
        rm.halt("test");
        assert!(rm.is_halted());
        assert_eq!(rm.state().halt_reason, "test");
        rm.resume();
        assert!(!rm.is_halted());
        assert_eq!(rm.state().halt_reason, "");
    }

    #[test]
    fn halt_and_resume_are_recorded_in_the_audit_trail() {
        let audit = Arc::new(AuditLogger::new());
        let rm = RiskManager::with_audit(limits(), Arc::clone(&audit));
        rm.halt("manual test halt");
        rm.resume();

        let events = audit.recent_events(10);
        assert!(events.iter().any(|e| e.description.contains("trading halted")));
        assert!(events.iter().any(|e| e.description.contains("trading resumed")));
    }

    #[test]
    fn update_limits_is_observed_without_blocking_check_order() {
        let rm = RiskManager::new(limits());
        assert_eq!(rm.check_order(OrderSide::Buy, 100.0, 8.0, "TEST"), RiskCheckResult::Approved);

        rm.update_limits(RiskLimits { max_order_size: 1.0, ..limits() });
        assert_eq!(rm.check_order(OrderSide::Buy, 100.0, 8.0, "TEST"), RiskCheckResult::RejectedOrderSizeLimit);
    }

    #[test]
    fn json_round_trip_preserves_state() {
        let rm = RiskManager::new(limits());
        rm.on_fill(OrderSide::Buy, 100.0, 2.0, "TEST");
        rm.on_pnl_update(250.0);
        let json = rm.to_json();

        let rm2 = RiskManager::new(limits());
        rm2.from_json(&json);
        assert_eq!(rm2.position(), 2.0);
        assert_eq!(rm2.daily_pnl(), 250.0);
    }

    #[test]
    fn hedge_needed_when_utilization_exceeds_threshold() {
        let rm = RiskManager::new(limits());
        rm.on_fill(OrderSide::Buy, 100.0, 6.0, "TEST");
        assert!(rm.needs_hedge());
    }
}
