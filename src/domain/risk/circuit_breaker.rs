//! Three-state trading circuit breaker.
//!
//! `is_trading_allowed` is the hot path: a single acquire load of an atomic
//! state, checked on every order. Everything else — price/spread/volume
//! baselines, cooldown timers, the transition callback — lives behind a
//! handful of short-lived mutexes, each held only long enough to read or
//! update the fields it owns.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::config::CircuitBreakerConfig;
use crate::infrastructure::audit::{AuditEvent, AuditEventType, AuditLogger};

/// Physical capacity of the price-history ring buffer. Fixed regardless of
/// [`CircuitBreakerConfig::price_history_size`], which is a logical tuning
/// knob, not a resize request.
pub const PRICE_HISTORY_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CircuitBreakerState::Closed,
            1 => CircuitBreakerState::Open,
            _ => CircuitBreakerState::HalfOpen,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            CircuitBreakerState::Closed => 0,
            CircuitBreakerState::Open => 1,
            CircuitBreakerState::HalfOpen => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "CLOSED",
            CircuitBreakerState::Open => "OPEN",
            CircuitBreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerTrigger {
    None,
    RapidPriceMove1Min,
    RapidPriceMove5Min,
    SpreadWidening,
    VolumeSpike,
    MarketCrisis,
    LatencyDegradation,
    ConnectivityLoss,
    Manual,
}

impl CircuitBreakerTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitBreakerTrigger::None => "NONE",
            CircuitBreakerTrigger::RapidPriceMove1Min => "RAPID_PRICE_MOVE_1MIN",
            CircuitBreakerTrigger::RapidPriceMove5Min => "RAPID_PRICE_MOVE_5MIN",
            CircuitBreakerTrigger::SpreadWidening => "SPREAD_WIDENING",
            CircuitBreakerTrigger::VolumeSpike => "VOLUME_SPIKE",
            CircuitBreakerTrigger::MarketCrisis => "MARKET_CRISIS",
            CircuitBreakerTrigger::LatencyDegradation => "LATENCY_DEGRADATION",
            CircuitBreakerTrigger::ConnectivityLoss => "CONNECTIVITY_LOSS",
            CircuitBreakerTrigger::Manual => "MANUAL",
        }
    }
}

/// Snapshot of the breaker's non-hot-path state, returned by [`CircuitBreaker::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitBreakerState,
    pub last_trigger: CircuitBreakerTrigger,
    pub state_change_time_ms: u64,
    pub cooldown_end_time_ms: u64,
    pub trip_count: usize,
    pub last_price_move_1min: f64,
    pub last_price_move_5min: f64,
    pub current_spread_ratio: f64,
    pub current_volume_ratio: f64,
}

#[derive(Default)]
struct PriceSlot {
    price_bits: AtomicU64,
    timestamp_ns: AtomicU64,
}

struct BaselineState {
    spread: f64,
    spread_initialized: bool,
    spread_sample_count: u32,
    volume: f64,
}

impl Default for BaselineState {
    fn default() -> Self {
        BaselineState {
            spread: 0.0,
            spread_initialized: false,
            spread_sample_count: 0,
            volume: 0.0,
        }
    }
}

#[derive(Default)]
struct StatusFields {
    last_trigger: CircuitBreakerTrigger2,
    state_change_time_ms: u64,
    cooldown_end_time_ms: u64,
    trip_count: usize,
    last_price_move_1min: f64,
    last_price_move_5min: f64,
    current_spread_ratio: f64,
    current_volume_ratio: f64,
}

// `CircuitBreakerTrigger` has no meaningful zero value for `#[derive(Default)]`
// on `StatusFields`; this newtype supplies one (`None`) without adding a
// `Default` impl to the public enum itself.
#[derive(Clone, Copy)]
struct CircuitBreakerTrigger2(CircuitBreakerTrigger);
impl Default for CircuitBreakerTrigger2 {
    fn default() -> Self {
        CircuitBreakerTrigger2(CircuitBreakerTrigger::None)
    }
}

/// Callback invoked after every committed state transition, outside all
/// internal locks.
pub type StateCallback = Box<dyn Fn(CircuitBreakerState, CircuitBreakerState, CircuitBreakerTrigger) + Send + Sync>;

pub struct CircuitBreaker {
    state: AtomicU8,
    config: Mutex<CircuitBreakerConfig>,
    price_history: Vec<PriceSlot>,
    price_head: AtomicUsize,
    price_count: AtomicUsize,
    baseline: Mutex<BaselineState>,
    status: Mutex<StatusFields>,
    callback: Mutex<Option<StateCallback>>,
    audit: Arc<AuditLogger>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_audit(config, Arc::new(AuditLogger::new()))
    }

    /// Same as [`CircuitBreaker::new`] but sharing a caller-supplied audit
    /// trail instead of creating a private one.
    pub fn with_audit(config: CircuitBreakerConfig, audit: Arc<AuditLogger>) -> Self {
        CircuitBreaker {
            state: AtomicU8::new(CircuitBreakerState::Closed.to_u8()),
            config: Mutex::new(config),
            price_history: (0..PRICE_HISTORY_CAPACITY).map(|_| PriceSlot::default()).collect(),
            price_head: AtomicUsize::new(0),
            price_count: AtomicUsize::new(0),
            baseline: Mutex::new(BaselineState::default()),
            status: Mutex::new(StatusFields::default()),
            callback: Mutex::new(None),
            audit,
        }
    }

    /// Reset to a clean `Closed` baseline with no price/baseline history.
    pub fn initialize(&self, config: CircuitBreakerConfig) {
        *self.config.lock().unwrap() = config;
        self.state.store(CircuitBreakerState::Closed.to_u8(), Ordering::Release);
        self.price_head.store(0, Ordering::Relaxed);
        self.price_count.store(0, Ordering::Relaxed);
        *self.baseline.lock().unwrap() = BaselineState::default();
        *self.status.lock().unwrap() = StatusFields::default();
    }

    /// Hot path: a single acquire load. `true` iff the breaker is `Closed`.
    pub fn is_trading_allowed(&self) -> bool {
        self.state() == CircuitBreakerState::Closed
    }

    pub fn state(&self) -> CircuitBreakerState {
        CircuitBreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let s = self.status.lock().unwrap();
        CircuitBreakerStatus {
            state: self.state(),
            last_trigger: s.last_trigger.0,
            state_change_time_ms: s.state_change_time_ms,
            cooldown_end_time_ms: s.cooldown_end_time_ms,
            trip_count: s.trip_count,
            last_price_move_1min: s.last_price_move_1min,
            last_price_move_5min: s.last_price_move_5min,
            current_spread_ratio: s.current_spread_ratio,
            current_volume_ratio: s.current_volume_ratio,
        }
    }

    pub fn register_callback(&self, callback: StateCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Single-producer write into the ring buffer, then evaluate price-move
    /// and cooldown transitions.
    pub fn on_price(&self, price: f64, timestamp_ns: u64) {
        let head = self.price_head.load(Ordering::Relaxed);
        let idx = head % PRICE_HISTORY_CAPACITY;
        self.price_history[idx].price_bits.store(price.to_bits(), Ordering::Relaxed);
        self.price_history[idx].timestamp_ns.store(timestamp_ns, Ordering::Relaxed);
        self.price_head.store(head + 1, Ordering::Release);

        let count = self.price_count.load(Ordering::Relaxed);
        if count < PRICE_HISTORY_CAPACITY {
            self.price_count.store(count + 1, Ordering::Release);
        }

        self.check_price_move(timestamp_ns);
        self.check_cooldown();
    }

    pub fn on_spread(&self, spread: f64) {
        let mut baseline = self.baseline.lock().unwrap();
        if !baseline.spread_initialized {
            if baseline.spread == 0.0 && baseline.spread_sample_count == 0 {
                baseline.spread = spread;
            } else {
                const ALPHA: f64 = 0.1;
                baseline.spread = ALPHA * spread + (1.0 - ALPHA) * baseline.spread;
            }
            baseline.spread_sample_count += 1;
            if baseline.spread_sample_count >= 20 {
                baseline.spread_initialized = true;
            }
            return;
        }

        if baseline.spread <= 0.0 {
            return;
        }

        let ratio = spread / baseline.spread;
        self.status.lock().unwrap().current_spread_ratio = ratio;

        let threshold = self.config.lock().unwrap().spread_widen_multiplier;
        if ratio >= threshold && self.trippable_state() {
            drop(baseline);
            self.transition_to(CircuitBreakerState::Open, CircuitBreakerTrigger::SpreadWidening);
            baseline = self.baseline.lock().unwrap();
        }

        const ADAPT_ALPHA: f64 = 0.001;
        baseline.spread = ADAPT_ALPHA * spread + (1.0 - ADAPT_ALPHA) * baseline.spread;
    }

    pub fn on_volume(&self, volume: f64) {
        let mut baseline = self.baseline.lock().unwrap();
        if baseline.volume == 0.0 {
            baseline.volume = volume;
            return;
        }

        const ADAPT_ALPHA: f64 = 0.005;
        baseline.volume = ADAPT_ALPHA * volume + (1.0 - ADAPT_ALPHA) * baseline.volume;
        if baseline.volume <= 0.0 {
            return;
        }

        let ratio = volume / baseline.volume;
        self.status.lock().unwrap().current_volume_ratio = ratio;

        let threshold = self.config.lock().unwrap().volume_spike_multiplier;
        if ratio >= threshold && self.trippable_state() {
            drop(baseline);
            self.transition_to(CircuitBreakerState::Open, CircuitBreakerTrigger::VolumeSpike);
        }
    }

    pub fn on_latency(&self, latency_us: u64) {
        let threshold = self.config.lock().unwrap().max_latency_us;
        if latency_us > threshold && self.trippable_state() {
            self.transition_to(CircuitBreakerState::Open, CircuitBreakerTrigger::LatencyDegradation);
        }
    }

    /// `regime_code == 5` is the crisis regime in the collaborator's market
    /// regime classifier; the breaker only cares about that one value.
    pub fn on_regime_change(&self, regime_code: i32) {
        const CRISIS_VALUE: i32 = 5;
        if regime_code == CRISIS_VALUE && self.trippable_state() {
            self.transition_to(CircuitBreakerState::Open, CircuitBreakerTrigger::MarketCrisis);
        }
    }

    pub fn on_connectivity_loss(&self) {
        if self.trippable_state() {
            self.transition_to(CircuitBreakerState::Open, CircuitBreakerTrigger::ConnectivityLoss);
        }
    }

    /// Only auto-recovers `Open -> HalfOpen` if the breaker was last tripped
    /// by a connectivity loss; any other open trigger requires cooldown
    /// expiry or a manual reset.
    pub fn on_connectivity_restored(&self) {
        if self.state() != CircuitBreakerState::Open {
            return;
        }
        let last_trigger = self.status.lock().unwrap().last_trigger.0;
        if last_trigger == CircuitBreakerTrigger::ConnectivityLoss {
            self.transition_to(CircuitBreakerState::HalfOpen, CircuitBreakerTrigger::ConnectivityLoss);
        }
    }

    pub fn trip(&self, _reason: &str) {
        self.transition_to(CircuitBreakerState::Open, CircuitBreakerTrigger::Manual);
    }

    pub fn reset(&self) {
        self.transition_to(CircuitBreakerState::Closed, CircuitBreakerTrigger::None);
    }

    pub fn to_json(&self) -> Value {
        let status = self.status();
        json!({
            "state": status.state.as_str(),
            "last_trigger": status.last_trigger.as_str(),
            "state_change_time_ms": status.state_change_time_ms,
            "cooldown_end_time_ms": status.cooldown_end_time_ms,
            "trip_count": status.trip_count,
            "last_price_move_1min": status.last_price_move_1min,
            "last_price_move_5min": status.last_price_move_5min,
            "current_spread_ratio": status.current_spread_ratio,
            "current_volume_ratio": status.current_volume_ratio,
        })
    }

    /// Per the control plane's re-trip requirement, automatic triggers fire
    /// from `Closed` *and* `HalfOpen` (the source only fires from `Closed`;
    /// see `DESIGN.md` for why this crate diverges).
    fn trippable_state(&self) -> bool {
        matches!(self.state(), CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen)
    }

    fn check_price_move(&self, timestamp_ns: u64) {
        if !self.trippable_state() {
            return;
        }
        let count = self.price_count.load(Ordering::Acquire);
        if count < 2 {
            return;
        }

        let (threshold_1min, threshold_5min) = {
            let config = self.config.lock().unwrap();
            (config.price_move_1min_pct, config.price_move_5min_pct)
        };

        let move_1min = self.calculate_price_move(60_000, timestamp_ns);
        let move_5min = self.calculate_price_move(300_000, timestamp_ns);
        {
            let mut status = self.status.lock().unwrap();
            status.last_price_move_1min = move_1min;
            status.last_price_move_5min = move_5min;
        }

        if move_1min >= threshold_1min {
            self.transition_to(CircuitBreakerState::Open, CircuitBreakerTrigger::RapidPriceMove1Min);
        } else if move_5min >= threshold_5min {
            self.transition_to(CircuitBreakerState::Open, CircuitBreakerTrigger::RapidPriceMove5Min);
        }
    }

    /// Walks backward from the most recent ring-buffer entry, stopping at
    /// the first entry older than `current_time - window_ms`, and returns
    /// the absolute percentage move between that entry and the newest one.
    fn calculate_price_move(&self, window_ms: u64, current_time_ns: u64) -> f64 {
        let count = self.price_count.load(Ordering::Acquire).min(PRICE_HISTORY_CAPACITY);
        if count < 2 {
            return 0.0;
        }
        let head = self.price_head.load(Ordering::Acquire);

        let newest_idx = (head + PRICE_HISTORY_CAPACITY - 1) % PRICE_HISTORY_CAPACITY;
        let newest_price = f64::from_bits(self.price_history[newest_idx].price_bits.load(Ordering::Relaxed));
        if newest_price <= 0.0 {
            return 0.0;
        }

        let window_ns = window_ms * 1_000_000;
        let window_start = current_time_ns.saturating_sub(window_ns);
        let mut oldest_price = newest_price;

        for step in 1..count {
            let idx = (head + PRICE_HISTORY_CAPACITY - 1 - step) % PRICE_HISTORY_CAPACITY;
            let ts = self.price_history[idx].timestamp_ns.load(Ordering::Relaxed);
            if ts < window_start {
                break;
            }
            oldest_price = f64::from_bits(self.price_history[idx].price_bits.load(Ordering::Relaxed));
        }

        if oldest_price <= 0.0 {
            return 0.0;
        }
        ((newest_price - oldest_price) / oldest_price).abs() * 100.0
    }

    fn check_cooldown(&self) {
        let state = self.state();
        if state == CircuitBreakerState::Closed {
            return;
        }

        let now = now_millis();
        let cooldown_end = self.status.lock().unwrap().cooldown_end_time_ms;
        if cooldown_end == 0 || now < cooldown_end {
            return;
        }

        match state {
            CircuitBreakerState::Open => self.transition_to(CircuitBreakerState::HalfOpen, CircuitBreakerTrigger::None),
            CircuitBreakerState::HalfOpen => self.transition_to(CircuitBreakerState::Closed, CircuitBreakerTrigger::None),
            CircuitBreakerState::Closed => {}
        }
    }

    fn transition_to(&self, new_state: CircuitBreakerState, trigger: CircuitBreakerTrigger) {
        let old_state = self.state();
        if old_state == new_state {
            return;
        }

        let now = now_millis();
        self.state.store(new_state.to_u8(), Ordering::Release);

        {
            let mut status = self.status.lock().unwrap();
            status.last_trigger = CircuitBreakerTrigger2(trigger);
            status.state_change_time_ms = now;
            match new_state {
                CircuitBreakerState::Open => {
                    let cooldown = self.config.lock().unwrap().cooldown_period_ms;
                    status.cooldown_end_time_ms = now + cooldown;
                    status.trip_count += 1;
                }
                CircuitBreakerState::HalfOpen => {
                    let test_duration = self.config.lock().unwrap().half_open_test_duration_ms;
                    status.cooldown_end_time_ms = now + test_duration;
                }
                CircuitBreakerState::Closed => {
                    status.cooldown_end_time_ms = 0;
                }
            }
        }

        tracing::info!(from = old_state.as_str(), to = new_state.as_str(), trigger = trigger.as_str(), "circuit breaker transition");

        {
            let callback = self.callback.lock().unwrap();
            if let Some(cb) = callback.as_ref() {
                let result = panic::catch_unwind(AssertUnwindSafe(|| cb(old_state, new_state, trigger)));
                if result.is_err() {
                    tracing::error!("circuit breaker state callback panicked");
                }
            }
        }

        self.audit.log_event(AuditEvent::new(
            AuditEventType::SuspiciousActivity,
            format!("circuit breaker transitioned {} -> {} (trigger: {})", old_state.as_str(), new_state.as_str(), trigger.as_str()),
            true,
        ));
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            price_move_1min_pct: 0.5,
            price_move_5min_pct: 5.0,
            spread_widen_multiplier: 3.0,
            volume_spike_multiplier: 5.0,
            cooldown_period_ms: 50,
            half_open_test_duration_ms: 50,
            max_latency_us: 1000,
            price_history_size: 300,
        }
    }

    #[test]
    fn starts_closed_and_allows_trading() {
        let cb = CircuitBreaker::new(config());
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert!(cb.is_trading_allowed());
    }

    #[test]
    fn rapid_price_move_trips_open() {
        let cb = CircuitBreaker::new(config());
        cb.on_price(100.0, 0);
        cb.on_price(105.0, 500_000_000);
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert!(!cb.is_trading_allowed());
    }

    #[test]
    fn latency_trip_then_manual_reset() {
        let cb = CircuitBreaker::new(config());
        cb.on_latency(50_000);
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert!(cb.is_trading_allowed());
    }

    #[test]
    fn state_transitions_are_recorded_in_the_audit_trail() {
        let audit = Arc::new(AuditLogger::new());
        let cb = CircuitBreaker::with_audit(config(), Arc::clone(&audit));
        cb.trip("operator halt");

        let events = audit.recent_events(10);
        assert!(events.iter().any(|e| e.description.contains("CLOSED -> OPEN")));
    }

    #[test]
    fn manual_trip_overrides_any_state() {
        let cb = CircuitBreaker::new(config());
        cb.trip("operator halt");
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert_eq!(cb.status().last_trigger, CircuitBreakerTrigger::Manual);
    }

    #[test]
    fn cooldown_expiry_moves_open_to_half_open_then_closed() {
        let cb = CircuitBreaker::new(config());
        cb.trip("test");
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        std::thread::sleep(std::time::Duration::from_millis(60));
        cb.on_price(100.0, 1);
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        std::thread::sleep(std::time::Duration::from_millis(60));
        cb.on_price(100.0, 2);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn half_open_re_trip_reopens() {
        let cb = CircuitBreaker::new(config());
        cb.trip("test");
        std::thread::sleep(std::time::Duration::from_millis(60));
        cb.on_price(100.0, 1_000_000);
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);

        cb.on_latency(50_000);
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert_eq!(cb.status().last_trigger, CircuitBreakerTrigger::LatencyDegradation);
    }

    #[test]
    fn spread_baseline_warms_up_before_tripping() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..25 {
            cb.on_spread(1.0);
        }
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        cb.on_spread(10.0);
        assert_eq!(cb.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn volume_baseline_has_no_warmup_phase() {
        let cb = CircuitBreaker::new(config());
        cb.on_volume(100.0);
        cb.on_volume(1000.0);
        assert_eq!(cb.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn connectivity_restored_only_recovers_from_connectivity_loss() {
        let cb = CircuitBreaker::new(config());
        cb.on_latency(50_000);
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        cb.on_connectivity_restored();
        assert_eq!(cb.state(), CircuitBreakerState::Open, "non-connectivity trip should not auto-recover");

        cb.reset();
        cb.on_connectivity_loss();
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        cb.on_connectivity_restored();
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
    }

    #[test]
    fn ring_buffer_tolerates_more_entries_than_capacity() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig { price_move_1min_pct: 1000.0, ..config() });
        for i in 0..(PRICE_HISTORY_CAPACITY * 2) {
            cb.on_price(100.0 + i as f64 * 0.001, i as u64 * 1000);
        }
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }
}
