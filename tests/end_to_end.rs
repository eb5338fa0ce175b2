//! End-to-end scenarios exercising the risk manager, circuit breaker, VaR
//! engine, alert manager, and disaster recovery together, the way they'd
//! actually be wired up by a calling strategy process.

use std::sync::Arc;

use risk_control_plane::{
    AlertManager, AlertSeverity, AlertType, AuditLogger, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerState, DisasterRecovery, OrderSide, RiskCheckResult, RiskConfig, RiskLimits,
    RiskManager, VarConfig, VarEngine,
};
use tempfile::tempdir;

fn circuit_breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        price_move_1min_pct: 1.0,
        price_move_5min_pct: 5.0,
        spread_widen_multiplier: 3.0,
        volume_spike_multiplier: 5.0,
        cooldown_period_ms: 30,
        half_open_test_duration_ms: 30,
        max_latency_us: 10_000,
        price_history_size: 300,
    }
}

#[test]
fn order_rejected_once_position_limit_is_reached() {
    let limits = RiskLimits { max_position_size: 5.0, max_order_size: 10.0, ..RiskLimits::default() };
    let rm = RiskManager::new(limits);

    assert_eq!(rm.check_order(OrderSide::Buy, 100.0, 5.0, "BTC-USD"), RiskCheckResult::Approved);
    rm.on_fill(OrderSide::Buy, 100.0, 5.0, "BTC-USD");

    assert_eq!(rm.check_order(OrderSide::Buy, 100.0, 1.0, "BTC-USD"), RiskCheckResult::RejectedPositionLimit);
}

#[test]
fn losing_streak_trips_daily_loss_halt_and_blocks_further_orders() {
    let limits = RiskLimits { daily_loss_limit: 1_000.0, ..RiskLimits::default() };
    let rm = RiskManager::new(limits);

    rm.on_pnl_update(-1_200.0);
    assert!(rm.is_halted());
    assert_eq!(rm.check_order(OrderSide::Sell, 100.0, 1.0, "BTC-USD"), RiskCheckResult::RejectedHalted);
}

#[test]
fn rapid_price_crash_trips_circuit_breaker_and_recovers_through_half_open() {
    let cb = CircuitBreaker::new(circuit_breaker_config());
    cb.on_price(100.0, 0);
    cb.on_price(90.0, 100_000_000);
    assert_eq!(cb.state(), CircuitBreakerState::Open);
    assert!(!cb.is_trading_allowed());

    std::thread::sleep(std::time::Duration::from_millis(40));
    cb.on_price(90.0, 200_000_000);
    assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);

    std::thread::sleep(std::time::Duration::from_millis(40));
    cb.on_price(90.0, 300_000_000);
    assert_eq!(cb.state(), CircuitBreakerState::Closed);
    assert!(cb.is_trading_allowed());
}

#[test]
fn circuit_breaker_transition_raises_a_throttle_safe_alert() {
    let cb = Arc::new(CircuitBreaker::new(circuit_breaker_config()));
    let alerts = Arc::new(AlertManager::new(risk_control_plane::AlertConfig::default()));

    let alerts_clone = Arc::clone(&alerts);
    cb.register_callback(Box::new(move |_old, new_state, trigger| {
        let alert_type = match new_state {
            CircuitBreakerState::Open => AlertType::CircuitBreakerOpen,
            CircuitBreakerState::HalfOpen => AlertType::CircuitBreakerHalfOpen,
            CircuitBreakerState::Closed => AlertType::CircuitBreakerClosed,
        };
        alerts_clone.raise(alert_type, AlertSeverity::Critical, format!("trip: {}", trigger.as_str()), "cb", serde_json::Value::Null);
    }));

    cb.trip("operator halt");
    assert_eq!(alerts.total_alert_count(), 1);
}

#[test]
fn var_engine_flags_breach_once_window_has_a_losing_tail() {
    let engine = VarEngine::new(VarConfig { window_size: 60, simulation_count: 1000, ..VarConfig::default() });
    for i in 0..60 {
        engine.add_return(((i % 7) as f64 - 5.0) * 0.01);
    }
    engine.refresh_now();
    let result = engine.get_latest_result();
    assert_eq!(result.sample_count, 60);
    assert!(result.historical_var_95 >= 0.0);
}

#[test]
fn disaster_recovery_round_trips_risk_manager_state_across_a_restart() {
    let dir = tempdir().unwrap();
    let audit = Arc::new(AuditLogger::new());
    let recovery = DisasterRecovery::new(dir.path().to_path_buf(), Arc::clone(&audit));
    recovery.initialize().unwrap();

    let rm1 = RiskManager::new(RiskLimits::default());
    rm1.on_fill(OrderSide::Buy, 100.0, 3.0, "BTC-USD");
    rm1.on_pnl_update(500.0);
    assert!(recovery.save_risk_state(&rm1.to_json(), &serde_json::json!({})));

    let rm2 = RiskManager::new(RiskLimits::default());
    rm2.from_json(&recovery.load_risk_state());
    assert_eq!(rm2.position(), 3.0);
    assert_eq!(rm2.daily_pnl(), 500.0);
}

#[test]
fn config_round_trips_through_the_external_json_schema() {
    let config = RiskConfig::default();
    let json = config.to_json();
    let restored = RiskConfig::from_json(&json);
    assert_eq!(config, restored);
}

#[test]
fn halted_manager_can_resume_and_accept_orders_again() {
    let rm = RiskManager::new(RiskLimits::default());
    rm.halt("manual test");
    assert_eq!(rm.check_order(OrderSide::Buy, 10.0, 1.0, "BTC-USD"), RiskCheckResult::RejectedHalted);

    rm.resume();
    assert_eq!(rm.check_order(OrderSide::Buy, 10.0, 1.0, "BTC-USD"), RiskCheckResult::Approved);
}
