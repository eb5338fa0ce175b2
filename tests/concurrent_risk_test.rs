//! Concurrency stress test for the pre-trade hot path: many threads hammer
//! `check_order`/`on_fill` at once and the position limit must never be
//! exceeded by more than one in-flight order's worth of slack.

use std::sync::Arc;
use std::thread;

use risk_control_plane::{OrderSide, RiskCheckResult, RiskLimits, RiskManager};

#[test]
fn concurrent_fills_never_blow_through_the_position_limit() {
    let limits = RiskLimits {
        max_position_size: 50.0,
        max_order_size: 1.0,
        max_orders_per_second: 10_000,
        ..RiskLimits::default()
    };
    let rm = Arc::new(RiskManager::new(limits));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let rm = Arc::clone(&rm);
        handles.push(thread::spawn(move || {
            let mut approved = 0;
            for _ in 0..20 {
                if rm.check_order(OrderSide::Buy, 100.0, 1.0, "BTC-USD") == RiskCheckResult::Approved {
                    rm.on_fill(OrderSide::Buy, 100.0, 1.0, "BTC-USD");
                    approved += 1;
                }
            }
            approved
        }));
    }

    let total_approved: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(total_approved > 0);
    assert!(rm.position() <= 50.0 + 1e-9, "position {} exceeded the 50.0 limit", rm.position());
}

#[test]
fn rate_limiter_caps_total_approvals_within_one_second() {
    let limits = RiskLimits { max_orders_per_second: 25, max_position_size: 1_000_000.0, max_order_size: 1.0, ..RiskLimits::default() };
    let rm = Arc::new(RiskManager::new(limits));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let rm = Arc::clone(&rm);
        handles.push(thread::spawn(move || {
            (0..50).filter(|_| rm.check_order(OrderSide::Buy, 1.0, 1.0, "BTC-USD") == RiskCheckResult::Approved).count()
        }));
    }

    let total_approved: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(total_approved <= 25, "rate limiter allowed {total_approved} orders in one second, expected at most 25");
}

#[test]
fn pnl_updates_from_many_threads_converge_on_a_monotonic_peak() {
    let rm = Arc::new(RiskManager::new(RiskLimits { max_drawdown_pct: 1000.0, ..RiskLimits::default() }));

    let mut handles = Vec::new();
    for t in 0..8 {
        let rm = Arc::clone(&rm);
        handles.push(thread::spawn(move || {
            for i in 0..50 {
                rm.on_pnl_update((t * 50 + i) as f64);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(rm.state().peak_pnl, 399.0);
}
