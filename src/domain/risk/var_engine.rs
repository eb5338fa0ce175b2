//! Rolling-window Value-at-Risk engine.
//!
//! Returns are fed in on the caller's thread via [`VarEngine::add_return`];
//! a background worker recomputes all risk figures at `update_interval_ms`
//! cadence and publishes them through a lock-free double buffer so that
//! [`VarEngine::get_latest_result`] never blocks, even while a refresh is
//! in flight.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use crate::domain::config::VarConfig;

/// A complete, internally consistent set of risk figures for one refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VarResult {
    pub historical_var_95: f64,
    pub historical_var_99: f64,
    pub parametric_var_95: f64,
    pub parametric_var_99: f64,
    pub monte_carlo_var_95: f64,
    pub monte_carlo_var_99: f64,
    pub expected_shortfall_95: f64,
    pub expected_shortfall_99: f64,
    pub component_var: f64,
    pub calculation_timestamp: u64,
    pub sample_count: usize,
}

/// One double-buffer slot, stored as independently atomic fields so that
/// [`VarEngine::get_latest_result`] can read a whole [`VarResult`] without
/// ever taking a lock. The writer only ever touches the *inactive* slot and
/// flips [`VarEngine::active_buffer`] with a release store once every field
/// has been written; readers acquire-load the index first, so they always
/// see a fully-written slot.
#[derive(Default)]
struct VarResultSlot {
    historical_var_95: AtomicU64,
    historical_var_99: AtomicU64,
    parametric_var_95: AtomicU64,
    parametric_var_99: AtomicU64,
    monte_carlo_var_95: AtomicU64,
    monte_carlo_var_99: AtomicU64,
    expected_shortfall_95: AtomicU64,
    expected_shortfall_99: AtomicU64,
    component_var: AtomicU64,
    calculation_timestamp: AtomicU64,
    sample_count: AtomicUsize,
}

impl VarResultSlot {
    fn write(&self, r: &VarResult) {
        self.historical_var_95.store(r.historical_var_95.to_bits(), Ordering::Relaxed);
        self.historical_var_99.store(r.historical_var_99.to_bits(), Ordering::Relaxed);
        self.parametric_var_95.store(r.parametric_var_95.to_bits(), Ordering::Relaxed);
        self.parametric_var_99.store(r.parametric_var_99.to_bits(), Ordering::Relaxed);
        self.monte_carlo_var_95.store(r.monte_carlo_var_95.to_bits(), Ordering::Relaxed);
        self.monte_carlo_var_99.store(r.monte_carlo_var_99.to_bits(), Ordering::Relaxed);
        self.expected_shortfall_95.store(r.expected_shortfall_95.to_bits(), Ordering::Relaxed);
        self.expected_shortfall_99.store(r.expected_shortfall_99.to_bits(), Ordering::Relaxed);
        self.component_var.store(r.component_var.to_bits(), Ordering::Relaxed);
        self.calculation_timestamp.store(r.calculation_timestamp, Ordering::Relaxed);
        self.sample_count.store(r.sample_count, Ordering::Relaxed);
    }

    fn read(&self) -> VarResult {
        VarResult {
            historical_var_95: f64::from_bits(self.historical_var_95.load(Ordering::Relaxed)),
            historical_var_99: f64::from_bits(self.historical_var_99.load(Ordering::Relaxed)),
            parametric_var_95: f64::from_bits(self.parametric_var_95.load(Ordering::Relaxed)),
            parametric_var_99: f64::from_bits(self.parametric_var_99.load(Ordering::Relaxed)),
            monte_carlo_var_95: f64::from_bits(self.monte_carlo_var_95.load(Ordering::Relaxed)),
            monte_carlo_var_99: f64::from_bits(self.monte_carlo_var_99.load(Ordering::Relaxed)),
            expected_shortfall_95: f64::from_bits(self.expected_shortfall_95.load(Ordering::Relaxed)),
            expected_shortfall_99: f64::from_bits(self.expected_shortfall_99.load(Ordering::Relaxed)),
            component_var: f64::from_bits(self.component_var.load(Ordering::Relaxed)),
            calculation_timestamp: self.calculation_timestamp.load(Ordering::Relaxed),
            sample_count: self.sample_count.load(Ordering::Relaxed),
        }
    }
}

/// Rolling Value-at-Risk engine with a background refresh worker.
pub struct VarEngine {
    config: Mutex<VarConfig>,
    returns: Mutex<VecDeque<f64>>,
    active_buffer: AtomicUsize,
    slots: [VarResultSlot; 2],
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    // Seeded once at construction; every Monte Carlo calculation clones this
    // rather than advancing it, so repeated refreshes over an unchanged
    // window reproduce identical simulated percentiles. This mirrors the
    // source engine's `mutable std::mt19937` used from `const` methods.
    rng: Mutex<StdRng>,
}

impl VarEngine {
    pub fn new(config: VarConfig) -> Self {
        VarEngine {
            config: Mutex::new(config),
            returns: Mutex::new(VecDeque::new()),
            active_buffer: AtomicUsize::new(0),
            slots: [VarResultSlot::default(), VarResultSlot::default()],
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            rng: Mutex::new(StdRng::from_rng(&mut rand::rng())),
        }
    }

    /// Reset the engine to a clean baseline: clears the returns window and
    /// both result slots, and installs `config`. Re-initialization is legal
    /// at any point, including while the background worker is running.
    pub fn initialize(&self, config: VarConfig) {
        *self.config.lock().unwrap() = config;
        self.returns.lock().unwrap().clear();
        self.slots[0].write(&VarResult::default());
        self.slots[1].write(&VarResult::default());
        self.active_buffer.store(0, Ordering::Release);
    }

    /// Start the background refresh worker if it isn't already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let engine = Arc::clone(self);
        let running = Arc::clone(&self.running);
        let handle = thread::spawn(move || {
            let mut slept = 0u64;
            while running.load(Ordering::Acquire) {
                let interval_ms = engine.config.lock().unwrap().update_interval_ms;
                if slept < interval_ms {
                    thread::sleep(Duration::from_millis(100.min(interval_ms - slept)));
                    slept += 100;
                    continue;
                }
                slept = 0;

                let result = panic::catch_unwind(AssertUnwindSafe(|| engine.calculate_all()));
                match result {
                    Ok(result) => engine.publish(result),
                    Err(_) => {
                        tracing::error!("VaR calculation panicked; keeping previous result");
                    }
                }
            }
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Signal the background worker to stop and join it. Returns within one
    /// sleep slice (~100ms) of the next poll.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Feed one signed return sample, trimming the window to `window_size`, oldest-out.
    pub fn add_return(&self, return_value: f64) {
        let window_size = self.config.lock().unwrap().window_size;
        let mut returns = self.returns.lock().unwrap();
        returns.push_back(return_value);
        while returns.len() > window_size {
            returns.pop_front();
        }
    }

    /// Lock-free read of the most recently published, fully-initialized result.
    pub fn get_latest_result(&self) -> VarResult {
        let idx = self.active_buffer.load(Ordering::Acquire);
        self.slots[idx].read()
    }

    /// `true` iff the 95% historical VaR, scaled to `portfolio_value`,
    /// strictly exceeds the configured VaR limit.
    pub fn is_var_breached(&self, portfolio_value: f64) -> bool {
        let limit_pct = self.config.lock().unwrap().var_limit_pct;
        let latest = self.get_latest_result();
        latest.historical_var_95 * portfolio_value > (limit_pct / 100.0) * portfolio_value
    }

    pub fn get_current_var_95_pct(&self) -> f64 {
        self.get_latest_result().historical_var_95 * 100.0
    }

    pub fn get_current_var_99_pct(&self) -> f64 {
        self.get_latest_result().historical_var_99 * 100.0
    }

    /// Force a synchronous recalculation and publish, bypassing the worker's
    /// cadence. Used by tests and by callers that want a result immediately
    /// after a burst of `add_return` calls.
    pub fn refresh_now(&self) {
        let result = self.calculate_all();
        self.publish(result);
    }

    fn publish(&self, result: VarResult) {
        let active = self.active_buffer.load(Ordering::Acquire);
        let inactive = 1 - active;
        self.slots[inactive].write(&result);
        self.active_buffer.store(inactive, Ordering::Release);
    }

    fn calculate_all(&self) -> VarResult {
        let config = self.config.lock().unwrap().clone();
        let sorted = self.get_sorted_returns();
        let n = sorted.len();

        if n < 2 {
            return VarResult {
                calculation_timestamp: now_nanos(),
                sample_count: n,
                ..Default::default()
            };
        }

        let mean = calculate_mean(&sorted);
        let stddev = calculate_std_dev(&sorted, mean);
        if stddev <= 0.0 {
            return VarResult {
                calculation_timestamp: now_nanos(),
                sample_count: n,
                ..Default::default()
            };
        }

        let scaled_mean = mean * config.horizon;
        let scaled_stddev = stddev * config.horizon.sqrt();

        let historical_var_95 = calculate_historical_var(&sorted, config.confidence_level_95);
        let historical_var_99 = calculate_historical_var(&sorted, config.confidence_level_99);
        let parametric_var_95 = calculate_parametric_var(scaled_mean, scaled_stddev, config.confidence_level_95);
        let parametric_var_99 = calculate_parametric_var(scaled_mean, scaled_stddev, config.confidence_level_99);
        let monte_carlo_var_95 = self.calculate_monte_carlo_var(scaled_mean, scaled_stddev, config.confidence_level_95, config.simulation_count);
        let monte_carlo_var_99 = self.calculate_monte_carlo_var(scaled_mean, scaled_stddev, config.confidence_level_99, config.simulation_count);
        let expected_shortfall_95 = calculate_expected_shortfall(&sorted, config.confidence_level_95);
        let expected_shortfall_99 = calculate_expected_shortfall(&sorted, config.confidence_level_99);

        VarResult {
            historical_var_95,
            historical_var_99,
            parametric_var_95,
            parametric_var_99,
            monte_carlo_var_95,
            monte_carlo_var_99,
            expected_shortfall_95,
            expected_shortfall_99,
            component_var: parametric_var_95,
            calculation_timestamp: now_nanos(),
            sample_count: n,
        }
    }

    fn get_sorted_returns(&self) -> Vec<f64> {
        let returns = self.returns.lock().unwrap();
        let mut sorted: Vec<f64> = returns.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        sorted
    }

    /// Draws `num_simulations` samples from `Normal(mean, stddev)` using a
    /// clone of the engine's RNG, so the stored generator is never advanced
    /// by a `&self` calculation call.
    fn calculate_monte_carlo_var(&self, mean: f64, stddev: f64, confidence: f64, num_simulations: usize) -> f64 {
        let mut rng = self.rng.lock().unwrap().clone();
        let mut samples: Vec<f64> = (0..num_simulations).map(|_| mean + stddev * sample_standard_normal(&mut rng)).collect();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        calculate_historical_var(&samples, confidence)
    }

    pub fn to_json(&self) -> Value {
        let latest = self.get_latest_result();
        let config = self.config.lock().unwrap().clone();
        json!({
            "historical_var_95": latest.historical_var_95,
            "historical_var_99": latest.historical_var_99,
            "parametric_var_95": latest.parametric_var_95,
            "parametric_var_99": latest.parametric_var_99,
            "monte_carlo_var_95": latest.monte_carlo_var_95,
            "monte_carlo_var_99": latest.monte_carlo_var_99,
            "expected_shortfall_95": latest.expected_shortfall_95,
            "expected_shortfall_99": latest.expected_shortfall_99,
            "component_var": latest.component_var,
            "calculation_timestamp": latest.calculation_timestamp,
            "sample_count": latest.sample_count,
            "var_95_pct": latest.historical_var_95 * 100.0,
            "var_99_pct": latest.historical_var_99 * 100.0,
            "config": {
                "window_size": config.window_size,
                "simulation_count": config.simulation_count,
                "horizon": config.horizon,
                "var_limit_pct": config.var_limit_pct,
            },
        })
    }
}

impl Drop for VarEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn calculate_mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Sample (N-1 denominator) standard deviation.
fn calculate_std_dev(data: &[f64], mean: f64) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// `sorted` must be ascending. Returns a non-negative loss.
fn calculate_historical_var(sorted: &[f64], confidence: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let index = (((1.0 - confidence) * n as f64).floor() as usize).min(n - 1);
    -sorted[index]
}

fn calculate_parametric_var(mean: f64, stddev: f64, confidence: f64) -> f64 {
    let z = normal_cdf_inverse(1.0 - confidence);
    -(mean + z * stddev)
}

/// Mean of the worst `max(1, floor((1-confidence)*n))` ascending entries,
/// sign-flipped to a positive loss.
fn calculate_expected_shortfall(sorted: &[f64], confidence: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let tail_count = (((1.0 - confidence) * n as f64).floor() as usize).max(1);
    let tail = &sorted[..tail_count.min(n)];
    -(tail.iter().sum::<f64>() / tail.len() as f64)
}

/// Abramowitz–Stegun formula 26.2.23: a rational approximation to the
/// inverse standard normal CDF, accurate to about 4.5e-4.
fn normal_cdf_inverse(p: f64) -> f64 {
    if p <= 0.0 {
        return -1e10;
    }
    if p >= 1.0 {
        return 1e10;
    }

    const C0: f64 = 2.515517;
    const C1: f64 = 0.802853;
    const C2: f64 = 0.010328;
    const D1: f64 = 1.432788;
    const D2: f64 = 0.189269;
    const D3: f64 = 0.001308;

    let (p, sign) = if p > 0.5 { (1.0 - p, 1.0) } else { (p, -1.0) };

    let t = (-2.0 * p.ln()).sqrt();
    let numerator = C0 + C1 * t + C2 * t * t;
    let denominator = 1.0 + D1 * t + D2 * t * t + D3 * t * t * t;
    sign * (t - numerator / denominator)
}

/// One standard-normal sample via the Box–Muller transform. No `rand_distr`
/// dependency: matches the hand-rolled-RNG idiom used elsewhere for Monte
/// Carlo sampling in this codebase.
fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
