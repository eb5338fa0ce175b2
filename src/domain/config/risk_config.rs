use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ConfigError;

/// Position, exposure, and loss limits enforced by the risk manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub max_notional_exposure: f64,
    pub max_net_exposure: f64,
    pub max_gross_exposure: f64,
    pub max_drawdown_pct: f64,
    pub daily_loss_limit: f64,
    pub max_order_size: f64,
    pub max_order_value: f64,
    pub max_daily_volume: f64,
    pub auto_hedge_enabled: bool,
    pub hedge_threshold_pct: f64,
    pub hedge_interval_ms: u64,
    pub max_orders_per_second: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        RiskLimits {
            max_position_size: 10.0,
            max_notional_exposure: 1_000_000.0,
            max_net_exposure: 500_000.0,
            max_gross_exposure: 2_000_000.0,
            max_drawdown_pct: 5.0,
            daily_loss_limit: 10_000.0,
            max_order_size: 1.0,
            max_order_value: 50_000.0,
            max_daily_volume: 100.0,
            auto_hedge_enabled: false,
            hedge_threshold_pct: 50.0,
            hedge_interval_ms: 5000,
            max_orders_per_second: 100,
        }
    }
}

/// Thresholds and timings driving the circuit breaker automaton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub price_move_1min_pct: f64,
    pub price_move_5min_pct: f64,
    pub spread_widen_multiplier: f64,
    pub volume_spike_multiplier: f64,
    pub cooldown_period_ms: u64,
    pub half_open_test_duration_ms: u64,
    pub max_latency_us: u64,
    /// Logical target for price history depth. The ring buffer's physical
    /// capacity is the fixed constant [`crate::domain::risk::circuit_breaker::PRICE_HISTORY_CAPACITY`];
    /// this field exists for parity with the wire schema and future tuning,
    /// not to resize the buffer.
    pub price_history_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            price_move_1min_pct: 2.0,
            price_move_5min_pct: 5.0,
            spread_widen_multiplier: 3.0,
            volume_spike_multiplier: 5.0,
            cooldown_period_ms: 30_000,
            half_open_test_duration_ms: 10_000,
            max_latency_us: 10_000,
            price_history_size: 300,
        }
    }
}

/// Value-at-Risk engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarConfig {
    pub window_size: usize,
    pub simulation_count: usize,
    pub horizon: f64,
    pub update_interval_ms: u64,
    pub confidence_level_95: f64,
    pub confidence_level_99: f64,
    pub var_limit_pct: f64,
}

impl Default for VarConfig {
    fn default() -> Self {
        VarConfig {
            window_size: 252,
            simulation_count: 10_000,
            horizon: 1.0,
            update_interval_ms: 60_000,
            confidence_level_95: 0.95,
            confidence_level_99: 0.99,
            var_limit_pct: 2.0,
        }
    }
}

/// Alert bus throttling and retention configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub min_alert_interval_ms: u64,
    pub max_alert_history: usize,
    pub warning_threshold_pct: f64,
    pub critical_threshold_pct: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            min_alert_interval_ms: 5000,
            max_alert_history: 1000,
            warning_threshold_pct: 80.0,
            critical_threshold_pct: 100.0,
        }
    }
}

/// Unified risk configuration for the control plane.
///
/// # Invariants
///
/// After [`RiskConfig::validate`] succeeds: every size/value/exposure limit
/// is strictly positive, `max_drawdown_pct` and the alert thresholds lie in
/// `(0, 100]`, and both VaR confidence levels lie in `(0, 1)`.
///
/// ```rust
/// use risk_control_plane::RiskConfig;
///
/// let config = RiskConfig::default();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub limits: RiskLimits,
    pub circuit_breaker: CircuitBreakerConfig,
    pub var: VarConfig,
    pub alerts: AlertConfig,
}

impl RiskConfig {
    /// Validate that every limit and threshold is within a sane range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |field: &str, value: f64| -> Result<(), ConfigError> {
            if value <= 0.0 {
                return Err(ConfigError::Validation {
                    field: field.to_string(),
                    reason: format!("must be positive, got {value}"),
                });
            }
            Ok(())
        };

        positive("limits.max_position_size", self.limits.max_position_size)?;
        positive("limits.max_notional_exposure", self.limits.max_notional_exposure)?;
        positive("limits.max_net_exposure", self.limits.max_net_exposure)?;
        positive("limits.max_gross_exposure", self.limits.max_gross_exposure)?;
        positive("limits.daily_loss_limit", self.limits.daily_loss_limit)?;
        positive("limits.max_order_size", self.limits.max_order_size)?;
        positive("limits.max_order_value", self.limits.max_order_value)?;
        positive("limits.max_daily_volume", self.limits.max_daily_volume)?;

        if !(0.0..=100.0).contains(&self.limits.max_drawdown_pct) || self.limits.max_drawdown_pct <= 0.0 {
            return Err(ConfigError::Validation {
                field: "limits.max_drawdown_pct".to_string(),
                reason: format!("must be in (0, 100], got {}", self.limits.max_drawdown_pct),
            });
        }
        if self.limits.max_orders_per_second == 0 {
            return Err(ConfigError::Validation {
                field: "limits.max_orders_per_second".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        positive("circuit_breaker.price_move_1min_pct", self.circuit_breaker.price_move_1min_pct)?;
        positive("circuit_breaker.price_move_5min_pct", self.circuit_breaker.price_move_5min_pct)?;
        positive("circuit_breaker.spread_widen_multiplier", self.circuit_breaker.spread_widen_multiplier)?;
        positive("circuit_breaker.volume_spike_multiplier", self.circuit_breaker.volume_spike_multiplier)?;

        positive("var.window_size", self.var.window_size as f64)?;
        positive("var.simulation_count", self.var.simulation_count as f64)?;
        positive("var.horizon", self.var.horizon)?;
        if !(0.0..1.0).contains(&self.var.confidence_level_95) || self.var.confidence_level_95 <= 0.0 {
            return Err(ConfigError::Validation {
                field: "var.confidence_level_95".to_string(),
                reason: format!("must be in (0, 1), got {}", self.var.confidence_level_95),
            });
        }
        if !(0.0..1.0).contains(&self.var.confidence_level_99) || self.var.confidence_level_99 <= 0.0 {
            return Err(ConfigError::Validation {
                field: "var.confidence_level_99".to_string(),
                reason: format!("must be in (0, 1), got {}", self.var.confidence_level_99),
            });
        }

        positive("alerts.min_alert_interval_ms", self.alerts.min_alert_interval_ms as f64)?;
        positive("alerts.max_alert_history", self.alerts.max_alert_history as f64)?;

        Ok(())
    }

    /// Load and validate a config from a JSON file on disk.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text)?;
        let config = Self::from_json(&value);
        config.validate()?;
        Ok(config)
    }

    /// Write this config to disk as JSON rooted at `risk_management`.
    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(&self.to_json())?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })
    }

    /// Parse a config from a JSON value rooted at `risk_management`.
    /// Missing fields default; unknown fields are ignored; this never fails
    /// — a malformed or absent `risk_management` object just yields defaults.
    pub fn from_json(j: &Value) -> Self {
        let mut config = RiskConfig::default();
        let Some(rm) = j.get("risk_management") else {
            return config;
        };

        if let Some(lim) = rm.get("limits") {
            let l = &mut config.limits;
            l.max_position_size = num(lim, "max_position_size", l.max_position_size);
            l.max_notional_exposure = num(lim, "max_notional_exposure", l.max_notional_exposure);
            l.max_net_exposure = num(lim, "max_net_exposure", l.max_net_exposure);
            l.max_gross_exposure = num(lim, "max_gross_exposure", l.max_gross_exposure);
            l.max_drawdown_pct = num(lim, "max_drawdown_pct", l.max_drawdown_pct);
            l.daily_loss_limit = num(lim, "daily_loss_limit", l.daily_loss_limit);
            l.max_order_size = num(lim, "max_order_size", l.max_order_size);
            l.max_order_value = num(lim, "max_order_value", l.max_order_value);
            l.max_daily_volume = num(lim, "max_daily_volume", l.max_daily_volume);
            l.max_orders_per_second = num(lim, "max_orders_per_second", l.max_orders_per_second as f64) as u32;
        }

        if let Some(cb) = rm.get("circuit_breaker") {
            let c = &mut config.circuit_breaker;
            c.price_move_1min_pct = num(cb, "price_move_1min_pct", c.price_move_1min_pct);
            c.price_move_5min_pct = num(cb, "price_move_5min_pct", c.price_move_5min_pct);
            c.spread_widen_multiplier = num(cb, "spread_widen_multiplier", c.spread_widen_multiplier);
            c.volume_spike_multiplier = num(cb, "volume_spike_multiplier", c.volume_spike_multiplier);
            c.cooldown_period_ms = num(cb, "cooldown_period_ms", c.cooldown_period_ms as f64) as u64;
            c.half_open_test_duration_ms = num(cb, "half_open_test_duration_ms", c.half_open_test_duration_ms as f64) as u64;
            c.max_latency_us = num(cb, "max_latency_us", c.max_latency_us as f64) as u64;
            c.price_history_size = num(cb, "price_history_size", c.price_history_size as f64) as usize;
        }

        if let Some(v) = rm.get("var") {
            let vc = &mut config.var;
            vc.window_size = num(v, "window_size", vc.window_size as f64) as usize;
            vc.simulation_count = num(v, "simulation_count", vc.simulation_count as f64) as usize;
            vc.horizon = num(v, "horizon", vc.horizon);
            vc.update_interval_ms = num(v, "update_interval_ms", vc.update_interval_ms as f64) as u64;
            vc.var_limit_pct = num(v, "var_limit_pct", vc.var_limit_pct);
            // confidence_level_95/99 are not part of the wire schema's `var`
            // sub-object in the source; they keep their defaults unless a
            // caller mutates the struct directly after loading.
        }

        if let Some(ah) = rm.get("auto_hedge") {
            let l = &mut config.limits;
            l.auto_hedge_enabled = ah.get("enabled").and_then(Value::as_bool).unwrap_or(l.auto_hedge_enabled);
            l.hedge_threshold_pct = num(ah, "threshold_pct", l.hedge_threshold_pct);
            l.hedge_interval_ms = num(ah, "interval_ms", l.hedge_interval_ms as f64) as u64;
        }

        if let Some(al) = rm.get("alerts") {
            let a = &mut config.alerts;
            a.min_alert_interval_ms = num(al, "min_interval_ms", a.min_alert_interval_ms as f64) as u64;
            a.max_alert_history = num(al, "max_history", a.max_alert_history as f64) as usize;
            a.warning_threshold_pct = num(al, "warning_threshold_pct", a.warning_threshold_pct);
            a.critical_threshold_pct = num(al, "critical_threshold_pct", a.critical_threshold_pct);
        }

        config
    }

    /// Serialize to the JSON shape consumers and [`RiskConfig::from_json`] expect.
    pub fn to_json(&self) -> Value {
        json!({
            "risk_management": {
                "limits": {
                    "max_position_size": self.limits.max_position_size,
                    "max_notional_exposure": self.limits.max_notional_exposure,
                    "max_net_exposure": self.limits.max_net_exposure,
                    "max_gross_exposure": self.limits.max_gross_exposure,
                    "max_drawdown_pct": self.limits.max_drawdown_pct,
                    "daily_loss_limit": self.limits.daily_loss_limit,
                    "max_order_size": self.limits.max_order_size,
                    "max_order_value": self.limits.max_order_value,
                    "max_daily_volume": self.limits.max_daily_volume,
                    "max_orders_per_second": self.limits.max_orders_per_second,
                },
                "circuit_breaker": {
                    "price_move_1min_pct": self.circuit_breaker.price_move_1min_pct,
                    "price_move_5min_pct": self.circuit_breaker.price_move_5min_pct,
                    "spread_widen_multiplier": self.circuit_breaker.spread_widen_multiplier,
                    "volume_spike_multiplier": self.circuit_breaker.volume_spike_multiplier,
                    "cooldown_period_ms": self.circuit_breaker.cooldown_period_ms,
                    "half_open_test_duration_ms": self.circuit_breaker.half_open_test_duration_ms,
                    "max_latency_us": self.circuit_breaker.max_latency_us,
                    "price_history_size": self.circuit_breaker.price_history_size,
                },
                "var": {
                    "window_size": self.var.window_size,
                    "simulation_count": self.var.simulation_count,
                    "horizon": self.var.horizon,
                    "update_interval_ms": self.var.update_interval_ms,
                    "var_limit_pct": self.var.var_limit_pct,
                },
                "auto_hedge": {
                    "enabled": self.limits.auto_hedge_enabled,
                    "threshold_pct": self.limits.hedge_threshold_pct,
                    "interval_ms": self.limits.hedge_interval_ms,
                },
                "alerts": {
                    "min_interval_ms": self.alerts.min_alert_interval_ms,
                    "max_history": self.alerts.max_alert_history,
                    "warning_threshold_pct": self.alerts.warning_threshold_pct,
                    "critical_threshold_pct": self.alerts.critical_threshold_pct,
                },
            }
        })
    }
}

fn num(obj: &Value, key: &str, default: f64) -> f64 {
    obj.get(key).and_then(Value::as_f64).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RiskConfig::default().validate().is_ok());
    }

    #[test]
    fn round_trips_through_json() {
        let config = RiskConfig::default();
        let restored = RiskConfig::from_json(&config.to_json());
        assert_eq!(config, restored);
    }

    #[test]
    fn missing_fields_default() {
        let j = json!({ "risk_management": { "limits": { "max_position_size": 42.0 } } });
        let config = RiskConfig::from_json(&j);
        assert_eq!(config.limits.max_position_size, 42.0);
        assert_eq!(config.limits.max_net_exposure, RiskLimits::default().max_net_exposure);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let j = json!({ "risk_management": { "limits": { "bogus_field": 1.0 } }, "unrelated": true });
        let config = RiskConfig::from_json(&j);
        assert_eq!(config, RiskConfig::default());
    }

    #[test]
    fn rejects_non_positive_position_size() {
        let mut config = RiskConfig::default();
        config.limits.max_position_size = 0.0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { field, .. } if field == "limits.max_position_size"));
    }

    #[test]
    fn rejects_out_of_range_confidence_level() {
        let mut config = RiskConfig::default();
        config.var.confidence_level_95 = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn auto_hedge_round_trips_into_limits() {
        let j = json!({
            "risk_management": {
                "auto_hedge": { "enabled": true, "threshold_pct": 75.0, "interval_ms": 2500 }
            }
        });
        let config = RiskConfig::from_json(&j);
        assert!(config.limits.auto_hedge_enabled);
        assert_eq!(config.limits.hedge_threshold_pct, 75.0);
        assert_eq!(config.limits.hedge_interval_ms, 2500);
    }
}
