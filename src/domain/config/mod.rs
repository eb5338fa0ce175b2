//! Risk configuration domain value objects.
//!
//! # Design principles
//!
//! Every limit defaults to the conservative value the original risk desk
//! shipped with; [`RiskConfig::validate`] rejects nonsensical combinations
//! (negative sizes, out-of-range percentages) before a config is allowed to
//! reach a running component. The external wire format is a single JSON
//! object rooted at `risk_management` (see [`RiskConfig::to_json`] /
//! [`RiskConfig::from_json`]); it is intentionally decoupled from the Rust
//! field layout so that `auto_hedge_enabled`, `hedge_threshold_pct`, and
//! `hedge_interval_ms` — which live on [`RiskLimits`] here — serialize into
//! their own `auto_hedge` sub-object, matching the source schema.

mod error;
mod risk_config;

pub use error::ConfigError;
pub use risk_config::{AlertConfig, CircuitBreakerConfig, RiskConfig, RiskLimits, VarConfig};
