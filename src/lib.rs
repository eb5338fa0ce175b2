//! Trading risk and control plane.
//!
//! Four tightly coupled components sit on top of a shared configuration
//! schema and a disaster-recovery persistence layer: a pre-trade
//! [`domain::risk::risk_manager::RiskManager`], a
//! [`domain::risk::circuit_breaker::CircuitBreaker`] state machine, a
//! [`domain::risk::var_engine::VarEngine`], and an
//! [`domain::risk::alert_manager::AlertManager`]. None of them place
//! orders, route to an exchange, or make strategy decisions; they only
//! decide whether trading may proceed and bound losses by halting it.

pub mod domain;
pub mod infrastructure;

pub use domain::config::{AlertConfig, CircuitBreakerConfig, ConfigError, RiskConfig, RiskLimits, VarConfig};
pub use domain::risk::alert_manager::{Alert, AlertManager, AlertSeverity, AlertType};
pub use domain::risk::circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitBreakerStatus, CircuitBreakerTrigger};
pub use domain::risk::risk_manager::{RiskCheckResult, RiskManager, RiskState};
pub use domain::risk::var_engine::{VarEngine, VarResult};
pub use domain::types::OrderSide;
pub use infrastructure::audit::{AuditEvent, AuditEventType, AuditLogger};
pub use infrastructure::persistence::{BackupInfo, DisasterRecovery, PersistenceError, ReconciliationResult};
