//! Headless risk and control-plane server.
//!
//! Boots the four risk components against a persisted config and state
//! directory, wires the circuit breaker's state transitions into the alert
//! manager, and runs an idle supervisory loop that periodically snapshots
//! state to disk. There is no network surface here: this binary is the
//! composition root a market-making strategy process embeds or
//! subprocesses, not a service other systems dial into directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::prelude::*;

use risk_control_plane::{
    AlertManager, AlertSeverity, AlertType, AuditLogger, CircuitBreaker, CircuitBreakerState,
    DisasterRecovery, RiskConfig, RiskManager, VarEngine,
};

#[derive(Parser, Debug)]
#[command(name = "risk-server", about = "Headless trading risk and control plane")]
struct Args {
    /// Path to a JSON risk configuration file. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for persisted risk/strategy state and backups.
    #[arg(long, default_value = "./risk-state")]
    state_dir: PathBuf,

    /// Seconds between idle-loop state snapshots.
    #[arg(long, default_value_t = 30)]
    snapshot_interval_secs: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("risk-server {} starting", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => RiskConfig::from_file(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => RiskConfig::default(),
    };
    config.validate().context("validating risk configuration")?;
    info!(?args.state_dir, "configuration loaded");

    let audit = Arc::new(AuditLogger::new());
    let recovery = DisasterRecovery::new(args.state_dir.clone(), Arc::clone(&audit));
    recovery.initialize().context("initializing persistence directory")?;

    let risk_manager = RiskManager::with_audit(config.limits.clone(), Arc::clone(&audit));
    let circuit_breaker = Arc::new(CircuitBreaker::with_audit(config.circuit_breaker.clone(), Arc::clone(&audit)));
    let var_engine = Arc::new(VarEngine::new(config.var.clone()));
    let alert_manager = Arc::new(AlertManager::with_audit(config.alerts.clone(), Arc::clone(&audit)));

    {
        let alert_manager = Arc::clone(&alert_manager);
        circuit_breaker.register_callback(Box::new(move |_old, new_state, trigger| {
            let (alert_type, severity) = match new_state {
                CircuitBreakerState::Open => (AlertType::CircuitBreakerOpen, AlertSeverity::Critical),
                CircuitBreakerState::HalfOpen => (AlertType::CircuitBreakerHalfOpen, AlertSeverity::Warning),
                CircuitBreakerState::Closed => (AlertType::CircuitBreakerClosed, AlertSeverity::Info),
            };
            alert_manager.raise(
                alert_type,
                severity,
                format!("circuit breaker transitioned to {} (trigger: {})", new_state.as_str(), trigger.as_str()),
                "circuit_breaker",
                serde_json::Value::Null,
            );
        }));
    }

    let risk_state = recovery.load_risk_state();
    if risk_state != serde_json::json!({}) {
        risk_manager.from_json(&risk_state);
        info!("restored risk manager state from prior run");
    }

    var_engine.start();

    info!("risk-server running; all components initialized");

    loop {
        std::thread::sleep(Duration::from_secs(args.snapshot_interval_secs));

        let risk_json = risk_manager.to_json();
        let strategy_json = serde_json::json!({});
        if recovery.save_risk_state(&risk_json, &strategy_json) {
            info!("periodic state snapshot saved");
        }

        if var_engine.is_var_breached(risk_manager.position().abs().max(1.0) * 100_000.0) {
            alert_manager.raise(
                AlertType::VarBreach,
                AlertSeverity::Warning,
                "historical VaR exceeds configured limit",
                "var_engine",
                serde_json::Value::Null,
            );
        }
    }
}
