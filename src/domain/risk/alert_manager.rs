//! Alert history, throttling, and delivery.
//!
//! Alert ids are assigned before the throttle check runs, so a throttled
//! alert still consumes an id — callers should treat a `0` return from
//! [`AlertManager::raise`] as "suppressed," not "never happened."

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::domain::config::AlertConfig;
use crate::infrastructure::audit::{AuditEvent, AuditEventType, AuditLogger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertType {
    PositionWarning,
    PositionBreach,
    DrawdownWarning,
    DrawdownBreach,
    DailyLossWarning,
    DailyLossBreach,
    VarBreach,
    CircuitBreakerOpen,
    CircuitBreakerHalfOpen,
    CircuitBreakerClosed,
    SpreadAnomaly,
    VolumeAnomaly,
    LatencyWarning,
    ConnectivityIssue,
    RegimeChange,
    SystemError,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::PositionWarning => "POSITION_WARNING",
            AlertType::PositionBreach => "POSITION_BREACH",
            AlertType::DrawdownWarning => "DRAWDOWN_WARNING",
            AlertType::DrawdownBreach => "DRAWDOWN_BREACH",
            AlertType::DailyLossWarning => "DAILY_LOSS_WARNING",
            AlertType::DailyLossBreach => "DAILY_LOSS_BREACH",
            AlertType::VarBreach => "VAR_BREACH",
            AlertType::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            AlertType::CircuitBreakerHalfOpen => "CIRCUIT_BREAKER_HALF_OPEN",
            AlertType::CircuitBreakerClosed => "CIRCUIT_BREAKER_CLOSED",
            AlertType::SpreadAnomaly => "SPREAD_ANOMALY",
            AlertType::VolumeAnomaly => "VOLUME_ANOMALY",
            AlertType::LatencyWarning => "LATENCY_WARNING",
            AlertType::ConnectivityIssue => "CONNECTIVITY_ISSUE",
            AlertType::RegimeChange => "REGIME_CHANGE",
            AlertType::SystemError => "SYSTEM_ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
            AlertSeverity::Emergency => "EMERGENCY",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub id: u64,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub source: String,
    pub metadata: Value,
    pub timestamp_ms: u64,
    pub acknowledged: bool,
    pub acknowledged_at_ms: u64,
}

pub type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;

struct Storage {
    alerts: VecDeque<Alert>,
    last_alert_time_ms: HashMap<AlertType, u64>,
}

pub struct AlertManager {
    config: Mutex<AlertConfig>,
    next_alert_id: AtomicU64,
    storage: Mutex<Storage>,
    callbacks: Mutex<Vec<AlertCallback>>,
    audit: Arc<AuditLogger>,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self::with_audit(config, Arc::new(AuditLogger::new()))
    }

    /// Same as [`AlertManager::new`] but sharing a caller-supplied audit
    /// trail instead of creating a private one.
    pub fn with_audit(config: AlertConfig, audit: Arc<AuditLogger>) -> Self {
        tracing::info!(
            min_interval_ms = config.min_alert_interval_ms,
            max_history = config.max_alert_history,
            warning_pct = config.warning_threshold_pct,
            critical_pct = config.critical_threshold_pct,
            "alert manager initialized"
        );
        AlertManager {
            config: Mutex::new(config),
            next_alert_id: AtomicU64::new(1),
            storage: Mutex::new(Storage { alerts: VecDeque::new(), last_alert_time_ms: HashMap::new() }),
            callbacks: Mutex::new(Vec::new()),
            audit,
        }
    }

    /// Clears history, throttle timers, and callbacks, then applies `config`.
    pub fn initialize(&self, config: AlertConfig) {
        *self.config.lock().unwrap() = config;
        {
            let mut storage = self.storage.lock().unwrap();
            storage.alerts.clear();
            storage.last_alert_time_ms.clear();
        }
        self.callbacks.lock().unwrap().clear();
    }

    /// Returns the new alert's id, or `0` if it was throttled.
    pub fn raise(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
        metadata: Value,
    ) -> u64 {
        let message = message.into();
        let source = source.into();
        let id = self.next_alert_id.fetch_add(1, Ordering::Relaxed);
        let timestamp_ms = now_millis();

        let alert = Alert {
            id,
            alert_type,
            severity,
            message: message.clone(),
            source,
            metadata,
            timestamp_ms,
            acknowledged: false,
            acknowledged_at_ms: 0,
        };

        let min_interval_ms = self.config.lock().unwrap().min_alert_interval_ms;
        {
            let mut storage = self.storage.lock().unwrap();
            if let Some(&last) = storage.last_alert_time_ms.get(&alert_type) {
                if timestamp_ms.saturating_sub(last) < min_interval_ms {
                    return 0;
                }
            }

            storage.alerts.push_back(alert.clone());
            storage.last_alert_time_ms.insert(alert_type, timestamp_ms);

            let max_history = self.config.lock().unwrap().max_alert_history;
            while storage.alerts.len() > max_history {
                storage.alerts.pop_front();
            }
        }

        match severity {
            AlertSeverity::Info => tracing::info!(alert_type = alert_type.as_str(), severity = severity.as_str(), "{message}"),
            AlertSeverity::Warning => tracing::warn!(alert_type = alert_type.as_str(), severity = severity.as_str(), "{message}"),
            AlertSeverity::Critical => tracing::error!(alert_type = alert_type.as_str(), severity = severity.as_str(), "{message}"),
            AlertSeverity::Emergency => tracing::error!(alert_type = alert_type.as_str(), severity = severity.as_str(), emergency = true, "{message}"),
        }

        if matches!(severity, AlertSeverity::Critical | AlertSeverity::Emergency) {
            self.audit.log_event(AuditEvent::new(
                AuditEventType::SuspiciousActivity,
                format!("{} alert raised: {message}", severity.as_str()),
                false,
            ));
        }

        self.deliver(&alert);
        id
    }

    pub fn acknowledge(&self, alert_id: u64) -> bool {
        let mut storage = self.storage.lock().unwrap();
        for alert in storage.alerts.iter_mut() {
            if alert.id == alert_id {
                if alert.acknowledged {
                    return false;
                }
                alert.acknowledged = true;
                alert.acknowledged_at_ms = now_millis();
                tracing::info!(alert_id, alert_type = alert.alert_type.as_str(), "alert acknowledged");
                return true;
            }
        }
        false
    }

    /// Most recent first.
    pub fn recent_alerts(&self, count: usize) -> Vec<Alert> {
        let storage = self.storage.lock().unwrap();
        let start = storage.alerts.len().saturating_sub(count);
        storage.alerts.iter().skip(start).rev().cloned().collect()
    }

    /// Most recent first.
    pub fn unacknowledged_alerts(&self) -> Vec<Alert> {
        let storage = self.storage.lock().unwrap();
        storage.alerts.iter().filter(|a| !a.acknowledged).rev().cloned().collect()
    }

    /// Most recent first, capped at `count`.
    pub fn alerts_by_type(&self, alert_type: AlertType, count: usize) -> Vec<Alert> {
        let storage = self.storage.lock().unwrap();
        storage.alerts.iter().rev().filter(|a| a.alert_type == alert_type).take(count).cloned().collect()
    }

    /// Most recent first, capped at `count`.
    pub fn alerts_by_severity(&self, severity: AlertSeverity, count: usize) -> Vec<Alert> {
        let storage = self.storage.lock().unwrap();
        storage.alerts.iter().rev().filter(|a| a.severity == severity).take(count).cloned().collect()
    }

    pub fn register_callback(&self, callback: AlertCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    pub fn total_alert_count(&self) -> usize {
        self.storage.lock().unwrap().alerts.len()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.storage.lock().unwrap().alerts.iter().filter(|a| !a.acknowledged).count()
    }

    pub fn alert_to_json(alert: &Alert) -> Value {
        json!({
            "id": alert.id,
            "type": alert.alert_type.as_str(),
            "severity": alert.severity.as_str(),
            "message": alert.message,
            "source": alert.source,
            "metadata": alert.metadata,
            "timestamp": alert.timestamp_ms,
            "acknowledged": alert.acknowledged,
            "acknowledged_at": alert.acknowledged_at_ms,
        })
    }

    /// `recent_alerts` here is oldest-first (the last 50, in storage order),
    /// unlike the reverse-chronological order of [`AlertManager::recent_alerts`].
    pub fn to_json(&self) -> Value {
        let storage = self.storage.lock().unwrap();
        let start = storage.alerts.len().saturating_sub(50);
        let recent: Vec<Value> = storage.alerts.iter().skip(start).map(Self::alert_to_json).collect();
        let unacked = storage.alerts.iter().filter(|a| !a.acknowledged).count();

        json!({
            "total_alerts": storage.alerts.len(),
            "unacknowledged_count": unacked,
            "recent_alerts": recent,
        })
    }

    fn deliver(&self, alert: &Alert) {
        let callbacks = self.callbacks.lock().unwrap();
        for cb in callbacks.iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| cb(alert)));
            if result.is_err() {
                tracing::error!(alert_id = alert.id, "alert callback panicked");
            }
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AlertConfig {
        AlertConfig {
            min_alert_interval_ms: 50,
            max_alert_history: 5,
            warning_threshold_pct: 80.0,
            critical_threshold_pct: 100.0,
        }
    }

    #[test]
    fn raise_returns_nonzero_id() {
        let am = AlertManager::new(config());
        let id = am.raise(AlertType::PositionWarning, AlertSeverity::Warning, "near limit", "test", Value::Null);
        assert_ne!(id, 0);
    }

    #[test]
    fn critical_and_emergency_alerts_are_recorded_in_the_audit_trail() {
        let audit = Arc::new(AuditLogger::new());
        let am = AlertManager::with_audit(config(), Arc::clone(&audit));
        am.raise(AlertType::PositionWarning, AlertSeverity::Warning, "ignored severity", "", Value::Null);
        am.raise(AlertType::VarBreach, AlertSeverity::Critical, "critical breach", "", Value::Null);

        let events = audit.recent_events(10);
        assert!(events.iter().any(|e| e.description.contains("critical breach")));
        assert!(!events.iter().any(|e| e.description.contains("ignored severity")));
    }

    #[test]
    fn repeated_alert_of_same_type_is_throttled() {
        let am = AlertManager::new(config());
        let id1 = am.raise(AlertType::VarBreach, AlertSeverity::Critical, "m1", "", Value::Null);
        let id2 = am.raise(AlertType::VarBreach, AlertSeverity::Critical, "m2", "", Value::Null);
        assert_ne!(id1, 0);
        assert_eq!(id2, 0);
    }

    #[test]
    fn throttled_alert_still_consumes_an_id() {
        let am = AlertManager::new(config());
        am.raise(AlertType::VarBreach, AlertSeverity::Critical, "m1", "", Value::Null);
        am.raise(AlertType::VarBreach, AlertSeverity::Critical, "m2", "", Value::Null);
        let id3 = am.raise(AlertType::DrawdownWarning, AlertSeverity::Warning, "m3", "", Value::Null);
        assert_eq!(id3, 3);
    }

    #[test]
    fn history_is_pruned_beyond_max() {
        let am = AlertManager::new(config());
        for i in 0..10 {
            let t = if i % 2 == 0 { AlertType::PositionWarning } else { AlertType::PositionBreach };
            std::thread::sleep(std::time::Duration::from_millis(2));
            am.raise(t, AlertSeverity::Info, format!("alert {i}"), "", Value::Null);
        }
        assert!(am.total_alert_count() <= 5);
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let am = AlertManager::new(config());
        let id = am.raise(AlertType::SystemError, AlertSeverity::Critical, "boom", "", Value::Null);
        assert!(am.acknowledge(id));
        assert!(!am.acknowledge(id));
    }

    #[test]
    fn recent_alerts_are_most_recent_first() {
        let am = AlertManager::new(config());
        am.raise(AlertType::PositionWarning, AlertSeverity::Info, "first", "", Value::Null);
        std::thread::sleep(std::time::Duration::from_millis(60));
        am.raise(AlertType::PositionBreach, AlertSeverity::Info, "second", "", Value::Null);

        let recent = am.recent_alerts(10);
        assert_eq!(recent[0].message, "second");
        assert_eq!(recent[1].message, "first");
    }

    #[test]
    fn to_json_recent_alerts_are_oldest_first() {
        let am = AlertManager::new(config());
        am.raise(AlertType::PositionWarning, AlertSeverity::Info, "first", "", Value::Null);
        std::thread::sleep(std::time::Duration::from_millis(60));
        am.raise(AlertType::PositionBreach, AlertSeverity::Info, "second", "", Value::Null);

        let json = am.to_json();
        let recent = json["recent_alerts"].as_array().unwrap();
        assert_eq!(recent[0]["message"], "first");
        assert_eq!(recent[1]["message"], "second");
    }

    #[test]
    fn callback_receives_raised_alerts() {
        let am = AlertManager::new(config());
        let received = std::sync::Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        am.register_callback(Box::new(move |alert: &Alert| {
            received_clone.lock().unwrap().push(alert.id);
        }));
        am.raise(AlertType::LatencyWarning, AlertSeverity::Warning, "slow", "", Value::Null);
        assert_eq!(received.lock().unwrap().len(), 1);
    }
}
