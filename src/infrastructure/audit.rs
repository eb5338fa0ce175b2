//! Structured audit trail for security- and risk-relevant events.
//!
//! Every event is emitted through `tracing` as a structured `audit` span so
//! it flows into whatever subscriber the binary installs (file, stdout,
//! collector), and is also retained in a bounded in-memory ring for
//! inspection by operational tooling without needing a log-scraper.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    AuthenticationSuccess,
    AuthenticationFailure,
    CredentialAccess,
    CredentialModification,
    ConfigAccess,
    ConfigModification,
    NetworkConnection,
    NetworkFailure,
    OrderSubmission,
    OrderModification,
    OrderCancellation,
    DataAccess,
    PrivilegeEscalation,
    SuspiciousActivity,
    SystemStart,
    SystemStop,
    ErrorCondition,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventType::AuthenticationSuccess => "AUTH_SUCCESS",
            AuditEventType::AuthenticationFailure => "AUTH_FAILURE",
            AuditEventType::CredentialAccess => "CREDENTIAL_ACCESS",
            AuditEventType::CredentialModification => "CREDENTIAL_MODIFICATION",
            AuditEventType::ConfigAccess => "CONFIG_ACCESS",
            AuditEventType::ConfigModification => "CONFIG_MODIFICATION",
            AuditEventType::NetworkConnection => "NETWORK_CONNECTION",
            AuditEventType::NetworkFailure => "NETWORK_FAILURE",
            AuditEventType::OrderSubmission => "ORDER_SUBMISSION",
            AuditEventType::OrderModification => "ORDER_MODIFICATION",
            AuditEventType::OrderCancellation => "ORDER_CANCELLATION",
            AuditEventType::DataAccess => "DATA_ACCESS",
            AuditEventType::PrivilegeEscalation => "PRIVILEGE_ESCALATION",
            AuditEventType::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            AuditEventType::SystemStart => "SYSTEM_START",
            AuditEventType::SystemStop => "SYSTEM_STOP",
            AuditEventType::ErrorCondition => "ERROR_CONDITION",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub user_id: String,
    pub session_id: String,
    pub source: String,
    pub target: String,
    pub description: String,
    pub timestamp_ms: u64,
    pub success: bool,
    pub additional_data: Value,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, description: impl Into<String>, success: bool) -> Self {
        AuditEvent {
            event_type,
            user_id: String::new(),
            session_id: String::new(),
            source: String::new(),
            target: String::new(),
            description: description.into(),
            timestamp_ms: now_millis(),
            success,
            additional_data: Value::Null,
        }
    }
}

struct Session {
    user_id: String,
    session_id: String,
}

/// Capacity of the in-memory retention ring. Older events are dropped once
/// exceeded; `tracing` output is the durable record.
const RETENTION_CAPACITY: usize = 10_000;

pub struct AuditLogger {
    enabled: Mutex<bool>,
    session: Mutex<Session>,
    events: Mutex<VecDeque<AuditEvent>>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        let logger = AuditLogger {
            enabled: Mutex::new(true),
            session: Mutex::new(Session { user_id: String::new(), session_id: String::new() }),
            events: Mutex::new(VecDeque::new()),
        };
        logger.log_event(AuditEvent::new(AuditEventType::SystemStart, "audit logging initialized", true));
        logger
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap()
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock().unwrap() = enabled;
    }

    pub fn set_current_session(&self, user_id: impl Into<String>, session_id: impl Into<String>) {
        let user_id = user_id.into();
        let session_id = session_id.into();
        {
            let mut session = self.session.lock().unwrap();
            session.user_id = user_id.clone();
            session.session_id = session_id.clone();
        }
        let mut event = AuditEvent::new(AuditEventType::AuthenticationSuccess, "session established", true);
        event.user_id = user_id;
        event.session_id = session_id;
        self.log_event(event);
    }

    pub fn log_event(&self, mut event: AuditEvent) {
        if !self.is_enabled() {
            return;
        }

        {
            let session = self.session.lock().unwrap();
            if event.user_id.is_empty() {
                event.user_id = session.user_id.clone();
            }
            if event.session_id.is_empty() {
                event.session_id = session.session_id.clone();
            }
        }

        if matches!(
            event.event_type,
            AuditEventType::AuthenticationFailure | AuditEventType::SuspiciousActivity | AuditEventType::PrivilegeEscalation
        ) {
            tracing::warn!(target: "audit", event_type = event.event_type.as_str(), "security event: {}", event.description);
        } else {
            tracing::info!(target: "audit", event_type = event.event_type.as_str(), success = event.success, "{}", event.description);
        }

        let mut events = self.events.lock().unwrap();
        events.push_back(event);
        while events.len() > RETENTION_CAPACITY {
            events.pop_front();
        }
    }

    pub fn log_authentication(&self, success: bool, user_id: impl Into<String>, source: impl Into<String>) {
        let mut event =
            AuditEvent::new(if success { AuditEventType::AuthenticationSuccess } else { AuditEventType::AuthenticationFailure }, "authentication attempt", success);
        event.user_id = user_id.into();
        event.source = source.into();
        self.log_event(event);
    }

    pub fn log_credential_access(&self, user_id: impl Into<String>, credential_type: impl Into<String>, success: bool) {
        let credential_type = credential_type.into();
        let mut event = AuditEvent::new(AuditEventType::CredentialAccess, "credential access attempt", success);
        event.user_id = user_id.into();
        event.target = credential_type.clone();
        event.additional_data = json!({ "type": credential_type });
        self.log_event(event);
    }

    pub fn log_network_connection(&self, destination: impl Into<String>, success: bool, protocol: impl Into<String>) {
        let mut event = AuditEvent::new(AuditEventType::NetworkConnection, "network connection attempt", success);
        event.target = destination.into();
        event.additional_data = json!({ "protocol": protocol.into() });
        self.log_event(event);
    }

    pub fn log_order_activity(&self, user_id: impl Into<String>, order_id: impl Into<String>, action: &str, symbol: impl Into<String>, success: bool) {
        let event_type = match action {
            "submit" => AuditEventType::OrderSubmission,
            "modify" => AuditEventType::OrderModification,
            "cancel" => AuditEventType::OrderCancellation,
            _ => AuditEventType::OrderSubmission,
        };
        let order_id = order_id.into();
        let symbol = symbol.into();
        let mut event = AuditEvent::new(event_type, format!("order {action} attempt"), success);
        event.user_id = user_id.into();
        event.target = order_id.clone();
        event.additional_data = json!({ "order_id": order_id, "action": action, "symbol": symbol });
        self.log_event(event);
    }

    pub fn log_config_access(&self, user_id: impl Into<String>, config_path: impl Into<String>, action: &str, success: bool) {
        let event_type = if action == "write" || action == "modify" { AuditEventType::ConfigModification } else { AuditEventType::ConfigAccess };
        let config_path = config_path.into();
        let mut event = AuditEvent::new(event_type, format!("configuration {action} attempt"), success);
        event.user_id = user_id.into();
        event.target = config_path.clone();
        event.additional_data = json!({ "path": config_path, "action": action });
        self.log_event(event);
    }

    pub fn log_suspicious_activity(&self, description: impl Into<String>, source: impl Into<String>, severity: impl Into<String>) {
        let mut event = AuditEvent::new(AuditEventType::SuspiciousActivity, description, false);
        event.source = source.into();
        event.additional_data = json!({ "severity": severity.into(), "requires_investigation": true });
        self.log_event(event);
    }

    pub fn log_system_event(&self, description: impl Into<String>, success: bool) {
        let event_type = if success { AuditEventType::SystemStart } else { AuditEventType::ErrorCondition };
        self.log_event(AuditEvent::new(event_type, description, success));
    }

    pub fn recent_events(&self, count: usize) -> Vec<AuditEvent> {
        let events = self.events.lock().unwrap();
        let start = events.len().saturating_sub(count);
        events.iter().skip(start).cloned().collect()
    }

    pub fn event_to_json(event: &AuditEvent) -> Value {
        json!({
            "timestamp": event.timestamp_ms,
            "event_type": event.event_type.as_str(),
            "user_id": event.user_id,
            "session_id": event.session_id,
            "source": event.source,
            "target": event.target,
            "description": event.description,
            "success": event.success,
            "additional_data": event.additional_data,
        })
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_event_is_recorded() {
        let logger = AuditLogger::new();
        let events = logger.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::SystemStart);
    }

    #[test]
    fn disabled_logger_drops_events() {
        let logger = AuditLogger::new();
        logger.set_enabled(false);
        logger.log_system_event("should be dropped", true);
        assert_eq!(logger.recent_events(10).len(), 1);
    }

    #[test]
    fn session_fills_in_blank_user_and_session_ids() {
        let logger = AuditLogger::new();
        logger.set_current_session("alice", "sess-1");
        logger.log_order_activity("", "ord-1", "submit", "BTC-USD", true);

        let events = logger.recent_events(10);
        let order_event = events.iter().find(|e| e.event_type == AuditEventType::OrderSubmission).unwrap();
        assert_eq!(order_event.user_id, "alice");
        assert_eq!(order_event.session_id, "sess-1");
    }

    #[test]
    fn retention_ring_is_bounded() {
        let logger = AuditLogger::new();
        for i in 0..(RETENTION_CAPACITY + 10) {
            logger.log_system_event(format!("event {i}"), true);
        }
        assert!(logger.events.lock().unwrap().len() <= RETENTION_CAPACITY);
    }
}
