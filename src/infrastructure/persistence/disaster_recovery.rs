//! Crash-durable persistence for risk and strategy state, plus labeled
//! backup/restore and journal/snapshot integrity checks.
//!
//! Writes to the primary state files go through a temp-file-then-rename
//! sequence so a crash mid-write never leaves a half-written file in place.
//! [`DisasterRecovery::emergency_save`] is the one deliberate exception:
//! it writes directly, trading that guarantee for lower latency when the
//! process is already failing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::infrastructure::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::infrastructure::persistence::error::PersistenceError;

const RISK_STATE_FILE: &str = "risk_state.json";
const STRATEGY_STATE_FILE: &str = "strategy_state.json";
const BACKUP_META_FILE: &str = "backup_meta.json";

#[derive(Debug, Clone)]
pub struct ReconciliationResult {
    pub symbol: String,
    pub local_position: f64,
    pub exchange_position: f64,
    pub discrepancy: f64,
    pub positions_match: bool,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub label: String,
    pub timestamp_ns: u64,
    pub iso_time: String,
    pub size_bytes: u64,
    pub valid: bool,
}

pub struct DisasterRecovery {
    base_dir: PathBuf,
    audit: Arc<AuditLogger>,
    write_lock: Mutex<()>,
}

impl DisasterRecovery {
    pub fn new(base_dir: impl Into<PathBuf>, audit: Arc<AuditLogger>) -> Self {
        DisasterRecovery { base_dir: base_dir.into(), audit, write_lock: Mutex::new(()) }
    }

    /// Creates the base directory if missing.
    pub fn initialize(&self) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.base_dir).map_err(|source| PersistenceError::Io { path: self.base_dir.display().to_string(), source })?;
        tracing::info!(base_dir = %self.base_dir.display(), "disaster recovery initialized");
        self.audit.log_event(AuditEvent::new(AuditEventType::SystemStart, "disaster recovery initialized", true));
        Ok(())
    }

    fn risk_state_path(&self) -> PathBuf {
        self.base_dir.join(RISK_STATE_FILE)
    }

    fn strategy_state_path(&self) -> PathBuf {
        self.base_dir.join(STRATEGY_STATE_FILE)
    }

    fn journals_dir(&self) -> PathBuf {
        self.base_dir.join("journals")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.base_dir.join("snapshots")
    }

    fn backups_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    /// Writes both state files via a tmp-write-then-rename sequence. Returns
    /// `false` (not an error) if either file could not be opened, matching
    /// the durability-vs-availability tradeoff of the original design: a
    /// save failure should not itself be treated as a fatal condition.
    pub fn save_risk_state(&self, risk_state: &Value, strategy_state: &Value) -> bool {
        let _guard = self.write_lock.lock().unwrap();

        let risk_ok = write_json_atomic(&self.risk_state_path(), risk_state).is_ok();
        let strategy_ok = write_json_atomic(&self.strategy_state_path(), strategy_state).is_ok();

        if !risk_ok || !strategy_ok {
            tracing::error!(risk_ok, strategy_ok, "failed to save risk/strategy state");
            return false;
        }
        tracing::debug!("risk and strategy state saved");
        true
    }

    /// Returns an empty object (never an error) if the file is missing or
    /// unparseable — a DR snapshot that can't be read is treated as "no
    /// prior state," not a fatal condition.
    pub fn load_risk_state(&self) -> Value {
        self.load_state_file(&self.risk_state_path())
    }

    pub fn load_strategy_state(&self) -> Value {
        self.load_state_file(&self.strategy_state_path())
    }

    fn load_state_file(&self, path: &Path) -> Value {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse state file, treating as empty");
                    json!({})
                }
            },
            Err(_) => json!({}),
        }
    }

    /// Writes both state files directly, without the tmp-file/rename
    /// indirection — used when the process is already in a failure state
    /// and minimizing latency matters more than crash-atomicity.
    pub fn emergency_save(&self, risk_state: &Value, strategy_state: &Value) -> bool {
        let _guard = self.write_lock.lock().unwrap();
        tracing::warn!("emergency save invoked");

        let risk_ok = fs::write(self.risk_state_path(), risk_state.to_string()).is_ok();
        let strategy_ok = fs::write(self.strategy_state_path(), strategy_state.to_string()).is_ok();
        let success = risk_ok && strategy_ok;

        self.audit.log_event(AuditEvent::new(AuditEventType::SystemStop, "emergency save completed", success));
        success
    }

    pub fn reconcile_position(&self, symbol: &str, local_position: f64, exchange_position: f64) -> ReconciliationResult {
        let discrepancy = local_position - exchange_position;
        let positions_match = discrepancy.abs() < 1e-8;
        let timestamp_ns = now_nanos();

        if positions_match {
            tracing::info!(symbol, local_position, exchange_position, "position reconciliation matched");
        } else {
            tracing::warn!(symbol, local_position, exchange_position, discrepancy, "position reconciliation mismatch");
            self.audit.log_event(AuditEvent::new(
                AuditEventType::DataAccess,
                format!("position mismatch: symbol={symbol} local={local_position} exchange={exchange_position} discrepancy={discrepancy}"),
                false,
            ));
        }

        ReconciliationResult {
            symbol: symbol.to_string(),
            local_position,
            exchange_position,
            discrepancy,
            positions_match,
            timestamp_ns,
        }
    }

    /// Overwrites any existing backup under the same label.
    pub fn create_backup(&self, label: &str) -> Result<(), PersistenceError> {
        let backup_dir = self.backups_dir().join(label);
        if backup_dir.exists() {
            tracing::warn!(label, "overwriting existing backup with same label");
            fs::remove_dir_all(&backup_dir).map_err(|source| PersistenceError::Io { path: backup_dir.display().to_string(), source })?;
        }
        fs::create_dir_all(&backup_dir).map_err(|source| PersistenceError::Io { path: backup_dir.display().to_string(), source })?;

        let result = self.copy_backup_contents(&backup_dir);
        match &result {
            Ok(()) => {
                self.audit.log_event(AuditEvent::new(AuditEventType::DataAccess, format!("backup '{label}' created"), true));
            }
            Err(e) => {
                self.audit.log_event(AuditEvent::new(AuditEventType::ErrorCondition, format!("backup '{label}' failed: {e}"), false));
            }
        }
        result?;

        let now_ns = now_nanos();
        let meta = json!({
            "label": label,
            "timestamp": now_ns,
            "iso_time": iso_time_from_nanos(now_ns),
        });
        write_json_atomic(&backup_dir.join(BACKUP_META_FILE), &meta)
            .map_err(|source| PersistenceError::Io { path: backup_dir.join(BACKUP_META_FILE).display().to_string(), source })?;

        Ok(())
    }

    fn copy_backup_contents(&self, backup_dir: &Path) -> Result<(), PersistenceError> {
        for path in [self.risk_state_path(), self.strategy_state_path()] {
            if path.exists() {
                let dest = backup_dir.join(path.file_name().unwrap());
                fs::copy(&path, &dest).map_err(|source| PersistenceError::Io { path: dest.display().to_string(), source })?;
            }
        }

        let journals_src = self.journals_dir();
        if journals_src.exists() {
            let journals_dest = backup_dir.join("journals");
            fs::create_dir_all(&journals_dest).map_err(|source| PersistenceError::Io { path: journals_dest.display().to_string(), source })?;
            for entry in fs::read_dir(&journals_src).map_err(|source| PersistenceError::Io { path: journals_src.display().to_string(), source })? {
                let entry = entry.map_err(|source| PersistenceError::Io { path: journals_src.display().to_string(), source })?;
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "journal") {
                    let dest = journals_dest.join(path.file_name().unwrap());
                    fs::copy(&path, &dest).map_err(|source| PersistenceError::Io { path: dest.display().to_string(), source })?;
                }
            }
        }

        Ok(())
    }

    pub fn restore_backup(&self, label: &str) -> Result<(), PersistenceError> {
        let backup_dir = self.backups_dir().join(label);
        if !backup_dir.exists() {
            return Err(PersistenceError::BackupNotFound { label: label.to_string() });
        }

        for file_name in [RISK_STATE_FILE, STRATEGY_STATE_FILE] {
            let src = backup_dir.join(file_name);
            if src.exists() {
                let dest = self.base_dir.join(file_name);
                fs::copy(&src, &dest).map_err(|source| PersistenceError::Io { path: dest.display().to_string(), source })?;
            }
        }

        let journals_src = backup_dir.join("journals");
        if journals_src.exists() {
            let journals_dest = self.journals_dir();
            fs::create_dir_all(&journals_dest).map_err(|source| PersistenceError::Io { path: journals_dest.display().to_string(), source })?;
            for entry in fs::read_dir(&journals_src).map_err(|source| PersistenceError::Io { path: journals_src.display().to_string(), source })? {
                let entry = entry.map_err(|source| PersistenceError::Io { path: journals_src.display().to_string(), source })?;
                let path = entry.path();
                let dest = journals_dest.join(path.file_name().unwrap());
                fs::copy(&path, &dest).map_err(|source| PersistenceError::Io { path: dest.display().to_string(), source })?;
            }
        }

        self.audit.log_event(AuditEvent::new(AuditEventType::DataAccess, format!("backup '{label}' restored"), true));
        Ok(())
    }

    pub fn list_backups(&self) -> Vec<BackupInfo> {
        let backups_dir = self.backups_dir();
        let Ok(entries) = fs::read_dir(&backups_dir) else {
            return Vec::new();
        };

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let label = path.file_name().unwrap().to_string_lossy().into_owned();
            let meta_path = path.join(BACKUP_META_FILE);
            let (timestamp_ns, iso_time, valid) = match fs::read_to_string(&meta_path).ok().and_then(|s| serde_json::from_str::<Value>(&s).ok()) {
                Some(meta) => {
                    let ts = meta.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
                    let iso = meta.get("iso_time").and_then(Value::as_str).unwrap_or("").to_string();
                    (ts, iso, true)
                }
                None => (0, String::new(), false),
            };
            backups.push(BackupInfo { label, timestamp_ns, iso_time, size_bytes: dir_size(&path), valid });
        }
        backups
    }

    pub fn delete_backup(&self, label: &str) -> Result<(), PersistenceError> {
        let backup_dir = self.backups_dir().join(label);
        if !backup_dir.exists() {
            return Err(PersistenceError::BackupNotFound { label: label.to_string() });
        }
        fs::remove_dir_all(&backup_dir).map_err(|source| PersistenceError::Io { path: backup_dir.display().to_string(), source })?;
        self.audit.log_event(AuditEvent::new(AuditEventType::DataAccess, format!("backup '{label}' deleted"), true));
        Ok(())
    }

    /// Fails if the journals directory has no `*.journal` files, or any of
    /// them is empty.
    pub fn validate_journal_integrity(&self) -> Result<(), PersistenceError> {
        let journals_dir = self.journals_dir();
        let entries = fs::read_dir(&journals_dir)
            .map_err(|source| PersistenceError::Io { path: journals_dir.display().to_string(), source })?;

        let mut found = false;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "journal") {
                found = true;
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                if size == 0 {
                    return Err(PersistenceError::JournalIntegrity { reason: format!("journal file {} is empty", path.display()) });
                }
            }
        }

        if !found {
            return Err(PersistenceError::JournalIntegrity { reason: "no journal files found".to_string() });
        }
        Ok(())
    }

    /// Fails if the snapshots directory has no subdirectories, or any
    /// subdirectory lacks a regular file.
    pub fn validate_snapshot_integrity(&self) -> Result<(), PersistenceError> {
        let snapshots_dir = self.snapshots_dir();
        let entries = fs::read_dir(&snapshots_dir)
            .map_err(|source| PersistenceError::Io { path: snapshots_dir.display().to_string(), source })?;

        let mut found = false;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            found = true;
            let has_file = fs::read_dir(&path)
                .map(|inner| inner.flatten().any(|e| e.path().is_file()))
                .unwrap_or(false);
            if !has_file {
                return Err(PersistenceError::SnapshotIntegrity { reason: format!("snapshot {} has no regular files", path.display()) });
            }
        }

        if !found {
            return Err(PersistenceError::SnapshotIntegrity { reason: "no snapshot directories found".to_string() });
        }
        Ok(())
    }
}

fn write_json_atomic(path: &Path, value: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, value.to_string())?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0u64;
    for entry in entries.flatten() {
        let p = entry.path();
        if p.is_dir() {
            total += dir_size(&p);
        } else if let Ok(meta) = fs::metadata(&p) {
            total += meta.len();
        }
    }
    total
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

fn iso_time_from_nanos(ns: u64) -> String {
    let secs = ns / 1_000_000_000;
    let millis = (ns / 1_000_000) % 1000;
    let days = secs / 86_400;
    let time_of_day = secs % 86_400;
    let (y, m, d) = civil_from_days(days as i64);
    format!(
        "{y:04}-{m:02}-{d:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        time_of_day / 3600,
        (time_of_day % 3600) / 60,
        time_of_day % 60
    )
}

/// Howard Hinnant's days-from-civil algorithm, inverted. No calendar crate
/// is pulled in for a single timestamp-formatting call.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn recovery(dir: &Path) -> DisasterRecovery {
        let audit = Arc::new(AuditLogger::new());
        DisasterRecovery::new(dir.to_path_buf(), audit)
    }

    #[test]
    fn save_then_load_round_trips_state() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        dr.initialize().unwrap();

        let risk = json!({ "position": 5.0 });
        let strategy = json!({ "mode": "market_making" });
        assert!(dr.save_risk_state(&risk, &strategy));

        assert_eq!(dr.load_risk_state(), risk);
        assert_eq!(dr.load_strategy_state(), strategy);
    }

    #[test]
    fn load_missing_state_returns_empty_object() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        assert_eq!(dr.load_risk_state(), json!({}));
    }

    #[test]
    fn reconcile_position_detects_mismatch() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        let matched = dr.reconcile_position("BTC-USD", 10.0, 10.0);
        assert!(matched.positions_match);
        assert_eq!(matched.symbol, "BTC-USD");

        let mismatched = dr.reconcile_position("BTC-USD", 10.0, 9.5);
        assert!(!mismatched.positions_match);
        assert!((mismatched.discrepancy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn backup_then_restore_recovers_state() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        dr.initialize().unwrap();
        dr.save_risk_state(&json!({ "position": 1.0 }), &json!({})).then_some(()).unwrap();

        dr.create_backup("pre-upgrade").unwrap();
        dr.save_risk_state(&json!({ "position": 99.0 }), &json!({})).then_some(()).unwrap();

        dr.restore_backup("pre-upgrade").unwrap();
        assert_eq!(dr.load_risk_state(), json!({ "position": 1.0 }));
    }

    #[test]
    fn creating_backup_twice_overwrites_the_first() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        dr.initialize().unwrap();
        dr.save_risk_state(&json!({ "v": 1 }), &json!({})).then_some(()).unwrap();
        dr.create_backup("snap").unwrap();
        dr.save_risk_state(&json!({ "v": 2 }), &json!({})).then_some(()).unwrap();
        dr.create_backup("snap").unwrap();

        let backups = dr.list_backups();
        assert_eq!(backups.iter().filter(|b| b.label == "snap").count(), 1);
    }

    #[test]
    fn list_backups_reports_invalid_when_meta_missing() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        fs::create_dir_all(dir.path().join("backups").join("corrupt")).unwrap();

        let backups = dr.list_backups();
        let corrupt = backups.iter().find(|b| b.label == "corrupt").unwrap();
        assert!(!corrupt.valid);
    }

    #[test]
    fn delete_backup_removes_directory() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        dr.initialize().unwrap();
        dr.create_backup("temp").unwrap();
        assert!(dr.delete_backup("temp").is_ok());
        assert!(dr.list_backups().is_empty());
    }

    #[test]
    fn delete_missing_backup_errors() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        assert!(dr.delete_backup("nope").is_err());
    }

    #[test]
    fn journal_integrity_requires_nonempty_journal_files() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        assert!(dr.validate_journal_integrity().is_err());

        let journals = dir.path().join("journals");
        fs::create_dir_all(&journals).unwrap();
        fs::write(journals.join("001.journal"), b"").unwrap();
        assert!(dr.validate_journal_integrity().is_err());

        fs::write(journals.join("001.journal"), b"entry").unwrap();
        assert!(dr.validate_journal_integrity().is_ok());
    }

    #[test]
    fn snapshot_integrity_requires_file_in_each_subdirectory() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        assert!(dr.validate_snapshot_integrity().is_err());

        let snapshots = dir.path().join("snapshots").join("2026-07-27");
        fs::create_dir_all(&snapshots).unwrap();
        assert!(dr.validate_snapshot_integrity().is_err());

        fs::write(snapshots.join("state.bin"), b"data").unwrap();
        assert!(dr.validate_snapshot_integrity().is_ok());
    }

    #[test]
    fn emergency_save_writes_directly() {
        let dir = tempdir().unwrap();
        let dr = recovery(dir.path());
        dr.initialize().unwrap();
        assert!(dr.emergency_save(&json!({ "fast": true }), &json!({})));
        assert_eq!(dr.load_risk_state(), json!({ "fast": true }));
    }
}
