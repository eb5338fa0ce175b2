pub mod disaster_recovery;
pub mod error;

pub use disaster_recovery::{BackupInfo, DisasterRecovery, ReconciliationResult};
pub use error::PersistenceError;
