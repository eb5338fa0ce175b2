use thiserror::Error;

/// Errors surfaced by [`super::DisasterRecovery`]'s filesystem operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to access path {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backup '{label}' not found")]
    BackupNotFound { label: String },

    #[error("journal integrity check failed: {reason}")]
    JournalIntegrity { reason: String },

    #[error("snapshot integrity check failed: {reason}")]
    SnapshotIntegrity { reason: String },
}
