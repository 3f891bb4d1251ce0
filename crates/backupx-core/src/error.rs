//! Error taxonomy shared by every backupx crate.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Key material is not an 88-character key+nonce composite.
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Ciphertext is malformed or was sealed under other key material.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    Security(String),

    /// The backup script could not be spawned or exited non-zero.
    #[error("Failed to execute backup shell: {0}")]
    ExecutionFailed(String),

    #[error("No output file containing {token}")]
    ArtifactNotFound { token: String },

    #[error("Backup file {file} is smaller than {min} bytes, current: {size} bytes")]
    ArtifactTooSmall { file: String, size: u64, min: u64 },

    #[error("Failed to read directory {}: {source}", path.display())]
    DirectoryReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Webhook error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
