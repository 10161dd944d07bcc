//! CLI command implementations.
//!
//! Read-only commands never take the store's directory lock: they load a
//! copy of the journal into memory and replay it there, so they can run
//! next to a live client.

pub mod compact;
pub mod crud;
pub mod dump_oplog;
pub mod inspect;
pub mod verify;

use bucketsync_store::{InMemoryBackend, LocalStore, StoreConfig, StoreError};
use clap::ValueEnum;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the journal inside a store directory.
pub const JOURNAL_FILE: &str = "journal.bsj";

/// Output format of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No journal in the given directory.
    #[error("no bucketsync store found at {0}")]
    NotFound(PathBuf),

    /// The store rejected the operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Reading the journal failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Output could not be encoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// An in-memory replica of a store directory.
pub struct Replica {
    /// The replayed store.
    pub store: LocalStore,
    /// Size of the journal file in bytes.
    pub journal_size: u64,
}

impl Replica {
    /// Loads the journal under `path` and replays it in memory.
    pub fn load(path: &Path) -> CliResult<Self> {
        let journal = path.join(JOURNAL_FILE);
        if !journal.is_file() {
            return Err(CliError::NotFound(path.to_path_buf()));
        }
        let bytes = fs::read(&journal)?;
        let journal_size = bytes.len() as u64;
        tracing::debug!(path = %journal.display(), journal_size, "journal loaded");

        let store = LocalStore::with_backend(
            Box::new(InMemoryBackend::with_data(bytes)),
            StoreConfig::default(),
        )?;
        Ok(Self {
            store,
            journal_size,
        })
    }
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(format_size(12), "12 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn missing_store_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = Replica::load(dir.path()).err().unwrap();
        assert!(matches!(err, CliError::NotFound(_)));
    }
}
