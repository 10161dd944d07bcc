//! Byte stores underneath the journal.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

use crate::error::StoreResult;

/// An append-only byte store holding the journal.
///
/// Backends do not interpret the bytes they hold; record framing and
/// checksums belong to the journal.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_all` returns every byte appended since the last `replace`
/// - after `sync` returns, appended data survives process termination
/// - `replace` is atomic: readers see either the old or the new contents
pub trait JournalBackend: Send + Sync {
    /// Reads the full contents.
    fn read_all(&self) -> StoreResult<Vec<u8>>;

    /// Appends data and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Makes all appended data durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> StoreResult<u64>;

    /// Drops everything after `new_size`.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` is larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StoreResult<()>;

    /// Atomically replaces the whole contents.
    fn replace(&mut self, data: &[u8]) -> StoreResult<()>;
}
