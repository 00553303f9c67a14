//! Persisted serial counter.
//!
//! The file holds the last serial handed out, as decimal text. A new value
//! is written atomically before the caller signs anything with it, so a
//! crash can skip a serial but never reuse one.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::trust::store::write_atomic;
use crate::{Error, Result};

/// Monotonic serial allocator backed by a file
#[derive(Debug)]
pub struct SerialCounter {
    path: PathBuf,
    last: Mutex<u64>,
}

impl SerialCounter {
    /// Open the counter, creating it at 1 (the root's serial) if absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::CaInit` if the file exists but is not a number.
    pub fn open(path: &Path) -> Result<Self> {
        let last = match fs::read_to_string(path) {
            Ok(text) => text.trim().parse::<u64>().map_err(|e| {
                Error::CaInit(format!("corrupt serial file '{}': {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_atomic(path, b"1\n", Some(0o600))?;
                1
            }
            Err(e) => {
                return Err(Error::CaInit(format!(
                    "cannot read serial file '{}': {e}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            last: Mutex::new(last),
        })
    }

    /// Allocate and persist the next serial.
    ///
    /// The lock covers read, increment and persist only.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be persisted; the in-memory
    /// value is left unchanged in that case.
    pub fn next(&self) -> Result<u64> {
        let mut last = self.last.lock();
        let next = last
            .checked_add(1)
            .ok_or_else(|| Error::Issuance("serial space exhausted".into()))?;
        write_atomic(&self.path, format!("{next}\n").as_bytes(), Some(0o600))?;
        *last = next;
        debug!(serial = next, "Allocated serial");
        Ok(next)
    }

    /// Last serial handed out
    #[must_use]
    pub fn current(&self) -> u64 {
        *self.last.lock()
    }
}
