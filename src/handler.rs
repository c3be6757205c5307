//! Storage handler contract.

use crate::error::{Result, StorageError};

/// Loads a persisted value of type `T`.
///
/// Handlers perform exactly one read per call and never retry. `Ok(None)` and
/// [`StorageError::NotFound`] both mean "nothing persisted yet".
pub trait StorageHandler<T>: Send + Sync {
    /// Load the persisted value, if any.
    fn load(&self) -> Result<Option<T>>;

    /// Load the persisted value or produce a default.
    ///
    /// The default is not written back. Decode and connectivity failures
    /// propagate instead of being defaulted.
    fn load_or_else<F>(&self, default: F) -> Result<T>
    where
        F: FnOnce() -> T,
        Self: Sized,
    {
        match self.load() {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Ok(default()),
            Err(StorageError::NotFound(what)) => {
                tracing::debug!(what = %what, "nothing persisted, using default");
                Ok(default())
            }
            Err(e) => Err(e),
        }
    }
}
