//! Errors surfaced by the migration router.

use thiserror::Error;

use crate::store::StoreError;

/// Errors a caller of the migration router can observe.
///
/// Only primary-path failures ever reach this type. Secondary-store
/// failures and consistency mismatches are absorbed inside the router.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Neither the static configuration nor the override named a known phase.
    #[error("invalid migration phase '{value}' (expected one of: legacy, dual_write, dual_read, target)")]
    InvalidPhase { value: String },

    /// The primary store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MigrationError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_not_found())
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_duplicate_key())
    }
}
