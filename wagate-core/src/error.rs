use thiserror::Error;

use crate::store::StoreError;

/// Failures while bringing the tenant store up at boot.
#[derive(Error, Debug)]
pub enum WagateError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
