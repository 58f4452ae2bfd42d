//! Top-level error type of the discovery service.

use crate::{dispatcher::RequestError, enr_store::EnrStoreError, types::EnrError};
use spawned_concurrency::error::GenServerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Enr(#[from] EnrError),
    #[error(transparent)]
    Store(#[from] EnrStoreError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("internal error: {0}")]
    Internal(#[from] GenServerError),
}
