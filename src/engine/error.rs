use thiserror::Error;

use crate::source::LoadError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("materialization failed: {0}")]
    Store(#[from] StoreError),

    #[error("invalid scope: {0}")]
    InvalidScope(String),
}
