use thiserror::Error;

use crate::cache::CacheError;
use crate::cache::StorageError;
use crate::client::TransportError;

/// Top-level error for fallible surfaces of the crate.
///
/// Event bus operations and [`RpcClient::call`](crate::client::RpcClient::call)
/// never produce one of these; both settle every outcome internally.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config(message.into())
    }
}
