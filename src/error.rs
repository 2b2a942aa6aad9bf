//! Errors surfaced by command handlers, and how the consumer treats them.

use thiserror::Error;

use crate::instance::ControllerError;
use crate::mq::MqError;
use crate::runtime::RuntimeError;
use crate::store::StoreError;
use crate::wg::{AllocError, TunnelError};

#[derive(Debug, Error)]
pub enum Error {
    /// The message can never be processed; retrying is pointless.
    #[error("poison message: {0}")]
    Poison(String),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Broker(#[from] MqError),
}

impl Error {
    /// Only malformed input is terminal.  Pool exhaustion and every
    /// external failure go through the retry queue; an exhausted address
    /// pool may drain once other users are killed.
    pub fn is_poison(&self) -> bool {
        matches!(self, Error::Poison(_))
    }

    pub fn is_pool_exhausted(&self) -> bool {
        matches!(
            self,
            Error::Alloc(AllocError::Exhausted(_))
                | Error::Controller(ControllerError::Alloc(AllocError::Exhausted(_)))
        )
    }
}
