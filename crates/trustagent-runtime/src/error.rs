//! Error types for the session runtime.

use thiserror::Error;
use trustagent_core::BindError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The session could not bind; it must be rebuilt by the owner.
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("session worker has stopped")]
    Closed,
}
