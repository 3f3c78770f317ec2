//! The errors

use crossbeam::channel::RecvError;
use derive_error as de;
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;
use std::time::SystemTimeError;

use crate::store::StoreError;

/// custom Result type for the bucket forklift
pub type MigResult<T> = Result<T, MigError>;

#[derive(Debug, de::Error)]
/// custom error types for the bucket forklift
pub enum MigError {
    #[error(msg_embedded, non_std, no_from)]
    CLIError(String),
    #[error(msg_embedded, non_std, no_from)]
    CrossbeamChannelError(String),
    #[error(msg_embedded, non_std, no_from)]
    InvalidConfigError(String),
    IoError(IoError),
    #[error(msg_embedded, non_std, no_from)]
    LockError(String),
    #[error(msg_embedded, non_std, no_from)]
    PlanError(String),
    RecvError(RecvError),
    SerdeJsonError(SerdeJsonError),
    StoreError(StoreError),
    SystemTimeError(SystemTimeError),
    #[error(msg_embedded, non_std, no_from)]
    TransferError(String),
}
