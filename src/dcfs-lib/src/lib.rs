mod events;
mod identity;
mod lock;
mod reference;

pub use events::*;
pub use identity::*;
pub use lock::*;
pub use reference::*;

use thiserror::Error;

#[macro_use]
extern crate log;

/// Caller-visible error kinds of the storage core. Wire marshalling is the
/// caller's job; every variant carries a human readable detail string.
#[derive(Error, Debug)]
pub enum DcfsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    // carries the id of the lock currently held on the node
    #[error("locked by {0}")]
    Locked(String),
    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("attribute not found: {0}")]
    AttrNotFound(String),
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DcfsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DcfsError::NotFound(_))
    }

    pub fn is_attr_not_found(&self) -> bool {
        matches!(self, DcfsError::AttrNotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, DcfsError::AlreadyExists(_))
    }
}

pub type DcfsResult<T> = std::result::Result<T, DcfsError>;

impl From<std::io::Error> for DcfsError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return DcfsError::NotFound(err.to_string());
        }
        DcfsError::IoError(err.to_string())
    }
}

pub const SPACE_TYPE_PERSONAL: &str = "personal";
pub const SPACE_TYPE_SHARE: &str = "share";
pub const SPACE_TYPE_PROJECT: &str = "project";
pub const SPACE_TYPE_VIRTUAL: &str = "virtual";

// space quota sentinels stored in the quota attribute
pub const QUOTA_UNLIMITED: &str = "0";
pub const QUOTA_UNCALCULATED: &str = "-1";
pub const QUOTA_UNKNOWN: &str = "-2";

/// Allocate a fresh v4 id. Space, node, blob, upload and recycle ids all use
/// the same format.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time as nanoseconds since the unix epoch. Timestamps are stored
/// as decimal nano strings so sub-second mutations stay distinguishable.
pub fn unix_nanos_now() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
