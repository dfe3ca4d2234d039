//! Error kinds shared by the inspector, patcher and trackers, plus the
//! process-wide last-error slot the C driver can query.

use std::sync::Mutex;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Target object is not currently loaded.
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Symbol is not present in the object's PLT.
    #[error("no such function: {0}")]
    FunctionNotFound(String),

    /// Protection lookup/change failed, or a dynamic tag is missing.
    #[error("internal error: {0}")]
    InternalError(String),

    /// Benign end-of-table condition of the PLT enumeration.
    #[error("end of enumeration")]
    EndOfEnumeration,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

lazy_static! {
    static ref LAST_ERROR: Mutex<String> = Mutex::new(String::new());
}

impl Error {
    /// Store this error's message as the process-wide last error and
    /// hand the error back. The slot is overwritten on every failure.
    pub(crate) fn record(self) -> Self {
        if let Ok(mut slot) = LAST_ERROR.lock() {
            *slot = self.to_string();
        }
        self
    }
}

/// Message of the most recent recorded error, empty if none occurred.
pub fn last_error() -> String {
    LAST_ERROR
        .lock()
        .map(|slot| slot.clone())
        .unwrap_or_default()
}

#[test]
fn last_error_is_overwritten() {
    // other tests may record concurrently; only assert what no
    // interleaving can restore
    let _ = Error::FunctionNotFound("err_alpha".into()).record();
    let _ = Error::FunctionNotFound("err_beta".into()).record();
    assert!(!last_error().contains("err_alpha"));
    assert!(!last_error().is_empty());
}
