//! Error codes raised by the fabric and session core.
//!
//! Every fallible function returns [anyhow::Result]. When a caller needs to
//! react to a specific failure (map it to a protocol status, decide whether a
//! retry makes sense) it can recover the [ErrorCode] with [code_of], which
//! also looks through any `.context(..)` added on the way up.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("no memory (table or cache is full)")]
    NoMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("incorrect state")]
    IncorrectState,
    #[error("malformed certificate")]
    InvalidCert,
    #[error("certificate not trusted")]
    CertNotTrusted,
    #[error("certificate key usage or purpose not allowed")]
    CertUsageNotAllowed,
    #[error("certificate expired or not yet valid")]
    CertExpired,
    #[error("fabric id mismatch")]
    FabricMismatch,
    #[error("fabric with same root and fabric id already present")]
    FabricConflict,
    #[error("fabric label already in use")]
    LabelConflict,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("key not found in storage")]
    KeyNotFound,
    #[error("storage i/o failure")]
    StorageIo,
    #[error("corrupt persisted record")]
    InvalidRecord,
    #[error("unsupported protocol parameters")]
    UnsupportedParameters,
    #[error("duplicate message counter")]
    DuplicateMessage,
    #[error("invalid protocol message")]
    InvalidMessage,
}

impl ErrorCode {
    /// Chain, signature and fabric binding failures. These must never be retried.
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidCert
                | ErrorCode::CertNotTrusted
                | ErrorCode::CertUsageNotAllowed
                | ErrorCode::CertExpired
                | ErrorCode::FabricMismatch
                | ErrorCode::InvalidSignature
        )
    }

    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            ErrorCode::KeyNotFound | ErrorCode::StorageIo | ErrorCode::InvalidRecord
        )
    }
}

/// Extract the [ErrorCode] carried by an error, if there is one.
pub fn code_of(err: &anyhow::Error) -> Option<ErrorCode> {
    err.downcast_ref::<ErrorCode>().copied()
}

/// Shorthand used by tests and callers: does `res` hold an error with `code`?
pub fn has_code<T>(res: &anyhow::Result<T>, code: ErrorCode) -> bool {
    match res {
        Ok(_) => false,
        Err(e) => code_of(e) == Some(code),
    }
}
