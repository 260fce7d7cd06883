use std::io;
use std::net;
use std::num::ParseIntError;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("already closed")]
    ErrAlreadyClosed,
    #[error("host name must not be empty")]
    ErrHostnameEmpty,
    #[error("failed to parse address")]
    ErrAddressParseFailed,
    #[error("end port is less than the start")]
    ErrEndPortLessThanStart,
    #[error("port space exhausted")]
    ErrPortSpaceExhausted,

    //STUN errors
    #[error("attribute not found")]
    ErrAttributeNotFound,
    #[error("transaction not exists")]
    ErrTransactionNotExists,
    #[error("transaction exists with same id")]
    ErrTransactionExists,
    #[error("no default reason for ErrorCode")]
    ErrNoDefaultReason,
    #[error("unexpected EOF")]
    ErrUnexpectedEof,
    #[error("attribute size is invalid")]
    ErrAttributeSizeInvalid,
    #[error("attribute size overflow")]
    ErrAttributeSizeOverflow,
    #[error("unexpected EOF: not enough bytes to read header")]
    ErrUnexpectedHeaderEof,
    #[error("integrity check failed")]
    ErrIntegrityMismatch,
    #[error("fingerprint check failed")]
    ErrFingerprintMismatch,
    #[error("FINGERPRINT before MESSAGE-INTEGRITY attribute")]
    ErrFingerprintBeforeIntegrity,
    #[error("invalid magic cookie")]
    ErrInvalidMagicCookie,

    //ICE errors
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,
    #[error("port has been closed")]
    ErrPortClosed,
    #[error("no connection for the remote address")]
    ErrNoConnection,
    #[error("connection not found")]
    ErrConnectionNotFound,
    #[error("remote candidate is not compatible with the port")]
    ErrIncompatibleRemoteCandidate,
    #[error("remote credentials are not set")]
    ErrRemoteCredentialsNotSet,
    #[error("lookup is not pending")]
    ErrLookupNotPending,
    #[error("port has no local candidate yet")]
    ErrNoLocalCandidate,
    #[error("invalid STUN server address")]
    ErrInvalidStunServerAddress,
    #[error("no port bound to the local address")]
    ErrPortNotFound,
    #[error("no connection selected")]
    ErrNoSelectedConnection,
    #[error("socket option value out of range")]
    ErrInvalidSocketOptionValue,

    //Third Party Error
    #[error("parse ip: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("utf8: {0}")]
    Utf8(#[from] FromUtf8Error),

    //Other Errors
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
