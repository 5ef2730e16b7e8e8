// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! RPC status values carried by resolver results, pickers and call completions.

use faststr::FastStr;
use std::fmt;

/// Status codes, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// Not an error.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Deadline expired before operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// Some entity that we attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the specified operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request does not have valid authentication credentials.
    Unauthenticated = 16,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A status code paired with a detail message.
///
/// Statuses travel verbatim from where they are produced (a resolver, a transport, a picker)
/// to the caller, so callers can tell resolver failures from connection failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("status: {code}, detail: {message:?}")]
pub struct Status {
    code: Code,
    message: FastStr,
}

impl Status {
    /// Creates a status.
    pub fn new(code: Code, message: impl Into<FastStr>) -> Self {
        Self { code, message: message.into() }
    }
    /// The `Ok` status with an empty detail.
    pub fn ok() -> Self {
        Self::new(Code::Ok, FastStr::empty())
    }
    /// Shorthand for an [`Code::Unavailable`] status.
    pub fn unavailable(message: impl Into<FastStr>) -> Self {
        Self::new(Code::Unavailable, message)
    }
    /// Shorthand for an [`Code::Internal`] status.
    pub fn internal(message: impl Into<FastStr>) -> Self {
        Self::new(Code::Internal, message)
    }
    /// Shorthand for an [`Code::InvalidArgument`] status.
    pub fn invalid_argument(message: impl Into<FastStr>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }
    /// Shorthand for a [`Code::Cancelled`] status.
    pub fn cancelled(message: impl Into<FastStr>) -> Self {
        Self::new(Code::Cancelled, message)
    }
    /// Shorthand for a [`Code::DeadlineExceeded`] status.
    pub fn deadline_exceeded(message: impl Into<FastStr>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }
    /// Returns the status code.
    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }
    /// Returns the detail message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
    /// Whether the code is [`Code::Ok`].
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::TimedOut => Code::DeadlineExceeded,
            ErrorKind::PermissionDenied => Code::PermissionDenied,
            ErrorKind::InvalidInput => Code::InvalidArgument,
            _ => Code::Unavailable,
        };
        Status::new(code, err.to_string())
    }
}
