// Copyright 2015-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error types for the crate

#![deny(missing_docs)]

use std::{fmt, io};

use enum_as_inner::EnumAsInner;
use thiserror::Error;

use crate::proto::{
    op::ResponseCode,
    rr::{Name, RecordType},
    ProtoError,
};

/// The error kind for errors that get returned in the crate
#[derive(Debug, EnumAsInner, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An error with an arbitrary message, referenced as &'static str
    #[error("{0}")]
    Message(&'static str),

    /// An error with an arbitrary message, stored as String
    #[error("{0}")]
    Msg(String),

    /// A per-resolution ceiling was hit: queries, time, depth, or sub-lookups
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(&'static str),

    /// The delegation walk came back to a (name, ns-set, type) it already tried
    #[error("delegation loop resolving {0}")]
    Loop(Name),

    /// A CNAME chain ran past the configured maximum length
    #[error("too many indirections following CNAMEs for {0}")]
    TooManyCnames(Name),

    /// Resolution cannot continue and must report SERVFAIL right away
    #[error("immediate servfail: {reason}")]
    ImmediateServFail {
        /// Tells the operator what went wrong
        reason: String,
    },

    /// A filter policy short-circuited the resolution
    #[error("policy hit")]
    PolicyHit,

    /// The answer does not fit and the client must retry over TCP
    #[error("answer too large, send truncated")]
    SendTruncatedAnswer,

    /// The upstream server did not answer in time
    #[error("request timed out")]
    Timeout,

    /// An upstream rcode that ends the resolution
    #[error("upstream returned {0}")]
    DomainError(ResponseCode),

    /// The query type is an internal marker and cannot be resolved
    #[error("refusing to resolve unsupported qtype {0}")]
    UnsupportedQtype(RecordType),

    /// An error got returned from IO
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error got returned by the hickory-proto crate
    #[error("proto error: {0}")]
    Proto(#[from] ProtoError),
}

/// Buckets used when accounting failures of background tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskFailureKind {
    /// Anything that maps onto a plain runtime error
    Generic,
    /// Domain-logic failures: loops, overlong CNAME chains, terminal rcodes
    DomainError,
    /// Failures the resolver reports as SERVFAIL
    ServFail,
    /// A filter policy fired
    PolicyHit,
    /// Nothing else matched
    Unknown,
}

/// The error type for errors that get returned in the crate
#[derive(Error, Clone, Debug)]
#[non_exhaustive]
pub struct Error {
    /// Kind of error that occurred
    pub kind: Box<ErrorKind>,
}

impl Error {
    /// Get the kind of the error
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns true if the upstream told us the domain does not exist
    pub fn is_nx_domain(&self) -> bool {
        matches!(*self.kind, ErrorKind::DomainError(ResponseCode::NXDomain))
    }

    /// Returns true if the request timed out
    pub fn is_timeout(&self) -> bool {
        matches!(*self.kind, ErrorKind::Timeout)
    }

    /// Returns true for errors that must unwind the whole resolution rather
    /// than be absorbed as a retry against another candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::ResourceLimit(_)
                | ErrorKind::ImmediateServFail { .. }
                | ErrorKind::PolicyHit
                | ErrorKind::SendTruncatedAnswer
        )
    }

    /// The accounting bucket a background task failure falls into.
    pub fn task_failure_kind(&self) -> TaskFailureKind {
        match &*self.kind {
            ErrorKind::DomainError(_) | ErrorKind::Loop(_) | ErrorKind::TooManyCnames(_) => {
                TaskFailureKind::DomainError
            }
            ErrorKind::ImmediateServFail { .. }
            | ErrorKind::ResourceLimit(_)
            | ErrorKind::Timeout => TaskFailureKind::ServFail,
            ErrorKind::PolicyHit => TaskFailureKind::PolicyHit,
            ErrorKind::Message(_)
            | ErrorKind::Msg(_)
            | ErrorKind::Io(_)
            | ErrorKind::Proto(_)
            | ErrorKind::UnsupportedQtype(_) => TaskFailureKind::Generic,
            _ => TaskFailureKind::Unknown,
        }
    }

    /// Check a recursion depth against its ceiling.
    pub(crate) fn recursion_exceeded(limit: u32, depth: u32, name: &Name) -> Result<(), Self> {
        if depth <= limit {
            return Ok(());
        }
        tracing::warn!("recursion depth exceeded for {name}");
        Err(ErrorKind::ResourceLimit("max recursion depth").into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(error: E) -> Self {
        Self {
            kind: Box::new(error.into()),
        }
    }
}

impl From<&'static str> for Error {
    fn from(msg: &'static str) -> Self {
        ErrorKind::Message(msg).into()
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        ErrorKind::Msg(msg).into()
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e.kind() {
            ErrorKind::Timeout => Self::new(io::ErrorKind::TimedOut, e),
            _ => Self::other(e),
        }
    }
}

impl From<Error> for String {
    fn from(e: Error) -> Self {
        e.to_string()
    }
}

impl Clone for ErrorKind {
    fn clone(&self) -> Self {
        use self::ErrorKind::*;
        match self {
            Message(msg) => Message(msg),
            Msg(msg) => Msg(msg.clone()),
            ResourceLimit(what) => ResourceLimit(what),
            Loop(name) => Loop(name.clone()),
            TooManyCnames(name) => TooManyCnames(name.clone()),
            ImmediateServFail { reason } => ImmediateServFail {
                reason: reason.clone(),
            },
            PolicyHit => PolicyHit,
            SendTruncatedAnswer => SendTruncatedAnswer,
            Timeout => Timeout,
            DomainError(rcode) => DomainError(*rcode),
            UnsupportedQtype(qtype) => UnsupportedQtype(*qtype),
            Io(io) => Io(std::io::Error::from(io.kind())),
            Proto(proto) => Proto(proto.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failure_buckets() {
        let loop_err: Error = ErrorKind::Loop(Name::root()).into();
        assert_eq!(loop_err.task_failure_kind(), TaskFailureKind::DomainError);

        let limit: Error = ErrorKind::ResourceLimit("max outgoing queries").into();
        assert_eq!(limit.task_failure_kind(), TaskFailureKind::ServFail);

        let policy: Error = ErrorKind::PolicyHit.into();
        assert_eq!(policy.task_failure_kind(), TaskFailureKind::PolicyHit);

        let generic: Error = "boom".into();
        assert_eq!(generic.task_failure_kind(), TaskFailureKind::Generic);
    }

    #[test]
    fn fatal_errors_unwind() {
        let limit: Error = ErrorKind::ResourceLimit("max total time").into();
        assert!(limit.is_fatal());

        let timeout: Error = ErrorKind::Timeout.into();
        assert!(!timeout.is_fatal());
    }
}
