// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Error kinds shared by the reader contract, the merge engine and the
//! admission semaphore.
//!
//! The four kinds below are the ones named by the design: [`Error::Timeout`]
//! and [`Error::QueueOverflow`] are expected, recoverable outcomes of normal
//! operation; [`Error::ProtocolMisuse`] means a caller violated a precondition
//! of the reader contract (a bug, not a runtime condition); [`Error::Source`]
//! wraps a failure propagated out of an underlying storage layer.

use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Deadline elapsed while waiting for {}.\nBacktrace:\n{}", what, backtrace))]
    Timeout { what: String, backtrace: Backtrace },

    #[snafu(display("Admission queue is full, max_queue:{}", max_queue))]
    QueueOverflow { max_queue: usize },

    #[snafu(display("Protocol misuse: {}.\nBacktrace:\n{}", detail, backtrace))]
    ProtocolMisuse { detail: String, backtrace: Backtrace },

    #[snafu(display("Underlying source failed, context:{}, err:{}", context, source))]
    Source {
        context: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True for errors callers may legitimately retry (as opposed to
    /// [`Error::ProtocolMisuse`], which indicates a bug at the call site).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::QueueOverflow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_misuse_is_not_retryable() {
        let err = ProtocolMisuseSnafu {
            detail: "fast_forward_to called without sm_forwarding",
        }
        .build();
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        let err = TimeoutSnafu { what: "wait_admission" }.build();
        assert!(err.is_retryable());
    }
}
