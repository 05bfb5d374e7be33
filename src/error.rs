/*
 * resman - Game resource update and sync engine.
 * Copyright (C) 2025  resman contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Error kinds exposed to the embedding application.
//!
//! Two layers exist. [`TreeError`] is returned synchronously when a command is
//! rejected (the tree is busy, nothing to download, ...). [`WorkerError`] is the
//! terminal failure of a background operation; only the first one raised during
//! an operation is stored on the root tree.

use crate::codec::CodecError;
use crate::manifest::ManifestError;
use crate::transfer::TransferError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Closed set of error kinds, independent of the concrete error type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AlreadyWorking,
    AlreadyStarted,
    NothingToDownload,
    NotWorking,
    ForceStopped,
    MirrorResolutionFailure,
    MirrorConnectFailure,
    UnexpectedProtocolStatus,
    TransportFailure,
    /// Operating-system level failure carrying an OS error code
    Io,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AlreadyWorking => "already working",
            ErrorKind::AlreadyStarted => "already started",
            ErrorKind::NothingToDownload => "nothing to download",
            ErrorKind::NotWorking => "not working",
            ErrorKind::ForceStopped => "force stopped",
            ErrorKind::MirrorResolutionFailure => "mirror resolution failure",
            ErrorKind::MirrorConnectFailure => "mirror connect failure",
            ErrorKind::UnexpectedProtocolStatus => "unexpected protocol status",
            ErrorKind::TransportFailure => "transport failure",
            ErrorKind::Io => "I/O error",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Rejection of a command issued to a resource tree
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("cannot do this while a worker is active")]
    AlreadyWorking,

    #[error("cannot do this after an operation has run on the tree")]
    AlreadyStarted,

    #[error("there is nothing to download")]
    NothingToDownload,

    #[error("the requested operation is not running")]
    NotWorking,

    #[error("could not spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TreeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TreeError::AlreadyWorking => ErrorKind::AlreadyWorking,
            TreeError::AlreadyStarted => ErrorKind::AlreadyStarted,
            TreeError::NothingToDownload => ErrorKind::NothingToDownload,
            TreeError::NotWorking => ErrorKind::NotWorking,
            TreeError::Spawn(_) => ErrorKind::Io,
            TreeError::InvalidConfig(_) => ErrorKind::Internal,
        }
    }
}

/// Terminal failure of a background operation
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("operation was force stopped")]
    ForceStopped,

    #[error("couldn't resolve host for {url}: {message}")]
    MirrorResolution { url: String, message: String },

    #[error("couldn't connect to host for {url}: {message}")]
    MirrorConnect { url: String, message: String },

    #[error("request to {url} succeeded, but host returned unexpected status {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("transfer of {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("giving up on '{target}' after {attempts} failed attempts: {last}")]
    RetriesExhausted {
        target: String,
        attempts: usize,
        #[source]
        last: Box<WorkerError>,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("no mirrors configured")]
    NoMirrors,

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("could not start async runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("worker panicked")]
    Panicked,
}

impl WorkerError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        WorkerError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::ForceStopped => ErrorKind::ForceStopped,
            WorkerError::MirrorResolution { .. } => ErrorKind::MirrorResolutionFailure,
            WorkerError::MirrorConnect { .. } => ErrorKind::MirrorConnectFailure,
            WorkerError::UnexpectedStatus { .. } => ErrorKind::UnexpectedProtocolStatus,
            WorkerError::Transport { .. } => ErrorKind::TransportFailure,
            WorkerError::RetriesExhausted { last, .. } => last.kind(),
            WorkerError::Io { .. } | WorkerError::Runtime(_) => ErrorKind::Io,
            WorkerError::Codec(e) if e.raw_os_error().is_some() => ErrorKind::Io,
            WorkerError::Codec(_)
            | WorkerError::Manifest(_)
            | WorkerError::NoMirrors
            | WorkerError::NotImplemented(_)
            | WorkerError::Panicked => ErrorKind::Internal,
        }
    }

    /// OS error code behind this failure, if it came from the operating system
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            WorkerError::Io { source, .. } | WorkerError::Runtime(source) => source.raw_os_error(),
            WorkerError::Codec(e) => e.raw_os_error(),
            WorkerError::RetriesExhausted { last, .. } => last.os_error_code(),
            _ => None,
        }
    }

    /// Snapshot suitable for handing across the embedding boundary
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            os_code: self.os_error_code(),
        }
    }
}

impl From<TransferError> for WorkerError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Aborted => WorkerError::ForceStopped,
            TransferError::Resolve { url, message } => WorkerError::MirrorResolution { url, message },
            TransferError::Connect { url, message } => WorkerError::MirrorConnect { url, message },
            TransferError::Other { url, message } => WorkerError::Transport { url, message },
            TransferError::Io { url, source } => {
                WorkerError::io(format!("writing data received from {url}"), source)
            }
        }
    }
}

/// Structured terminal error: kind, human-readable text and optional OS code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub os_code: Option<i32>,
}
