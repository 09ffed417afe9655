//! Error types for the flash image crate.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0

use std::{fmt, io, path::PathBuf};

/// Error definitions for flash image parsing, validation, extraction and assembly.
///
/// `Overlap` and `Invalid` are only ever produced by `validate` and are returned in a list. The remaining
/// variants abort the operation that raised them.
#[derive(Debug)]
pub enum FlashError {
    /// The raw bytes could not be decoded into the expected structure, or assembled bytes do not fit the
    /// layout they are placed into.
    Structural(String),
    /// Two placements share bytes.
    Overlap {
        /// Name of the earlier placement.
        first: String,
        /// Name of the later placement.
        second: String,
    },
    /// A node failed one of its consistency checks.
    Invalid {
        /// Name of the node that failed.
        node: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Reading or writing a payload failed.
    Io {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The manifest could not be encoded or decoded. A malformed GUID in the manifest lands here, with
    /// the GUID error text carried in the message.
    Manifest(serde_json::Error),
}

impl FlashError {
    pub(crate) fn invalid(node: impl Into<String>, reason: impl Into<String>) -> Self {
        FlashError::Invalid { node: node.into(), reason: reason.into() }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FlashError::Io { path: path.into(), source }
    }

    /// True for the kinds that `validate` reports.
    pub fn is_validation(&self) -> bool {
        matches!(self, FlashError::Overlap { .. } | FlashError::Invalid { .. })
    }
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::Structural(reason) => write!(f, "structural error: {reason}"),
            FlashError::Overlap { first, second } => write!(f, "{first} overlaps {second}"),
            FlashError::Invalid { node, reason } => write!(f, "{node} is not valid: {reason}"),
            FlashError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            FlashError::Manifest(err) => write!(f, "manifest error: {err}"),
        }
    }
}

impl std::error::Error for FlashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlashError::Io { source, .. } => Some(source),
            FlashError::Manifest(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for FlashError {
    fn from(value: serde_json::Error) -> Self {
        FlashError::Manifest(value)
    }
}
