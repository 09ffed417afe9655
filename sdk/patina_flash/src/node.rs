//! The contract shared by every structural element of a flash image.
//!
//! A flash image, its descriptor, its regions, the firmware volumes inside the BIOS region, and the padding
//! between all of them are nodes. Each node can:
//! - `validate` itself, reporting every defect it finds instead of stopping at the first one;
//! - `extract` its payload into a directory tree and remember where it went;
//! - `assemble` its bytes back from that tree.
//!
//! Extraction degrades a node into files plus manifest entries; assembly rebuilds the node from only that
//! degraded form. Composite nodes recurse into their children for all three operations.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::FlashError;

/// Validate / Extract / Assemble protocol implemented by every node.
pub trait FirmwareNode {
    /// State owned elsewhere that the node consults during validation, e.g. the region directory for a
    /// region. Use `()` when the node is self-contained.
    type Context: ?Sized;

    /// Check this node and its children.
    ///
    /// Returns every defect found, children's defects appended in traversal order. An empty list means the
    /// node is consistent.
    fn validate(&self, context: &Self::Context) -> Vec<FlashError>;

    /// Write this node's payload below `parent_dir` and record the resulting path.
    ///
    /// Composite nodes create their directory first, then extract each child, stopping at the first failure.
    /// Files already written are left in place.
    fn extract(&mut self, parent_dir: &Path) -> Result<(), FlashError>;

    /// Rebuild this node's bytes from the recorded extraction path(s), store them, and return them.
    fn assemble(&mut self) -> Result<Vec<u8>, FlashError>;
}

/// Write `buf` to `dir/name`, creating `dir` as needed, and return the written path.
pub fn extract_binary(buf: &[u8], dir: &Path, name: &str) -> Result<PathBuf, FlashError> {
    fs::create_dir_all(dir).map_err(|err| FlashError::io(dir, err))?;
    let path = dir.join(name);
    fs::write(&path, buf).map_err(|err| FlashError::io(&path, err))?;
    log::debug!("wrote {:#x} bytes to {}", buf.len(), path.display());
    Ok(path)
}

/// Read back a payload written by [`extract_binary`].
///
/// A node that was never extracted has no path and fails with an I/O `NotFound` error.
pub fn read_binary(path: Option<&Path>) -> Result<Vec<u8>, FlashError> {
    let Some(path) = path else {
        return Err(FlashError::io(
            PathBuf::new(),
            std::io::Error::new(std::io::ErrorKind::NotFound, "node has no extraction path"),
        ));
    };
    fs::read(path).map_err(|err| FlashError::io(path, err))
}
