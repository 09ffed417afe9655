//! Bytes not claimed by any other node.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    node::{self, FirmwareNode},
    FlashError,
};

/// A run of unclaimed bytes, kept verbatim so that assembly reproduces the original image.
///
/// `offset` is relative to the enclosing node: the flash image for gaps between regions, the BIOS region for
/// gaps between firmware volumes.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Padding {
    offset: u64,
    length: u64,
    #[serde(skip)]
    buf: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extract_path: Option<PathBuf>,
}

impl Padding {
    pub fn new(offset: u64, buf: Vec<u8>) -> Self {
        Self { offset, length: buf.len() as u64, buf, extract_path: None }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn extract_path(&self) -> Option<&Path> {
        self.extract_path.as_deref()
    }
}

impl fmt::Debug for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Padding({:#x}..{:#x}, {:?})", self.offset, self.end(), self.extract_path)
    }
}

impl FirmwareNode for Padding {
    type Context = ();

    fn validate(&self, _: &()) -> Vec<FlashError> {
        if !self.buf.is_empty() && self.buf.len() as u64 != self.length {
            return vec![FlashError::invalid(
                format!("padding at {:#x}", self.offset),
                format!("holds {:#x} bytes, expected {:#x}", self.buf.len(), self.length),
            )];
        }
        Vec::new()
    }

    fn extract(&mut self, parent_dir: &Path) -> Result<(), FlashError> {
        let file_name = format!("padding_{:08x}.bin", self.offset);
        self.extract_path = Some(node::extract_binary(&self.buf, &parent_dir.join("padding"), &file_name)?);
        Ok(())
    }

    fn assemble(&mut self) -> Result<Vec<u8>, FlashError> {
        self.buf = node::read_binary(self.extract_path.as_deref())?;
        Ok(self.buf.clone())
    }
}
