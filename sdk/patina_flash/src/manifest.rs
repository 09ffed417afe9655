//! The extraction manifest (`summary.json`).
//!
//! The manifest is the JSON form of a [`FlashImage`]: every node's metadata and extraction path, without
//! payload bytes. It is written by [`FirmwareNode::extract`](crate::FirmwareNode::extract) and is all that
//! assembly needs besides the payload files it points at.
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

use serde::Serialize;

use crate::{FlashError, FlashImage};

/// Manifest file name inside an extraction directory.
pub const SUMMARY_FILE: &str = "summary.json";

const INDENT: &[u8] = b"    ";

/// Encode `image` as pretty-printed JSON.
pub fn to_json(image: &FlashImage) -> Result<String, FlashError> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(INDENT);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    image.serialize(&mut serializer)?;
    String::from_utf8(out).map_err(|err| FlashError::Structural(format!("manifest is not UTF-8: {err}")))
}

/// Decode a manifest. GUID errors keep their message as the prefix of the returned error.
pub fn from_json(json: &str) -> Result<FlashImage, FlashError> {
    Ok(serde_json::from_str(json)?)
}

/// Write the manifest for `image` into `dir`.
pub fn write(image: &FlashImage, dir: &Path) -> Result<PathBuf, FlashError> {
    let path = dir.join(SUMMARY_FILE);
    fs::write(&path, to_json(image)?).map_err(|err| FlashError::io(&path, err))?;
    log::debug!("wrote manifest {}", path.display());
    Ok(path)
}

/// Read the manifest from `dir`.
pub fn read(dir: &Path) -> Result<FlashImage, FlashError> {
    let path = dir.join(SUMMARY_FILE);
    let json = fs::read_to_string(&path).map_err(|err| FlashError::io(&path, err))?;
    from_json(&json)
}
