//! Firmware volumes found inside the BIOS region.
//!
//! A firmware volume starts with an `EFI_FIRMWARE_VOLUME_HEADER`, identified by the `_FVH` signature at
//! offset 0x28, followed by a block map terminated by a zero entry and an optional extended header. The
//! volume body is kept opaque: volumes are located, checked and extracted as a whole.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::{fmt, mem::size_of};
use std::path::{Path, PathBuf};

use patina_guid::Guid;
use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;
use zerocopy_derive::*;

use crate::{
    node::{self, FirmwareNode},
    FlashError,
};

/// `_FVH`, read as a little-endian u32.
pub const FV_SIGNATURE: u32 = u32::from_le_bytes(*b"_FVH");

/// Lowest header revision accepted (`EFI_FVH_REVISION`).
pub const FVH_REVISION: u8 = 2;

/// EFI_FIRMWARE_FILE_SYSTEM2_GUID
pub const FIRMWARE_FILE_SYSTEM2_GUID: Guid =
    Guid::from_fields(0x8c8ce578, 0x8a3d, 0x4f1c, 0x99, 0x35, &[0x89, 0x61, 0x85, 0xc3, 0x2d, 0xd3]);

/// EFI_FIRMWARE_FILE_SYSTEM3_GUID
pub const FIRMWARE_FILE_SYSTEM3_GUID: Guid =
    Guid::from_fields(0x5473c07a, 0x3dcb, 0x4dca, 0xbd, 0x6f, &[0x1e, 0x96, 0x89, 0xe7, 0x34, 0x9a]);

const SIGNATURE_OFFSET: usize = 0x28;

/// Volumes start on 8-byte boundaries within a region.
pub const VOLUME_ALIGNMENT: usize = 8;

/// `EFI_FIRMWARE_VOLUME_HEADER` without its trailing block map.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VolumeHeader {
    pub zero_vector: [u8; 16],
    pub file_system_guid: [u8; 16],
    pub fv_length: u64,
    pub signature: u32,
    pub attributes: u32,
    pub header_length: u16,
    pub checksum: u16,
    pub ext_header_offset: u16,
    pub reserved: u8,
    pub revision: u8,
}

/// `EFI_FV_BLOCK_MAP_ENTRY`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BlockMapEntry {
    pub num_blocks: u32,
    pub length: u32,
}

/// `EFI_FIRMWARE_VOLUME_EXT_HEADER`
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VolumeExtHeader {
    pub fv_name: [u8; 16],
    pub ext_header_size: u32,
}

/// A firmware volume and its location within the BIOS region.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FirmwareVolume {
    offset: u64,
    length: u64,
    file_system_guid: Guid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fv_name: Option<Guid>,
    attributes: u32,
    revision: u8,
    #[serde(skip)]
    buf: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extract_path: Option<PathBuf>,
}

impl FirmwareVolume {
    /// Decode the volume starting at the beginning of `data`, located at `offset` in its region.
    ///
    /// `data` may extend past the volume; only `FvLength` bytes are kept.
    pub fn parse(offset: u64, data: &[u8]) -> Result<Self, FlashError> {
        let (header, _) = VolumeHeader::read_from_prefix(data)
            .map_err(|_| FlashError::Structural(format!("firmware volume header at {offset:#x} is truncated")))?;

        if header.signature != FV_SIGNATURE {
            return Err(FlashError::Structural(format!("no firmware volume signature at {offset:#x}")));
        }

        let length = header.fv_length;
        if length < size_of::<VolumeHeader>() as u64 || length > data.len() as u64 {
            return Err(FlashError::Structural(format!(
                "firmware volume at {offset:#x} claims {length:#x} bytes, {:#x} available",
                data.len()
            )));
        }

        let buf = data[..length as usize].to_vec();
        Ok(Self {
            offset,
            length,
            file_system_guid: Guid::from_bytes(&header.file_system_guid),
            fv_name: ext_header(&header, &buf).map(|ext| Guid::from_bytes(&ext.fv_name)),
            attributes: header.attributes,
            revision: header.revision,
            buf,
            extract_path: None,
        })
    }

    /// Offset of the volume within its region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Declared volume length (`FvLength`).
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Offset one past the end of the volume.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn file_system_guid(&self) -> Guid {
        self.file_system_guid
    }

    /// Volume name from the extended header, when there is one.
    pub fn fv_name(&self) -> Option<Guid> {
        self.fv_name
    }

    pub fn attributes(&self) -> u32 {
        self.attributes
    }

    pub fn revision(&self) -> u8 {
        self.revision
    }

    /// Volume bytes, empty until parsed or assembled.
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn extract_path(&self) -> Option<&Path> {
        self.extract_path.as_deref()
    }

    fn name(&self) -> String {
        format!("FV at {:#x}", self.offset)
    }
}

impl fmt::Debug for FirmwareVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareVolume")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("file_system_guid", &self.file_system_guid)
            .field("fv_name", &self.fv_name)
            .field("attributes", &self.attributes)
            .field("revision", &self.revision)
            .field("extract_path", &self.extract_path)
            .finish()
    }
}

fn ext_header(header: &VolumeHeader, buf: &[u8]) -> Option<VolumeExtHeader> {
    if header.ext_header_offset == 0 {
        return None;
    }
    let bytes = buf.get(header.ext_header_offset as usize..)?;
    VolumeExtHeader::read_from_prefix(bytes).ok().map(|(ext, _)| ext)
}

/// Locate every firmware volume in `region`, in ascending, non-overlapping order.
///
/// Candidates are checked at 8-byte boundaries. A candidate whose header cannot be decoded is logged and
/// skipped; scanning resumes at the next boundary.
pub fn scan(region: &[u8]) -> Vec<FirmwareVolume> {
    let mut volumes = Vec::new();
    let mut offset = 0;
    while offset + size_of::<VolumeHeader>() <= region.len() {
        if region[offset + SIGNATURE_OFFSET..offset + SIGNATURE_OFFSET + 4] == FV_SIGNATURE.to_le_bytes() {
            match FirmwareVolume::parse(offset as u64, &region[offset..]) {
                Ok(volume) => {
                    log::debug!("found firmware volume at {offset:#x}, {:#x} bytes", volume.length);
                    offset = (offset + volume.buf.len()).next_multiple_of(VOLUME_ALIGNMENT);
                    volumes.push(volume);
                    continue;
                }
                Err(err) => log::warn!("skipping firmware volume candidate: {err}"),
            }
        }
        offset += VOLUME_ALIGNMENT;
    }
    volumes
}

impl FirmwareNode for FirmwareVolume {
    type Context = ();

    fn validate(&self, _: &()) -> Vec<FlashError> {
        let mut errs = Vec::new();
        let name = self.name();

        if self.offset % VOLUME_ALIGNMENT as u64 != 0 {
            errs.push(FlashError::invalid(&name, format!("offset is not {VOLUME_ALIGNMENT}-byte aligned")));
        }

        // Nothing more to check until the bytes are loaded.
        if self.buf.is_empty() {
            return errs;
        }

        let Ok((header, _)) = VolumeHeader::read_from_prefix(&self.buf) else {
            errs.push(FlashError::invalid(&name, "header is truncated"));
            return errs;
        };

        if header.signature != FV_SIGNATURE {
            errs.push(FlashError::invalid(&name, format!("signature is {:#010x}, expected _FVH", header.signature)));
        }

        if header.fv_length != self.buf.len() as u64 {
            errs.push(FlashError::invalid(
                &name,
                format!("FvLength is {:#x} but the volume holds {:#x} bytes", header.fv_length, self.buf.len()),
            ));
        }

        let header_length = header.header_length as usize;
        if header_length < size_of::<VolumeHeader>() || header_length > self.buf.len() || header_length % 2 != 0 {
            errs.push(FlashError::invalid(&name, format!("header length {header_length:#x} is not valid")));
        } else {
            let sum = self.buf[..header_length]
                .chunks_exact(2)
                .fold(0u16, |sum, word| sum.wrapping_add(u16::from_le_bytes([word[0], word[1]])));
            if sum != 0 {
                errs.push(FlashError::invalid(&name, format!("header checksum does not sum to zero ({sum:#06x})")));
            }
            let block_map = &self.buf[size_of::<VolumeHeader>()..header_length];
            errs.extend(validate_block_map(&name, block_map, header.fv_length));
        }

        if header.revision < FVH_REVISION {
            errs.push(FlashError::invalid(&name, format!("revision {} is older than {FVH_REVISION}", header.revision)));
        }

        let file_system = Guid::from_bytes(&header.file_system_guid);
        if file_system != FIRMWARE_FILE_SYSTEM2_GUID && file_system != FIRMWARE_FILE_SYSTEM3_GUID {
            errs.push(FlashError::invalid(&name, format!("unknown file system {file_system}")));
        }

        if header.ext_header_offset != 0
            && header.ext_header_offset as usize + size_of::<VolumeExtHeader>() > self.buf.len()
        {
            errs.push(FlashError::invalid(
                &name,
                format!("extended header at {:#x} lies outside the volume", header.ext_header_offset),
            ));
        }

        errs
    }

    fn extract(&mut self, parent_dir: &Path) -> Result<(), FlashError> {
        let file_name = format!("fv_{:08x}.bin", self.offset);
        self.extract_path = Some(node::extract_binary(&self.buf, &parent_dir.join("fv"), &file_name)?);
        Ok(())
    }

    fn assemble(&mut self) -> Result<Vec<u8>, FlashError> {
        self.buf = node::read_binary(self.extract_path.as_deref())?;
        Ok(self.buf.clone())
    }
}

fn validate_block_map(name: &str, map: &[u8], fv_length: u64) -> Vec<FlashError> {
    let mut errs = Vec::new();
    if map.len() % size_of::<BlockMapEntry>() != 0 {
        return vec![FlashError::invalid(name, format!("block map of {:#x} bytes is malformed", map.len()))];
    }
    let entries: Vec<BlockMapEntry> = map
        .chunks_exact(size_of::<BlockMapEntry>())
        .filter_map(|entry| BlockMapEntry::read_from_bytes(entry).ok())
        .collect();

    match entries.split_last() {
        Some((terminator, blocks)) if *terminator == BlockMapEntry { num_blocks: 0, length: 0 } => {
            if blocks.is_empty() {
                errs.push(FlashError::invalid(name, "block map is empty"));
            }
            if blocks.iter().any(|entry| entry.num_blocks == 0 || entry.length == 0) {
                errs.push(FlashError::invalid(name, "block map holds a zero entry before its terminator"));
            }
            let covered = blocks.iter().try_fold(0u64, |covered, entry| {
                (entry.num_blocks as u64).checked_mul(entry.length as u64).and_then(|size| covered.checked_add(size))
            });
            match covered {
                None => errs.push(FlashError::invalid(name, "block map covers more than u64::MAX bytes")),
                Some(covered) if !blocks.is_empty() && covered != fv_length => errs.push(FlashError::invalid(
                    name,
                    format!("block map covers {covered:#x} bytes, FvLength is {fv_length:#x}"),
                )),
                Some(_) => (),
            }
        }
        _ => errs.push(FlashError::invalid(name, "block map is not terminated")),
    }
    errs
}
