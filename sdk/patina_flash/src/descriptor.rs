//! Intel Flash Descriptor (IFD) parsing: the region directory of a flash image.
//!
//! The descriptor occupies the start of the image. It is located by its signature, either at offset 0x10
//! (current layout) or at offset 0 (legacy layout), and is followed by the descriptor map. FLMAP0 carries
//! the base of the region section (FRBA); the region section is an array of FLREG registers, one per
//! region kind, each holding a base and an inclusive limit in 4 KiB blocks.
//!
//! FLREG index 0 describes the descriptor itself. Index N describes region kind N (see
//! [`RegionKind`](crate::region::RegionKind)), so a region node refers to its placement by index rather
//! than by reference.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::{fmt, ops::Range};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;
use zerocopy_derive::*;

use crate::{
    node::{self, FirmwareNode},
    region::RegionKind,
    FlashError,
};

/// Descriptor signature (FLVALSIG).
pub const FLASH_SIGNATURE: u32 = 0x0FF0_A55A;

/// Granularity of region base and limit values.
pub const REGION_BLOCK_SIZE: u64 = 0x1000;

/// Maximum number of FLREG registers in a region section.
pub const MAX_REGIONS: usize = 16;

/// Name used for the descriptor in errors and logs.
pub const DESCRIPTOR_NAME: &str = "IFD";

/// Candidate signature offsets, current layout first.
const SIGNATURE_OFFSETS: [usize; 2] = [0x10, 0x0];

/// Base value of an FLREG register marking the region as not present.
const UNUSED_BASE: u16 = 0x7FFF;

const FLREG_MASK: u32 = 0x7FFF;

/// Placement of one region, decoded from an FLREG register.
///
/// `base` and `limit` are in [`REGION_BLOCK_SIZE`] units; `limit` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Position {
    /// First block of the region.
    pub base: u16,
    /// Last block of the region, inclusive.
    pub limit: u16,
}

impl Position {
    /// Decode an FLREG register value.
    pub const fn from_register(value: u32) -> Self {
        Self { base: (value & FLREG_MASK) as u16, limit: ((value >> 16) & FLREG_MASK) as u16 }
    }

    /// Encode back into an FLREG register value.
    pub const fn to_register(&self) -> u32 {
        ((self.limit as u32 & FLREG_MASK) << 16) | (self.base as u32 & FLREG_MASK)
    }

    /// True if the placement is usable: non-zero limit that does not precede the base.
    pub fn valid(&self) -> bool {
        self.limit > 0 && self.limit >= self.base
    }

    /// True if the register holds one of the "region not present" encodings.
    pub fn unused(&self) -> bool {
        !self.valid() && (self.base == UNUSED_BASE || (self.base == 0 && self.limit == 0))
    }

    /// Byte offset of the first byte of the region.
    pub fn base_offset(&self) -> u64 {
        self.base as u64 * REGION_BLOCK_SIZE
    }

    /// Byte offset one past the last byte of the region.
    pub fn end_offset(&self) -> u64 {
        (self.limit as u64 + 1) * REGION_BLOCK_SIZE
    }

    /// Number of bytes covered; zero for placements that end before they start.
    pub fn length(&self) -> u64 {
        self.end_offset().saturating_sub(self.base_offset())
    }

    /// The covered byte range.
    pub fn range(&self) -> Range<u64> {
        self.base_offset()..self.end_offset()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "base {:#x} limit {:#x} ({:#x}..{:#x})", self.base, self.limit, self.base_offset(), self.end_offset())
    }
}

/// The three descriptor map words that follow the signature.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[serde(rename_all = "PascalCase")]
pub struct DescriptorMap {
    /// Component base, flash chip count, region base, region count.
    pub flmap0: u32,
    /// Master base, master count, PCH strap base, PCH strap length.
    pub flmap1: u32,
    /// Processor strap base and length.
    pub flmap2: u32,
}

impl DescriptorMap {
    /// Offset of the component section (FCBA).
    pub fn component_base(&self) -> usize {
        ((self.flmap0 & 0xFF) as usize) << 4
    }

    /// Number of flash chips described by the component section.
    pub fn number_of_flash_chips(&self) -> u32 {
        ((self.flmap0 >> 8) & 0x3) + 1
    }

    /// Offset of the region section (FRBA).
    pub fn region_base(&self) -> usize {
        (((self.flmap0 >> 16) & 0xFF) as usize) << 4
    }

    /// Raw NR field. Many descriptors leave it zero, so it is informational only.
    pub fn number_of_regions(&self) -> u32 {
        (self.flmap0 >> 24) & 0x7
    }

    /// Offset of the master section (FMBA).
    pub fn master_base(&self) -> usize {
        ((self.flmap1 & 0xFF) as usize) << 4
    }
}

/// Offset of the descriptor signature in `buf`, if present.
pub fn find_signature(buf: &[u8]) -> Option<usize> {
    SIGNATURE_OFFSETS.into_iter().find(|&offset| {
        buf.get(offset..offset + 4)
            .is_some_and(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == FLASH_SIGNATURE)
    })
}

/// Name of the placement at directory `index`.
pub fn placement_name(index: usize) -> String {
    match index {
        0 => DESCRIPTOR_NAME.to_string(),
        _ => match RegionKind::from_index(index) {
            Some(kind) => kind.name().to_string(),
            None => format!("FLREG{index}"),
        },
    }
}

/// The region directory: descriptor bytes plus every decoded placement.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FlashDescriptor {
    #[serde(skip)]
    buf: Vec<u8>,
    signature_offset: usize,
    map: DescriptorMap,
    positions: Vec<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extract_path: Option<PathBuf>,
}

impl FlashDescriptor {
    /// Locate and decode the descriptor at the start of `image`.
    ///
    /// Fails with [`FlashError::Structural`] if there is no signature or the region section does not fit in
    /// the image.
    pub fn parse(image: &[u8]) -> Result<Self, FlashError> {
        let signature_offset = find_signature(image)
            .ok_or_else(|| FlashError::Structural("flash descriptor signature not found".to_string()))?;

        let (map, _) = DescriptorMap::read_from_prefix(&image[signature_offset + 4..])
            .map_err(|_| FlashError::Structural("flash descriptor map is truncated".to_string()))?;

        let region_base = map.region_base();
        if region_base == 0 || region_base + 4 > image.len() {
            return Err(FlashError::Structural(format!(
                "region section at {region_base:#x} lies outside the {:#x} byte image",
                image.len()
            )));
        }

        // The region section ends where the master section starts, when that comes after it.
        let mut count = MAX_REGIONS;
        let master_base = map.master_base();
        if master_base > region_base {
            count = count.min((master_base - region_base) / 4);
        }
        count = count.min((image.len() - region_base) / 4);

        let positions: Vec<Position> = image[region_base..region_base + count * 4]
            .chunks_exact(4)
            .filter_map(|register| u32::read_from_bytes(register).ok())
            .map(Position::from_register)
            .collect();

        if positions.is_empty() {
            return Err(FlashError::Structural("region section holds no entries".to_string()));
        }

        let mut descriptor = Self { buf: Vec::new(), signature_offset, map, positions, extract_path: None };
        let end = descriptor.extent().end.min(image.len() as u64) as usize;
        descriptor.buf = image[..end].to_vec();

        log::debug!(
            "flash descriptor: signature at {signature_offset:#x}, {} entries at {region_base:#x}, {end:#x} bytes, \
             {} chip(s), NR {}",
            descriptor.positions.len(),
            descriptor.map.number_of_flash_chips(),
            descriptor.map.number_of_regions()
        );
        Ok(descriptor)
    }

    /// Offset of the signature within the image.
    pub fn signature_offset(&self) -> usize {
        self.signature_offset
    }

    /// The descriptor map words.
    pub fn map(&self) -> &DescriptorMap {
        &self.map
    }

    /// Every decoded placement, indexed by FLREG number.
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Placement at FLREG `index`, if the region section is that long.
    pub fn position(&self, index: usize) -> Option<&Position> {
        self.positions.get(index)
    }

    /// Byte range of the descriptor itself. It always starts at offset zero.
    pub fn extent(&self) -> Range<u64> {
        0..self.positions.first().map_or(REGION_BLOCK_SIZE, Position::end_offset)
    }

    /// The descriptor bytes, empty until parsed or assembled.
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// Where the descriptor was extracted to.
    pub fn extract_path(&self) -> Option<&Path> {
        self.extract_path.as_deref()
    }

    /// Every placement in use, the descriptor first, as `(name, byte range)`.
    pub fn placements(&self) -> Vec<(String, Range<u64>)> {
        let mut placements = vec![(DESCRIPTOR_NAME.to_string(), self.extent())];
        placements.extend(
            self.positions
                .iter()
                .enumerate()
                .skip(1)
                .filter(|(_, position)| position.valid())
                .map(|(index, position)| (placement_name(index), position.range())),
        );
        placements
    }
}

impl fmt::Debug for FlashDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashDescriptor")
            .field("buf_len", &self.buf.len())
            .field("signature_offset", &self.signature_offset)
            .field("map", &self.map)
            .field("positions", &self.positions)
            .field("extract_path", &self.extract_path)
            .finish()
    }
}

impl FirmwareNode for FlashDescriptor {
    type Context = ();

    fn validate(&self, _: &()) -> Vec<FlashError> {
        let mut errs = Vec::new();

        if !self.buf.is_empty() {
            if self.buf.len() as u64 != self.extent().end {
                errs.push(FlashError::invalid(
                    DESCRIPTOR_NAME,
                    format!("holds {:#x} bytes, its region is {:#x} bytes", self.buf.len(), self.extent().end),
                ));
            }
            if find_signature(&self.buf) != Some(self.signature_offset) {
                errs.push(FlashError::invalid(
                    DESCRIPTOR_NAME,
                    format!("signature {FLASH_SIGNATURE:#010x} not found at {:#x}", self.signature_offset),
                ));
            }
        }

        match self.positions.first() {
            None => errs.push(FlashError::invalid(DESCRIPTOR_NAME, "region section holds no entries")),
            Some(position) if position.base != 0 => errs.push(FlashError::invalid(
                DESCRIPTOR_NAME,
                format!("descriptor region must start at offset 0, region was {position}"),
            )),
            Some(_) => {}
        }

        for (index, position) in self.positions.iter().enumerate().skip(1) {
            if !position.valid() && !position.unused() {
                let reason = format!("degenerate placement, region was {position}");
                errs.push(FlashError::invalid(placement_name(index), reason));
            }
        }

        let placements = self.placements();
        for (i, (first, first_range)) in placements.iter().enumerate() {
            for (second, second_range) in &placements[i + 1..] {
                if first_range.start < second_range.end && second_range.start < first_range.end {
                    errs.push(FlashError::Overlap { first: first.clone(), second: second.clone() });
                }
            }
        }

        errs
    }

    fn extract(&mut self, parent_dir: &Path) -> Result<(), FlashError> {
        self.extract_path = Some(node::extract_binary(&self.buf, &parent_dir.join("ifd"), "flashdescriptor.bin")?);
        Ok(())
    }

    fn assemble(&mut self) -> Result<Vec<u8>, FlashError> {
        self.buf = node::read_binary(self.extract_path.as_deref())?;
        Ok(self.buf.clone())
    }
}
