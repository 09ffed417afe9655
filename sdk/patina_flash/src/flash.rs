//! The root node: a complete flash image.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::ops::Range;
use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    descriptor::{FlashDescriptor, Position, DESCRIPTOR_NAME},
    manifest,
    node::FirmwareNode,
    padding::Padding,
    region::{Region, RegionKind},
    FlashError,
};

/// Value of bytes that no node claims when an image is assembled.
pub const ERASE_BYTE: u8 = 0xFF;

/// A flash image: the region directory, every region it places, and padding for the bytes in between.
///
/// The image exclusively owns its nodes. Regions refer to their placement by kind, which indexes the
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FlashImage {
    flash_size: u64,
    #[serde(rename = "IFD")]
    descriptor: FlashDescriptor,
    regions: Vec<Region>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    padding: Vec<Padding>,
}

/// `position` clamped to an image of `flash_size` bytes.
fn clamp(position: &Position, flash_size: u64) -> Range<u64> {
    let start = position.base_offset().min(flash_size);
    start..position.end_offset().clamp(start, flash_size)
}

fn past_end(end: u64, flash_size: u64) -> String {
    format!("ends at {end:#x}, past the end of the {flash_size:#x} byte image")
}

impl FlashImage {
    /// Decode a raw flash image.
    ///
    /// A region whose placement runs past the end of the image is truncated to the bytes available; this is
    /// reported by [`validate`](FirmwareNode::validate), not here.
    pub fn parse(buf: &[u8]) -> Result<Self, FlashError> {
        let descriptor = FlashDescriptor::parse(buf)?;
        let flash_size = buf.len() as u64;

        let mut regions = Vec::new();
        let mut covered = vec![0..descriptor.extent().end.min(flash_size)];
        for kind in RegionKind::ALL {
            let Some(position) = descriptor.position(kind.index()).filter(|position| position.valid()) else {
                continue;
            };
            let range = clamp(position, flash_size);
            if range.end < position.end_offset() {
                let end = position.end_offset();
                log::warn!("{kind} region ends at {end:#x}, past the end of the {flash_size:#x} byte image");
            }
            log::debug!("{kind} region at {:#x}..{:#x}", range.start, range.end);
            regions.push(Region::parse(kind, &buf[range.start as usize..range.end as usize]));
            covered.push(range);
        }

        covered.sort_by_key(|range| range.start);
        let mut padding = Vec::new();
        let mut cursor = 0;
        for range in covered {
            if range.start > cursor {
                padding.push(Padding::new(cursor, buf[cursor as usize..range.start as usize].to_vec()));
            }
            cursor = cursor.max(range.end);
        }
        if cursor < flash_size {
            padding.push(Padding::new(cursor, buf[cursor as usize..].to_vec()));
        }

        Ok(Self { flash_size, descriptor, regions, padding })
    }

    /// Total image length in bytes.
    pub fn flash_size(&self) -> u64 {
        self.flash_size
    }

    /// The region directory.
    pub fn descriptor(&self) -> &FlashDescriptor {
        &self.descriptor
    }

    /// Every region present, in FLREG order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// The region of `kind`, if the image has one.
    pub fn region(&self, kind: RegionKind) -> Option<&Region> {
        self.regions.iter().find(|region| region.kind() == kind)
    }

    /// Gaps between the descriptor and the regions.
    pub fn padding(&self) -> &[Padding] {
        &self.padding
    }

    fn place(image: &mut [u8], name: &str, range: Range<u64>, bytes: &[u8]) -> Result<(), FlashError> {
        if bytes.len() as u64 != range.end - range.start {
            return Err(FlashError::Structural(format!(
                "{name} is {:#x} bytes but its placement {:#x}..{:#x} holds {:#x}",
                bytes.len(),
                range.start,
                range.end,
                range.end - range.start
            )));
        }
        let Some(target) = image.get_mut(range.start as usize..range.end as usize) else {
            return Err(FlashError::Structural(format!(
                "{name} at {:#x}..{:#x} does not fit in a {:#x} byte image",
                range.start,
                range.end,
                image.len()
            )));
        };
        target.copy_from_slice(bytes);
        Ok(())
    }
}

impl TryFrom<&[u8]> for FlashImage {
    type Error = FlashError;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(buf)
    }
}

impl FirmwareNode for FlashImage {
    type Context = ();

    fn validate(&self, _: &()) -> Vec<FlashError> {
        let mut errs = self.descriptor.validate(&());

        let descriptor_end = self.descriptor.extent().end;
        if descriptor_end > self.flash_size {
            errs.push(FlashError::invalid(DESCRIPTOR_NAME, past_end(descriptor_end, self.flash_size)));
        }

        for (i, region) in self.regions.iter().enumerate() {
            let kind = region.kind();
            if self.regions[..i].iter().any(|earlier| earlier.kind() == kind) {
                errs.push(FlashError::invalid(kind.name(), "region appears more than once"));
            }
            errs.extend(region.validate(&self.descriptor));
            if let Some(position) = self.descriptor.position(kind.index()) {
                if position.valid() && position.end_offset() > self.flash_size {
                    errs.push(FlashError::invalid(kind.name(), past_end(position.end_offset(), self.flash_size)));
                }
            }
        }

        for padding in &self.padding {
            errs.extend(padding.validate(&()));
            if padding.end() > self.flash_size {
                let name = format!("padding at {:#x}", padding.offset());
                errs.push(FlashError::invalid(name, past_end(padding.end(), self.flash_size)));
            }
        }

        errs
    }

    /// Extract every node below `parent_dir` and write the manifest there.
    fn extract(&mut self, parent_dir: &Path) -> Result<(), FlashError> {
        fs::create_dir_all(parent_dir).map_err(|err| FlashError::io(parent_dir, err))?;
        self.descriptor.extract(parent_dir)?;
        for region in self.regions.iter_mut() {
            region.extract(parent_dir)?;
        }
        for padding in self.padding.iter_mut() {
            padding.extract(parent_dir)?;
        }
        manifest::write(self, parent_dir)?;
        log::info!("extracted {} regions to {}", self.regions.len(), parent_dir.display());
        Ok(())
    }

    /// Rebuild the image. Bytes claimed by no node are [`ERASE_BYTE`].
    fn assemble(&mut self) -> Result<Vec<u8>, FlashError> {
        let flash_size = self.flash_size;
        let size = usize::try_from(flash_size)
            .map_err(|_| FlashError::Structural(format!("flash size {flash_size:#x} is too large")))?;
        let mut image = vec![ERASE_BYTE; size];

        let descriptor = self.descriptor.assemble()?;
        let extent = self.descriptor.extent();
        Self::place(&mut image, DESCRIPTOR_NAME, extent.start..extent.end.min(flash_size), &descriptor)?;

        for region in self.regions.iter_mut() {
            let kind = region.kind();
            let bytes = region.assemble()?;
            let position = self
                .descriptor
                .position(kind.index())
                .filter(|position| position.valid())
                .ok_or_else(|| FlashError::Structural(format!("{kind} region has no valid placement")))?;
            Self::place(&mut image, kind.name(), clamp(position, flash_size), &bytes)?;
        }

        for padding in self.padding.iter_mut() {
            let bytes = padding.assemble()?;
            let name = format!("padding at {:#x}", padding.offset());
            let end = padding
                .offset()
                .checked_add(padding.length())
                .ok_or_else(|| FlashError::Structural(format!("{name} runs past the end of the address space")))?;
            Self::place(&mut image, &name, padding.offset()..end, &bytes)?;
        }

        log::info!("assembled {size:#x} byte image");
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        region::BiosElement,
        test_support::{build_image, build_volume, init_logger},
        volume::FIRMWARE_FILE_SYSTEM3_GUID,
    };

    #[test]
    fn parse_finds_regions_and_padding() {
        let image = build_image(0x5000, &[(3, 1, 1), (1, 2, 3)]);
        let flash = FlashImage::parse(&image).unwrap();

        assert_eq!(flash.flash_size(), 0x5000);
        assert_eq!(flash.regions().len(), 2);
        assert_eq!(flash.regions()[0].kind(), RegionKind::Bios);
        assert_eq!(flash.region(RegionKind::Gbe).unwrap().buf(), &image[0x1000..0x2000]);
        assert!(flash.region(RegionKind::Me).is_none());
        assert_eq!(flash.padding().len(), 1);
        assert_eq!((flash.padding()[0].offset(), flash.padding()[0].end()), (0x4000, 0x5000));
        assert!(flash.validate(&()).is_empty(), "{:?}", flash.validate(&()));
    }

    #[test]
    fn try_from_slice() {
        let image = build_image(0x4000, &[(3, 1, 1)]);
        let flash = FlashImage::try_from(image.as_slice()).unwrap();
        assert_eq!(flash.regions().len(), 1);
        assert_eq!(flash.padding().len(), 1);
    }

    #[test]
    fn region_past_end_is_reported() {
        let image = build_image(0x3000, &[(1, 2, 3)]);
        let flash = FlashImage::parse(&image).unwrap();
        assert_eq!(flash.region(RegionKind::Bios).unwrap().buf().len(), 0x1000);

        let errs = flash.validate(&());
        assert!(errs.iter().any(|err| {
            matches!(err, FlashError::Invalid { node, reason } if node == "BIOS" && reason.contains("past the end"))
        }));
    }

    #[test]
    fn extract_then_assemble_is_identity() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();

        let mut image = build_image(0x6000, &[(3, 1, 1), (1, 2, 4)]);
        image[0x2000..0x3000].copy_from_slice(&build_volume(0x1000, FIRMWARE_FILE_SYSTEM3_GUID));
        let mut flash = FlashImage::parse(&image).unwrap();
        let bios = flash.region(RegionKind::Bios).unwrap();
        assert!(matches!(bios.elements(), Some([BiosElement::Volume(_), BiosElement::Padding(_)])));

        flash.extract(dir.path()).unwrap();
        assert!(dir.path().join(manifest::SUMMARY_FILE).is_file());
        assert!(dir.path().join("ifd").join("flashdescriptor.bin").is_file());
        assert!(dir.path().join("gbe").join("gberegion.bin").is_file());
        assert!(dir.path().join("padding").join("padding_00005000.bin").is_file());

        let mut restored = manifest::read(dir.path()).unwrap();
        assert_eq!(restored.assemble().unwrap(), image);
        assert!(restored.validate(&()).is_empty());
    }

    #[test]
    fn assemble_rejects_resized_region() {
        let dir = tempfile::tempdir().unwrap();
        let image = build_image(0x4000, &[(3, 1, 1)]);
        let mut flash = FlashImage::parse(&image).unwrap();
        flash.extract(dir.path()).unwrap();
        fs::write(dir.path().join("gbe").join("gberegion.bin"), [0u8; 0x10]).unwrap();

        let mut restored = manifest::read(dir.path()).unwrap();
        assert!(matches!(restored.assemble(), Err(FlashError::Structural(_))));
    }

    #[test]
    fn uncovered_bytes_are_erased() {
        let dir = tempfile::tempdir().unwrap();
        let image = build_image(0x4000, &[(3, 1, 1)]);
        let mut flash = FlashImage::parse(&image).unwrap();
        flash.extract(dir.path()).unwrap();

        // Drop the trailing padding from the manifest; its bytes come back erased.
        let json = fs::read_to_string(dir.path().join(manifest::SUMMARY_FILE)).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value.as_object_mut().unwrap().remove("Padding");
        let mut restored = manifest::from_json(&value.to_string()).unwrap();

        let rebuilt = restored.assemble().unwrap();
        assert_eq!(&rebuilt[..0x2000], &image[..0x2000]);
        assert!(rebuilt[0x2000..].iter().all(|&byte| byte == ERASE_BYTE));
    }

    #[test]
    fn padding_at_end_of_address_space() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let image = build_image(0x4000, &[(3, 1, 1)]);
        let mut flash = FlashImage::parse(&image).unwrap();
        flash.extract(dir.path()).unwrap();

        let json = fs::read_to_string(dir.path().join(manifest::SUMMARY_FILE)).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["Padding"][0]["Offset"] = serde_json::Value::from(u64::MAX - 0x10);
        let mut restored = manifest::from_json(&value.to_string()).unwrap();

        let errs = restored.validate(&());
        assert!(errs.iter().any(|err| err.to_string().starts_with("padding at 0xffffffffffffffef")), "{errs:?}");
        match restored.assemble() {
            Err(FlashError::Structural(reason)) => assert!(reason.contains("address space"), "{reason}"),
            other => panic!("expected structural error, got {other:?}"),
        }
    }
}
