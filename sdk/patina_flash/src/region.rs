//! Flash regions and the per-kind region parsers.
//!
//! Each region kind matches an FLREG index in the region directory. Most kinds are opaque and carried as a
//! single raw payload. The BIOS region is decomposed into the firmware volumes it holds and the padding
//! between them; a BIOS region without any volume falls back to a raw payload.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::fmt;
use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    descriptor::FlashDescriptor,
    node::{self, FirmwareNode},
    padding::Padding,
    volume::{self, FirmwareVolume},
    FlashError,
};

/// Region kinds, numbered by their FLREG index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    #[serde(rename = "BIOS")]
    Bios = 1,
    #[serde(rename = "ME")]
    Me = 2,
    #[serde(rename = "GBE")]
    Gbe = 3,
    #[serde(rename = "PD")]
    PlatformData = 4,
    DevExp1 = 5,
    #[serde(rename = "BIOS2")]
    Bios2 = 6,
    Microcode = 7,
    #[serde(rename = "EC")]
    Ec = 8,
    DevExp2 = 9,
    #[serde(rename = "IE")]
    Ie = 10,
    #[serde(rename = "10GbE0")]
    TenGbe0 = 11,
    #[serde(rename = "10GbE1")]
    TenGbe1 = 12,
    Reserved1 = 13,
    Reserved2 = 14,
    #[serde(rename = "PTT")]
    Ptt = 15,
}

impl RegionKind {
    /// Every kind, in FLREG order.
    pub const ALL: [RegionKind; 15] = [
        RegionKind::Bios,
        RegionKind::Me,
        RegionKind::Gbe,
        RegionKind::PlatformData,
        RegionKind::DevExp1,
        RegionKind::Bios2,
        RegionKind::Microcode,
        RegionKind::Ec,
        RegionKind::DevExp2,
        RegionKind::Ie,
        RegionKind::TenGbe0,
        RegionKind::TenGbe1,
        RegionKind::Reserved1,
        RegionKind::Reserved2,
        RegionKind::Ptt,
    ];

    /// The kind stored at FLREG `index`. Index 0 is the descriptor and has no kind.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.index() == index)
    }

    /// FLREG index of this kind in the region directory.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            RegionKind::Bios => "BIOS",
            RegionKind::Me => "ME",
            RegionKind::Gbe => "GBE",
            RegionKind::PlatformData => "PD",
            RegionKind::DevExp1 => "DevExp1",
            RegionKind::Bios2 => "BIOS2",
            RegionKind::Microcode => "Microcode",
            RegionKind::Ec => "EC",
            RegionKind::DevExp2 => "DevExp2",
            RegionKind::Ie => "IE",
            RegionKind::TenGbe0 => "10GbE0",
            RegionKind::TenGbe1 => "10GbE1",
            RegionKind::Reserved1 => "Reserved1",
            RegionKind::Reserved2 => "Reserved2",
            RegionKind::Ptt => "PTT",
        }
    }

    /// Directory the region is extracted into, e.g. `gbe`.
    pub fn dir_name(self) -> String {
        self.name().to_ascii_lowercase()
    }

    /// File name of a raw payload, e.g. `gberegion.bin`.
    pub fn file_name(self) -> String {
        format!("{}region.bin", self.dir_name())
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One element of a decomposed BIOS region.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum BiosElement {
    #[serde(rename = "FV")]
    Volume(FirmwareVolume),
    Padding(Padding),
}

impl BiosElement {
    /// Offset within the BIOS region.
    pub fn offset(&self) -> u64 {
        match self {
            BiosElement::Volume(volume) => volume.offset(),
            BiosElement::Padding(padding) => padding.offset(),
        }
    }

    pub fn end(&self) -> u64 {
        match self {
            BiosElement::Volume(volume) => volume.end(),
            BiosElement::Padding(padding) => padding.end(),
        }
    }
}

impl FirmwareNode for BiosElement {
    type Context = ();

    fn validate(&self, context: &()) -> Vec<FlashError> {
        match self {
            BiosElement::Volume(volume) => volume.validate(context),
            BiosElement::Padding(padding) => padding.validate(context),
        }
    }

    fn extract(&mut self, parent_dir: &Path) -> Result<(), FlashError> {
        match self {
            BiosElement::Volume(volume) => volume.extract(parent_dir),
            BiosElement::Padding(padding) => padding.extract(parent_dir),
        }
    }

    fn assemble(&mut self) -> Result<Vec<u8>, FlashError> {
        match self {
            BiosElement::Volume(volume) => volume.assemble(),
            BiosElement::Padding(padding) => padding.assemble(),
        }
    }
}

type RegionParser = fn(RegionKind, &[u8]) -> Region;

/// Kinds with a dedicated parser. Every other kind is parsed as a raw payload.
const PARSERS: &[(RegionKind, RegionParser)] = &[(RegionKind::Bios, Region::parse_bios)];

/// A region of the flash image.
///
/// The region's placement is not stored here: it lives in the region directory at index
/// [`RegionKind::index`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Region {
    #[serde(rename = "Type")]
    kind: RegionKind,
    #[serde(skip)]
    buf: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extract_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    elements: Option<Vec<BiosElement>>,
}

impl Region {
    /// Parse `buf` with the parser registered for `kind`.
    pub fn parse(kind: RegionKind, buf: &[u8]) -> Self {
        let parser = PARSERS
            .iter()
            .find(|(registered, _)| *registered == kind)
            .map_or(Self::parse_raw as RegionParser, |(_, parser)| *parser);
        parser(kind, buf)
    }

    fn parse_raw(kind: RegionKind, buf: &[u8]) -> Self {
        Self { kind, buf: buf.to_vec(), extract_path: None, elements: None }
    }

    fn parse_bios(kind: RegionKind, buf: &[u8]) -> Self {
        let volumes = volume::scan(buf);
        if volumes.is_empty() {
            log::info!("no firmware volumes found in the {kind} region, keeping it raw");
            return Self::parse_raw(kind, buf);
        }

        let mut elements = Vec::with_capacity(volumes.len() * 2 + 1);
        let mut cursor = 0;
        for volume in volumes {
            if volume.offset() > cursor {
                let gap = buf[cursor as usize..volume.offset() as usize].to_vec();
                elements.push(BiosElement::Padding(Padding::new(cursor, gap)));
            }
            cursor = volume.end();
            elements.push(BiosElement::Volume(volume));
        }
        if cursor < buf.len() as u64 {
            elements.push(BiosElement::Padding(Padding::new(cursor, buf[cursor as usize..].to_vec())));
        }

        Self { kind, buf: buf.to_vec(), extract_path: None, elements: Some(elements) }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Region bytes, empty until parsed or assembled.
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// The raw payload file, or the region directory when the region was decomposed.
    pub fn extract_path(&self) -> Option<&Path> {
        self.extract_path.as_deref()
    }

    /// Volumes and padding of a decomposed BIOS region.
    pub fn elements(&self) -> Option<&[BiosElement]> {
        self.elements.as_deref()
    }

    /// Firmware volumes of a decomposed BIOS region.
    pub fn volumes(&self) -> impl Iterator<Item = &FirmwareVolume> {
        self.elements.iter().flatten().filter_map(|element| match element {
            BiosElement::Volume(volume) => Some(volume),
            BiosElement::Padding(_) => None,
        })
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("kind", &self.kind)
            .field("buf_len", &self.buf.len())
            .field("extract_path", &self.extract_path)
            .field("elements", &self.elements)
            .finish()
    }
}

impl FirmwareNode for Region {
    type Context = FlashDescriptor;

    fn validate(&self, descriptor: &FlashDescriptor) -> Vec<FlashError> {
        let mut errs = Vec::new();
        let name = self.kind.name();

        match descriptor.position(self.kind.index()) {
            None => errs.push(FlashError::invalid(name, "position is missing from the region directory")),
            Some(position) if !position.valid() => {
                errs.push(FlashError::invalid(name, format!("region was {position}")));
            }
            Some(position) => {
                if !self.buf.is_empty() && self.buf.len() as u64 != position.length() {
                    let reason = format!("holds {:#x} bytes, its position is {position}", self.buf.len());
                    errs.push(FlashError::invalid(name, reason));
                }
            }
        }

        if let Some(elements) = &self.elements {
            let mut cursor = 0;
            for element in elements {
                if element.offset() != cursor {
                    errs.push(FlashError::invalid(
                        name,
                        format!("element at {:#x} does not start where the last ended ({cursor:#x})", element.offset()),
                    ));
                }
                cursor = element.end();
            }
            // Before assembly the directory gives the length; afterwards the bytes do.
            let length = match descriptor.position(self.kind.index()) {
                Some(position) if position.valid() && self.buf.is_empty() => Some(position.length()),
                _ if !self.buf.is_empty() => Some(self.buf.len() as u64),
                _ => None,
            };
            if let Some(length) = length.filter(|&length| length != cursor) {
                errs.push(FlashError::invalid(name, format!("elements end at {cursor:#x}, the region is {length:#x}")));
            }
            for element in elements {
                errs.extend(element.validate(&()));
            }
        }

        errs
    }

    fn extract(&mut self, parent_dir: &Path) -> Result<(), FlashError> {
        let dir = parent_dir.join(self.kind.dir_name());
        match &mut self.elements {
            Some(elements) => {
                fs::create_dir_all(&dir).map_err(|err| FlashError::io(&dir, err))?;
                for element in elements.iter_mut() {
                    element.extract(&dir)?;
                }
                self.extract_path = Some(dir);
            }
            None => {
                self.extract_path = Some(node::extract_binary(&self.buf, &dir, &self.kind.file_name())?);
            }
        }
        Ok(())
    }

    fn assemble(&mut self) -> Result<Vec<u8>, FlashError> {
        self.buf = match &mut self.elements {
            Some(elements) => {
                let mut buf = Vec::new();
                for element in elements.iter_mut() {
                    buf.extend(element.assemble()?);
                }
                buf
            }
            None => node::read_binary(self.extract_path.as_deref())?,
        };
        Ok(self.buf.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_support::{build_image, build_volume},
        volume::FIRMWARE_FILE_SYSTEM2_GUID,
    };

    #[test]
    fn kind_indices_and_names() {
        assert_eq!(RegionKind::Bios.index(), 1);
        assert_eq!(RegionKind::Ptt.index(), 15);
        assert_eq!(RegionKind::from_index(3), Some(RegionKind::Gbe));
        assert_eq!(RegionKind::from_index(0), None);
        assert_eq!(RegionKind::from_index(16), None);
        assert_eq!(RegionKind::TenGbe0.dir_name(), "10gbe0");
        assert_eq!(RegionKind::Gbe.file_name(), "gberegion.bin");
        assert_eq!(serde_json::to_string(&RegionKind::PlatformData).unwrap(), "\"PD\"");
        for kind in RegionKind::ALL {
            assert_eq!(serde_json::to_string(&kind).unwrap(), format!("\"{}\"", kind.name()));
        }
    }

    #[test]
    fn raw_region_extracts_to_kind_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = Region::parse(RegionKind::Gbe, &[0x5a; 0x1000]);
        assert!(region.elements().is_none());
        region.extract(dir.path()).unwrap();
        assert_eq!(region.extract_path(), Some(dir.path().join("gbe").join("gberegion.bin").as_path()));
        assert_eq!(std::fs::read(dir.path().join("gbe").join("gberegion.bin")).unwrap(), vec![0x5a; 0x1000]);
    }

    #[test]
    fn bios_without_volumes_is_raw() {
        let region = Region::parse(RegionKind::Bios, &[0xff; 0x2000]);
        assert!(region.elements().is_none());
        assert_eq!(region.buf().len(), 0x2000);
    }

    #[test]
    fn bios_is_decomposed_into_volumes_and_padding() {
        let mut buf = vec![0xffu8; 0x2000];
        buf[0x800..0x1800].copy_from_slice(&build_volume(0x1000, FIRMWARE_FILE_SYSTEM2_GUID));

        let region = Region::parse(RegionKind::Bios, &buf);
        let elements = region.elements().unwrap();
        assert_eq!(elements.len(), 3);
        assert!(matches!(&elements[0], BiosElement::Padding(p) if p.offset() == 0 && p.length() == 0x800));
        assert!(matches!(&elements[1], BiosElement::Volume(v) if v.offset() == 0x800));
        assert!(matches!(&elements[2], BiosElement::Padding(p) if p.offset() == 0x1800 && p.end() == 0x2000));
        assert_eq!(region.volumes().count(), 1);
    }

    #[test]
    fn bios_extract_and_assemble() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = vec![0xffu8; 0x2000];
        buf[..0x1000].copy_from_slice(&build_volume(0x1000, FIRMWARE_FILE_SYSTEM2_GUID));

        let mut region = Region::parse(RegionKind::Bios, &buf);
        region.extract(dir.path()).unwrap();
        assert!(dir.path().join("bios").join("fv").join("fv_00000000.bin").is_file());
        assert!(dir.path().join("bios").join("padding").join("padding_00001000.bin").is_file());

        let mut restored: Region = serde_json::from_str(&serde_json::to_string(&region).unwrap()).unwrap();
        assert_eq!(restored.assemble().unwrap(), buf);
    }

    #[test]
    fn validate_uses_directory_position() {
        let image = build_image(0x4000, &[(3, 1, 1)]);
        let descriptor = FlashDescriptor::parse(&image).unwrap();

        let region = Region::parse(RegionKind::Gbe, &image[0x1000..0x2000]);
        assert!(region.validate(&descriptor).is_empty());

        let short = Region::parse(RegionKind::Gbe, &image[0x1000..0x1800]);
        assert_eq!(short.validate(&descriptor).len(), 1);

        // ME is unused in this directory.
        let me = Region::parse(RegionKind::Me, &[0; 0x1000]);
        assert!(matches!(&me.validate(&descriptor)[..], [FlashError::Invalid { node, .. }] if node == "ME"));
    }

    #[test]
    fn validate_requires_elements_to_fill_region() {
        let mut image = build_image(0x4000, &[(1, 2, 3)]);
        image[0x2000..0x3000].copy_from_slice(&build_volume(0x1000, FIRMWARE_FILE_SYSTEM2_GUID));
        let descriptor = FlashDescriptor::parse(&image).unwrap();
        let region = Region::parse(RegionKind::Bios, &image[0x2000..0x4000]);
        assert!(region.validate(&descriptor).is_empty(), "{:?}", region.validate(&descriptor));

        // Drop the trailing padding, as a hand-edited manifest might.
        let mut value = serde_json::to_value(&region).unwrap();
        value["Elements"].as_array_mut().unwrap().pop();
        let truncated: Region = serde_json::from_value(value).unwrap();

        let errs = truncated.validate(&descriptor);
        assert_eq!(errs.len(), 1, "{errs:?}");
        assert_eq!(errs[0].to_string(), "BIOS is not valid: elements end at 0x1000, the region is 0x2000");
    }
}
