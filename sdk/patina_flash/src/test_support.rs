//! Synthetic image builders shared by the unit tests.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use patina_guid::Guid;
use zerocopy::IntoBytes;

use crate::{
    descriptor::{Position, FLASH_SIGNATURE, MAX_REGIONS, REGION_BLOCK_SIZE},
    volume::{BlockMapEntry, VolumeHeader, FV_SIGNATURE},
};

/// Route `log` output to the test harness. Silent unless `RUST_LOG` is set.
pub(crate) fn init_logger() {
    use std::sync::OnceLock;
    static INIT: OnceLock<()> = OnceLock::new();

    INIT.get_or_init(|| {
        let mut builder = env_logger::Builder::from_default_env();
        if std::env::var("RUST_LOG").is_err() {
            builder.filter_level(log::LevelFilter::Off);
        }
        let _ = builder.is_test(true).try_init();
    });
}

/// FLREG value for a region that is not present.
pub(crate) const UNUSED_REGISTER: u32 = 0x0000_7FFF;

/// Build a flash image of `size` bytes with a descriptor at offset 0.
///
/// `regions` lists `(FLREG index, base, limit)`. Every other entry except the descriptor is unused. Valid
/// regions are filled with a pattern derived from their index; bytes inside the descriptor block are left
/// alone so a region overlapping it does not clobber the signature.
pub(crate) fn build_image(size: usize, regions: &[(usize, u16, u16)]) -> Vec<u8> {
    let mut image = vec![0xffu8; size];
    image[0x10..0x14].copy_from_slice(&FLASH_SIGNATURE.to_le_bytes());
    // FCBA 0x30, FRBA 0x40, FMBA 0x80.
    image[0x14..0x18].copy_from_slice(&((0x04u32 << 16) | 0x03).to_le_bytes());
    image[0x18..0x1c].copy_from_slice(&0x08u32.to_le_bytes());
    image[0x1c..0x20].copy_from_slice(&0u32.to_le_bytes());

    for index in 0..MAX_REGIONS {
        let register = if index == 0 { 0 } else { UNUSED_REGISTER };
        set_register(&mut image, index, register);
    }

    for &(index, base, limit) in regions {
        let position = Position { base, limit };
        set_register(&mut image, index, position.to_register());
        if !position.valid() {
            continue;
        }
        let start = position.base_offset().max(REGION_BLOCK_SIZE) as usize;
        let end = (position.end_offset() as usize).min(size);
        for (offset, byte) in image.iter_mut().enumerate().take(end).skip(start) {
            *byte = (index as u8).wrapping_mul(0x10).wrapping_add((offset % 251) as u8);
        }
    }
    image
}

fn set_register(image: &mut [u8], index: usize, register: u32) {
    let offset = 0x40 + index * 4;
    image[offset..offset + 4].copy_from_slice(&register.to_le_bytes());
}

/// Build a well-formed firmware volume of `length` bytes (a multiple of 0x100) with an erased body.
pub(crate) fn build_volume(length: usize, file_system: Guid) -> Vec<u8> {
    let header_length = core::mem::size_of::<VolumeHeader>() + 2 * core::mem::size_of::<BlockMapEntry>();
    let mut header = VolumeHeader {
        zero_vector: [0; 16],
        file_system_guid: *file_system.as_bytes(),
        fv_length: length as u64,
        signature: FV_SIGNATURE,
        attributes: 0x0004_feff,
        header_length: header_length as u16,
        checksum: 0,
        ext_header_offset: 0,
        reserved: 0,
        revision: 2,
    };
    let block_map = [
        BlockMapEntry { num_blocks: (length / 0x100) as u32, length: 0x100 },
        BlockMapEntry { num_blocks: 0, length: 0 },
    ];

    let mut volume = vec![0xffu8; length];
    volume[..core::mem::size_of::<VolumeHeader>()].copy_from_slice(header.as_bytes());
    volume[core::mem::size_of::<VolumeHeader>()..header_length].copy_from_slice(block_map.as_bytes());

    let sum = volume[..header_length]
        .chunks_exact(2)
        .fold(0u16, |sum, word| sum.wrapping_add(u16::from_le_bytes([word[0], word[1]])));
    header.checksum = 0u16.wrapping_sub(sum);
    volume[..core::mem::size_of::<VolumeHeader>()].copy_from_slice(header.as_bytes());
    volume
}
