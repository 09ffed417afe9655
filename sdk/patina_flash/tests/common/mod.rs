//! Synthetic flash images for the integration tests.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0

use core::mem::size_of;

use patina_flash::{
    descriptor::{Position, FLASH_SIGNATURE, MAX_REGIONS},
    volume::{BlockMapEntry, VolumeHeader, FIRMWARE_FILE_SYSTEM2_GUID, FV_SIGNATURE},
};
use zerocopy::IntoBytes;

pub const BIOS_INDEX: usize = 1;
pub const GBE_INDEX: usize = 3;

/// Descriptor in block 0, GbE in block 1, BIOS in blocks 2..=3, padding after that up to `size`.
pub fn sample_image(size: usize) -> Vec<u8> {
    let mut image = vec![0xffu8; size];
    image[0x10..0x14].copy_from_slice(&FLASH_SIGNATURE.to_le_bytes());
    image[0x14..0x18].copy_from_slice(&((0x04u32 << 16) | 0x03).to_le_bytes());
    image[0x18..0x1c].copy_from_slice(&0x08u32.to_le_bytes());

    for index in 0..MAX_REGIONS {
        let register = match index {
            0 => 0,
            GBE_INDEX => Position { base: 1, limit: 1 }.to_register(),
            BIOS_INDEX => Position { base: 2, limit: 3 }.to_register(),
            _ => 0x0000_7fff,
        };
        image[0x40 + index * 4..0x44 + index * 4].copy_from_slice(&register.to_le_bytes());
    }

    for (offset, byte) in image.iter_mut().enumerate().take(0x4000.min(size)).skip(0x1000) {
        *byte = (offset % 253) as u8;
    }
    image
}

/// Overwrite the first 0x1000 bytes of the BIOS region with a well-formed firmware volume.
pub fn with_volume(mut image: Vec<u8>) -> Vec<u8> {
    let header_length = size_of::<VolumeHeader>() + 2 * size_of::<BlockMapEntry>();
    let mut header = VolumeHeader {
        zero_vector: [0; 16],
        file_system_guid: *FIRMWARE_FILE_SYSTEM2_GUID.as_bytes(),
        fv_length: 0x1000,
        signature: FV_SIGNATURE,
        attributes: 0x0004_feff,
        header_length: header_length as u16,
        checksum: 0,
        ext_header_offset: 0,
        reserved: 0,
        revision: 2,
    };
    let block_map = [BlockMapEntry { num_blocks: 1, length: 0x1000 }, BlockMapEntry { num_blocks: 0, length: 0 }];

    let volume = &mut image[0x2000..0x3000];
    volume.fill(0xff);
    volume[..size_of::<VolumeHeader>()].copy_from_slice(header.as_bytes());
    volume[size_of::<VolumeHeader>()..header_length].copy_from_slice(block_map.as_bytes());
    let sum = volume[..header_length]
        .chunks_exact(2)
        .fold(0u16, |sum, word| sum.wrapping_add(u16::from_le_bytes([word[0], word[1]])));
    header.checksum = 0u16.wrapping_sub(sum);
    volume[..size_of::<VolumeHeader>()].copy_from_slice(header.as_bytes());
    image
}
