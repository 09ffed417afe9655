//! Decomposition of Intel flash images.
//!
//! A flash image is parsed into a tree of nodes: the flash descriptor (region directory), the regions it
//! places, the firmware volumes inside the BIOS region, and padding for every byte nothing else claims. The
//! tree can be validated, extracted into a directory of payload files plus a JSON manifest, and assembled
//! back into a byte-identical image from that directory.
//!
//! ```no_run
//! use patina_flash::{FirmwareNode, FlashImage};
//! # fn main() -> Result<(), patina_flash::FlashError> {
//! let rom = std::fs::read("image.rom").unwrap();
//! let mut image = FlashImage::parse(&rom)?;
//! for err in image.validate(&()) {
//!     log::warn!("{err}");
//! }
//! image.extract(std::path::Path::new("out"))?;
//!
//! let mut restored = patina_flash::manifest::read(std::path::Path::new("out"))?;
//! assert_eq!(restored.assemble()?, rom);
//! # Ok(())
//! # }
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
pub mod descriptor;
pub mod err;
pub mod flash;
pub mod manifest;
pub mod node;
pub mod padding;
pub mod region;
pub mod volume;

#[cfg(test)]
mod test_support;

pub use err::FlashError;
pub use flash::FlashImage;
pub use node::FirmwareNode;
pub use region::{Region, RegionKind};
