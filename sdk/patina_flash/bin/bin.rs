//! Executable for decomposing and rebuilding Intel flash images.
//!
//! ```text
//! flash_util parse <rom> [--warn]
//! flash_util extract <rom> <dir> [--warn] [--force]
//! flash_util assemble <dir> <rom>
//! ```
//!
//! Logging goes to stderr at `info` unless `RUST_LOG` says otherwise.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use clap::{Parser, Subcommand};
use patina_flash::{manifest, FirmwareNode, FlashError, FlashImage};
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::ExitCode,
};

#[derive(Parser, Debug)]
#[command(about = "Decompose and rebuild Intel flash images")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a flash image and print its JSON summary to stdout.
    Parse {
        /// Flash image to read.
        rom: PathBuf,
        /// Report validation errors but print the summary anyway.
        #[arg(long, default_value_t = false)]
        warn: bool,
    },
    /// Extract a flash image into a directory tree with a JSON summary.
    Extract {
        /// Flash image to read.
        rom: PathBuf,
        /// Directory to extract into.
        dir: PathBuf,
        /// Report validation errors but extract anyway.
        #[arg(long, default_value_t = false)]
        warn: bool,
        /// Extract into a directory that is not empty.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Assemble a flash image from an extracted directory tree.
    Assemble {
        /// Directory holding the summary and payloads.
        dir: PathBuf,
        /// Flash image to write.
        rom: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let result = match Args::parse().command {
        Command::Parse { rom, warn } => parse(&rom, warn),
        Command::Extract { rom, dir, warn, force } => extract(&rom, &dir, warn, force),
        Command::Assemble { dir, rom } => assemble(&dir, &rom),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn load(rom: &Path) -> Result<FlashImage, FlashError> {
    let buf = fs::read(rom).map_err(|source| FlashError::Io { path: rom.to_path_buf(), source })?;
    FlashImage::parse(&buf)
}

/// Log every validation error and return how many there were. Fails unless `warn` is set.
fn check(image: &FlashImage, warn: bool) -> Result<usize, FlashError> {
    let errs = image.validate(&());
    for err in &errs {
        log::warn!("Error found: {err}");
    }
    if !errs.is_empty() && !warn {
        return Err(validation_failed(errs.len()));
    }
    Ok(errs.len())
}

/// `--warn` lets the command finish its output, but errors found along the way still fail it.
fn outcome(count: usize) -> Result<(), FlashError> {
    match count {
        0 => Ok(()),
        _ => Err(validation_failed(count)),
    }
}

fn validation_failed(count: usize) -> FlashError {
    FlashError::Structural(format!("{count} validation errors, use --warn to continue"))
}

fn parse(rom: &Path, warn: bool) -> Result<(), FlashError> {
    let image = load(rom)?;
    let count = check(&image, warn)?;
    println!("{}", manifest::to_json(&image)?);
    outcome(count)
}

fn extract(rom: &Path, dir: &Path, warn: bool, force: bool) -> Result<(), FlashError> {
    if !force {
        match fs::read_dir(dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Err(FlashError::Structural(
                        "Existing directory not empty, use --force to override".to_string(),
                    ));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(FlashError::Io { path: dir.to_path_buf(), source }),
        }
    }

    let mut image = load(rom)?;
    let count = check(&image, warn)?;
    image.extract(dir)?;
    outcome(count)
}

fn assemble(dir: &Path, rom: &Path) -> Result<(), FlashError> {
    let mut image = manifest::read(dir)?;
    let buf = image.assemble()?;
    fs::write(rom, &buf).map_err(|source| FlashError::Io { path: rom.to_path_buf(), source })?;
    log::info!("wrote {}", rom.display());
    Ok(())
}
