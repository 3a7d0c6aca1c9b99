use crate::runner::Runner;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const SECTOR_SIZE: u64 = 512;

/// Create a new image file of exactly `sectors` zeroed 512-byte sectors.
///
/// Zeroes are written stripe by stripe rather than via truncation so a full
/// target filesystem fails here, not halfway through replication. A partial
/// file is left behind for inspection.
pub fn create(path: &Path, sectors: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    write_zero_sectors(file, sectors)
        .with_context(|| format!("allocating {} sectors in {}", sectors, path.display()))
}

/// Append `extra_sectors` of zeroes to an existing image.
pub fn extend(path: &Path, extra_sectors: u64) -> Result<()> {
    let file = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("opening {} for extension", path.display()))?;
    write_zero_sectors(file, extra_sectors)
        .with_context(|| format!("extending {} by {} sectors", path.display(), extra_sectors))
}

/// Shorten the image by `shrink_sectors`, delegated to the external
/// truncator.
pub fn truncate_by(runner: &dyn Runner, path: &Path, shrink_sectors: u64) -> Result<()> {
    let reduction = format!("-{}", shrink_sectors * SECTOR_SIZE);
    let path_str = path.display().to_string();
    runner
        .run("truncate", &["-s", reduction.as_str(), path_str.as_str()])
        .with_context(|| format!("truncating {} by {} sectors", path.display(), shrink_sectors))?;
    Ok(())
}

fn write_zero_sectors(file: std::fs::File, sectors: u64) -> Result<()> {
    let zeroes = [0u8; SECTOR_SIZE as usize];
    let mut writer = BufWriter::new(file);
    for _ in 0..sectors {
        writer.write_all(&zeroes)?;
    }
    writer.flush()?;
    Ok(())
}
