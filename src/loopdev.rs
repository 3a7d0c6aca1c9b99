use crate::runner::Runner;
use anyhow::{Context, Result};

/// Ask the loop allocator for an unused device node.
pub fn next_free(runner: &dyn Runner) -> Result<String> {
    let out = runner
        .run_capture("losetup", &["--find"])
        .context("finding a free loop device")?;
    let device = out.trim().to_string();
    if device.is_empty() {
        anyhow::bail!("losetup --find returned no device");
    }
    Ok(device)
}

/// Bind `device` to a byte range of the image file.
///
/// The size limit is mandatory for non-root partitions; the root partition
/// is attached without one so the device can follow the file through a
/// resize (capacity is refreshed explicitly with `reread`).
pub fn attach(
    runner: &dyn Runner,
    device: &str,
    image: &str,
    offset_bytes: u64,
    size_limit_bytes: Option<u64>,
) -> Result<()> {
    let offset = offset_bytes.to_string();
    let mut args = vec!["-o", offset.as_str()];
    let limit;
    if let Some(bytes) = size_limit_bytes {
        limit = bytes.to_string();
        args.push("--sizelimit");
        args.push(limit.as_str());
    }
    args.push(device);
    args.push(image);
    runner
        .run("losetup", &args)
        .with_context(|| format!("attaching {} to {}", device, image))?;
    Ok(())
}

/// Refresh the device's capacity after the backing file grew or shrank.
pub fn reread(runner: &dyn Runner, device: &str) -> Result<()> {
    runner
        .run("losetup", &["--set-capacity", device])
        .with_context(|| format!("re-reading the capacity of {}", device))?;
    Ok(())
}

/// Schedule the device for release when its last mount drops.
///
/// Detaching a loop device that is still mounted does not release it; the
/// kernel sets the autoclear flag instead and frees the device on the final
/// umount. Must only be called while the device is mounted.
pub fn set_autoclear(runner: &dyn Runner, device: &str) -> Result<()> {
    runner
        .run("losetup", &["--detach", device])
        .with_context(|| format!("marking {} autoclear", device))?;
    Ok(())
}

/// Release the device immediately. Must only be called while unmounted.
pub fn detach(runner: &dyn Runner, device: &str) -> Result<()> {
    runner
        .run("losetup", &["--detach", device])
        .with_context(|| format!("detaching {}", device))?;
    Ok(())
}
