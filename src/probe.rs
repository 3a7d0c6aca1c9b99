use crate::runner::Runner;
use anyhow::{bail, Context, Result};

/// Sectors per 1K block reported by `df -k`.
const SECTORS_PER_KBLOCK: u64 = 2;

/// Filesystem types never treated as replication sources.
pub const IGNORED_FS_TYPES: &[&str] = &["autofs"];

/// Network filesystem types the image file may live on.
pub const NETWORK_FS_TYPES: &[&str] = &["nfs", "nfs3", "nfs4", "smb"];

/// A live mount: which device is mounted where, and as what.
#[derive(Debug, Clone, PartialEq)]
pub struct MountBinding {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
}

/// Disk usage of one mounted filesystem, in sectors.
#[derive(Debug, Clone)]
pub struct Usage {
    pub mount_point: String,
    pub total_sectors: u64,
    pub used_sectors: u64,
}

/// All current mounts, minus ignored filesystem types.
pub fn mounts(runner: &dyn Runner) -> Result<Vec<MountBinding>> {
    let out = runner
        .run_capture("mount", &[])
        .context("reading the mount table")?;
    Ok(parse_mount_table(&out))
}

/// The device and filesystem type mounted at exactly `mount_point`.
///
/// The mount table is scanned last-entry-wins: with stacked mounts the most
/// recent one is the visible filesystem.
pub fn fs_of(runner: &dyn Runner, mount_point: &str) -> Result<MountBinding> {
    let all = mounts(runner)?;
    all.into_iter()
        .rev()
        .find(|m| m.mount_point == mount_point)
        .with_context(|| format!("nothing is mounted at {}", mount_point))
}

/// Where (and as what) the given device is mounted.
pub fn mountpoint_for(runner: &dyn Runner, device: &str) -> Result<MountBinding> {
    let all = mounts(runner)?;
    all.into_iter()
        .rev()
        .find(|m| m.device == device)
        .with_context(|| format!("{} is not mounted", device))
}

/// The mount carrying `path`, with total and used space in sectors.
pub fn mount_of(runner: &dyn Runner, path: &str) -> Result<Usage> {
    let out = runner
        .run_capture("df", &["-k", path])
        .with_context(|| format!("querying disk usage of {}", path))?;
    parse_df(&out).with_context(|| format!("parsing df output for {}", path))
}

/// Resolve the whole-disk node for a device. A whole disk resolves to itself.
pub fn parent_disk(runner: &dyn Runner, device: &str) -> Result<String> {
    let out = runner
        .run_capture("lsblk", &["-no", "pkname", device])
        .with_context(|| format!("looking up the parent disk of {}", device))?;
    let name = out.trim();
    if name.is_empty() {
        // No parent: the device already is a whole disk.
        return Ok(device.to_string());
    }
    // lsblk may list one row per child; the parent name is the same on each.
    let first = name.lines().next().unwrap_or(name).trim();
    Ok(format!("/dev/{}", first))
}

/// Parse `mount` output lines of the form `DEV on MP type FS (options)`.
pub fn parse_mount_table(text: &str) -> Vec<MountBinding> {
    text.lines()
        .filter_map(parse_mount_line)
        .filter(|m| !IGNORED_FS_TYPES.contains(&m.fs_type.as_str()))
        .collect()
}

fn parse_mount_line(line: &str) -> Option<MountBinding> {
    let (device, rest) = line.split_once(" on ")?;
    let (mount_point, rest) = rest.rsplit_once(" type ")?;
    let fs_type = rest.split_whitespace().next()?;
    Some(MountBinding {
        device: device.to_string(),
        mount_point: mount_point.to_string(),
        fs_type: fs_type.to_string(),
    })
}

/// Parse `df -k` output. The data row may be wrapped onto a second line when
/// the device name is long; in that case the row has five fields instead of
/// six.
fn parse_df(text: &str) -> Result<Usage> {
    let line = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .context("df produced no output")?;

    let fields: Vec<&str> = line.split_whitespace().collect();
    let (total, used, mount_point) = match fields.len() {
        6 => (fields[1], fields[2], fields[5]),
        5 => (fields[0], fields[1], fields[4]),
        _ => bail!("unexpected df line: {}", line),
    };

    let total: u64 = total.parse().context("df total is not a number")?;
    let used: u64 = used.parse().context("df used is not a number")?;
    Ok(Usage {
        mount_point: mount_point.to_string(),
        total_sectors: total * SECTORS_PER_KBLOCK,
        used_sectors: used * SECTORS_PER_KBLOCK,
    })
}
