use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "/etc/diskmirror.toml";
const DEFAULT_STAGING_DIR: &str = "/tmp/diskmirror";
const DEFAULT_FREE_PERCENT: u32 = 20;

/// Filesystem types the root resize supports.
pub const RESIZABLE_FS_TYPES: &[&str] = &["ext2", "ext3", "ext4"];

/// Mirror the running system into a bootable disk image.
///
/// The image holds a partition table and one filesystem per source
/// partition, ready for a block-imaging writer to restore onto a fresh
/// medium.
#[derive(Parser, Debug)]
#[command(name = "diskmirror", version)]
pub struct Cli {
    /// Path to the image file; its directory must already exist
    pub image: PathBuf,

    /// Create a new image (fails if the file exists)
    #[arg(short = 'c', conflicts_with = "sync")]
    pub create: bool,

    /// Refresh an existing image (the default)
    #[arg(short = 's')]
    pub sync: bool,

    /// Mount the image partitions and exit without replicating
    #[arg(short = 'M', conflicts_with = "create")]
    pub maintenance: bool,

    /// Mount the image's host directory first (needs an fstab entry)
    #[arg(short = 'm')]
    pub mount_host: bool,

    /// Leave loop devices attached for manual detaching
    #[arg(short = 'n', requires = "maintenance")]
    pub no_autoclear: bool,

    /// Resize the image root partition around the free-space band
    #[arg(short = 'r')]
    pub resize: bool,

    /// Echo external commands and stream their output
    #[arg(short = 'd')]
    pub debug: bool,

    /// Step-by-step progress output
    #[arg(short = 'v', conflicts_with = "quiet")]
    pub verbose: bool,

    /// Errors only
    #[arg(short = 'q')]
    pub quiet: bool,

    /// Percent of the root partition to keep free when resizing
    #[arg(short = 'p', long = "free-percent")]
    pub free_percent: Option<u32>,

    /// Extra rsync exclude for the root replication (repeatable)
    #[arg(short = 'e', long = "exclude")]
    pub exclude: Vec<String>,
}

/// Administrator defaults from /etc/diskmirror.toml. Every field is
/// optional; a missing file means all defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub excludes: Vec<String>,
    pub staging_dir: Option<PathBuf>,
    pub free_percent: Option<u32>,
}

impl FileConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub image: PathBuf,
    /// Absolute-resolved image path, excluded from the root replication.
    pub image_resolved: PathBuf,
    pub mode: Mode,
    /// Whether -c/-s was given. A bare `-r` run relaxes the same-disk guard.
    pub explicit_mode: bool,
    pub maintenance: bool,
    pub mount_host: bool,
    pub autoclear: bool,
    pub resize: bool,
    pub debug: bool,
    pub free_percent: u32,
    pub extra_excludes: Vec<String>,
    pub staging_dir: PathBuf,
    verbosity: Verbosity,
}

impl RunConfig {
    pub fn build(cli: Cli, file: FileConfig) -> Result<Self> {
        let free_percent = cli
            .free_percent
            .or(file.free_percent)
            .unwrap_or(DEFAULT_FREE_PERCENT);
        if free_percent >= 100 {
            bail!("free percentage must be below 100, got {}", free_percent);
        }

        let dir = match cli.image.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dir.is_dir() {
            bail!("image directory {} does not exist", dir.display());
        }
        let image_resolved = resolve_image_path(&cli.image, &dir)?;

        let (mode, explicit_mode) = if cli.create {
            (Mode::Create, true)
        } else if cli.sync {
            (Mode::Sync, true)
        } else {
            (Mode::Sync, false)
        };

        let verbosity = if cli.quiet {
            Verbosity::Quiet
        } else if cli.verbose || cli.debug {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        };

        let mut extra_excludes = file.excludes;
        extra_excludes.extend(cli.exclude);

        Ok(Self {
            image: cli.image,
            image_resolved,
            mode,
            explicit_mode,
            maintenance: cli.maintenance,
            mount_host: cli.mount_host,
            autoclear: !cli.no_autoclear,
            resize: cli.resize,
            debug: cli.debug,
            free_percent,
            extra_excludes,
            staging_dir: file
                .staging_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR)),
            verbosity,
        })
    }

    pub fn image_str(&self) -> String {
        self.image.display().to_string()
    }

    /// Normal progress message, suppressed by -q.
    pub fn info(&self, msg: &str) {
        if self.verbosity != Verbosity::Quiet {
            println!("{}", msg);
        }
    }

    /// Detailed step message, shown with -v or -d.
    pub fn step(&self, msg: &str) {
        if self.verbosity == Verbosity::Verbose {
            println!("  {}", msg.dimmed());
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{} {}", "warning:".yellow(), msg);
    }
}

/// The canonical image path even when the file does not exist yet (create
/// mode): resolve the directory and re-append the file name.
fn resolve_image_path(image: &Path, dir: &Path) -> Result<PathBuf> {
    if image.exists() {
        return image
            .canonicalize()
            .with_context(|| format!("resolving {}", image.display()));
    }
    let name = image
        .file_name()
        .with_context(|| format!("{} has no file name", image.display()))?;
    let dir = dir
        .canonicalize()
        .with_context(|| format!("resolving {}", dir.display()))?;
    Ok(dir.join(name))
}

/// Loop attachment, partitioning and mounting all require root.
pub fn ensure_root() -> Result<()> {
    match sudo::check() {
        sudo::RunningAs::Root | sudo::RunningAs::Suid => Ok(()),
        sudo::RunningAs::User => bail!("this program must run as root"),
    }
}
