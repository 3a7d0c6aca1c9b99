//! The image-lifecycle state machine.
//!
//! validate → probe source → choose mode → plan → attach root loop (cleanup
//! armed from here) → resize → format (create) → stage mounts →
//! maintenance stop or replicate → cleanup.

use crate::cleanup::CleanupStack;
use crate::config::{Mode, RunConfig, RESIZABLE_FS_TYPES};
use crate::plan::{self, Decision};
use crate::probe::{self, MountBinding, NETWORK_FS_TYPES};
use crate::ptable::{self, PartitionTable};
use crate::runner::Runner;
use crate::{image, loopdev, resize, sync};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;

pub fn run(cfg: &RunConfig, runner: &dyn Runner, cleanup: &CleanupStack) -> Result<()> {
    // Probe the source disk through the live root filesystem.
    let root_binding = probe::fs_of(runner, "/")?;
    let source_disk = probe::parent_disk(runner, &root_binding.device)?;
    let source_table = ptable::read_device(runner, &source_disk)?;
    if source_table.partitions.len() < 2 {
        bail!(
            "source disk {} has {} partition(s); at least 2 are required",
            source_disk,
            source_table.partitions.len()
        );
    }

    let root_index = source_table
        .partitions
        .iter()
        .position(|p| p.device == root_binding.device)
        .with_context(|| {
            format!(
                "root device {} is not a partition of {}",
                root_binding.device, source_disk
            )
        })?;

    let resize_enabled = resize_enabled(cfg, &source_table, root_index, &root_binding);

    // Optionally bring the image's host directory up before looking for the
    // image file on it.
    let image_dir = image_dir(cfg);
    let image_dir_str = image_dir.display().to_string();
    if cfg.mount_host {
        cfg.info(&format!("mounting {}", image_dir_str));
        runner
            .run("mount", &[image_dir_str.as_str()])
            .with_context(|| format!("mounting {}", image_dir_str))?;
        cleanup.push_host_mount(&image_dir);
    }

    let exists = cfg.image.exists();
    match cfg.mode {
        Mode::Create if exists => bail!("{} already exists; not overwriting", cfg.image_str()),
        Mode::Sync if !exists => bail!("{} does not exist; create it first with -c", cfg.image_str()),
        _ => {}
    }

    check_image_not_on_source_disk(cfg, runner, &image_dir_str, &source_disk, resize_enabled)?;

    let usage = probe::mount_of(runner, "/")?;
    let bindings = probe::mounts(runner)?;

    let image_str = cfg.image_str();
    let image_table = match cfg.mode {
        Mode::Create => {
            let table = if resize_enabled {
                let target = plan::plan_create(usage.used_sectors, cfg.free_percent);
                source_table.resize_root(target)?
            } else {
                source_table.clone()
            };
            let sectors = table.end_sector()?;
            cfg.info(&format!(
                "allocating {} ({})",
                image_str,
                format_size(sectors * image::SECTOR_SIZE)
            ));
            image::create(&cfg.image, sectors)?;
            ptable::write_image(runner, &image_str, &table)?;
            table
        }
        Mode::Sync => {
            let table = ptable::read_device(runner, &image_str)?;
            if table.partitions.len() != source_table.partitions.len() {
                bail!(
                    "{} has {} partitions but the source disk has {}",
                    image_str,
                    table.partitions.len(),
                    source_table.partitions.len()
                );
            }
            table
        }
    };

    let resize_plan = if resize_enabled && cfg.mode == Mode::Sync {
        let current = image_table.partitions[1].size;
        let p = plan::plan_sync(usage.used_sectors, cfg.free_percent, current);
        cfg.step(&format!(
            "resize plan: {:?} (target {}, band {}..{})",
            p.decision, p.target_sectors, p.low_watermark, p.high_watermark
        ));
        Some(p)
    } else {
        None
    };

    // Everything acquired from here on must be released on every exit path.
    cleanup.arm();

    let root_loop = loopdev::next_free(runner)?;
    loopdev::attach(
        runner,
        &root_loop,
        &image_str,
        image_table.partitions[root_index].start * image::SECTOR_SIZE,
        None,
    )?;
    cleanup.push_loop(&root_loop);

    let image_table = match resize_plan {
        Some(p) if p.decision != Decision::Noop => {
            let (table, _) = resize::execute(runner, cfg, cleanup, &image_table, &root_loop, &p)?;
            table
        }
        Some(_) => {
            cfg.info("image root size is inside the hysteresis band; not resizing");
            image_table
        }
        None => image_table,
    };

    if cfg.mode == Mode::Create {
        cfg.info(&format!(
            "formatting image root as {}",
            root_binding.fs_type
        ));
        let mkfs = format!("mkfs.{}", root_binding.fs_type);
        runner
            .run(&mkfs, &[root_loop.as_str()])
            .context("formatting the image root partition")?;
    }

    let staged = sync::stage(
        runner,
        cfg,
        cleanup,
        &image_table,
        &source_table,
        &bindings,
        &root_loop,
        root_index,
    )?;

    if cfg.maintenance {
        print!("{}", sync::maintenance_instructions(cfg, cleanup));
        cleanup.disarm_and_clear();
        return Ok(());
    }

    sync::replicate(runner, cfg, &staged)?;

    cfg.info("cleaning up");
    cleanup.run(runner);
    cfg.info(&format!("{} is up to date", image_str));
    Ok(())
}

/// The resize flag with its soft demotions applied: more than two source
/// partitions, a root that is not the second partition, or a root
/// filesystem resize2fs cannot handle all disable it with a warning.
fn resize_enabled(
    cfg: &RunConfig,
    source_table: &PartitionTable,
    root_index: usize,
    root_binding: &MountBinding,
) -> bool {
    if !cfg.resize {
        return false;
    }
    if source_table.partitions.len() > 2 {
        cfg.warn("resizing is only supported with two partitions; -r disabled");
        return false;
    }
    if root_index != 1 {
        cfg.warn("resizing requires the root to be the second partition; -r disabled");
        return false;
    }
    if !RESIZABLE_FS_TYPES.contains(&root_binding.fs_type.as_str()) {
        cfg.warn(&format!(
            "cannot resize a {} root filesystem; -r disabled",
            root_binding.fs_type
        ));
        return false;
    }
    true
}

/// Refuse to write the image onto the disk being mirrored. Network
/// filesystems are fine, and a bare `-r` run (no `-c`/`-s`) is allowed to
/// resize an image in place wherever it lives.
fn check_image_not_on_source_disk(
    cfg: &RunConfig,
    runner: &dyn Runner,
    image_dir: &str,
    source_disk: &str,
    resize_enabled: bool,
) -> Result<()> {
    let dir_usage = probe::mount_of(runner, image_dir)?;
    let dir_binding = probe::fs_of(runner, &dir_usage.mount_point)?;
    if NETWORK_FS_TYPES.contains(&dir_binding.fs_type.as_str()) {
        return Ok(());
    }
    if !dir_binding.device.starts_with("/dev/") {
        // tmpfs and friends have no disk to collide with.
        return Ok(());
    }
    let dir_disk = probe::parent_disk(runner, &dir_binding.device)?;
    if dir_disk == source_disk {
        if resize_enabled && !cfg.explicit_mode {
            cfg.warn(&format!(
                "{} lives on the source disk; continuing for the resize only",
                cfg.image_str()
            ));
            return Ok(());
        }
        bail!(
            "{} lives on the source disk {}; choose a different target",
            cfg.image_str(),
            source_disk
        );
    }
    Ok(())
}

fn image_dir(cfg: &RunConfig) -> PathBuf {
    match cfg.image.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
