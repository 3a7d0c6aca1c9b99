//! Root-partition resize execution.
//!
//! The orderings here are load-bearing: a filesystem must never extend past
//! its partition, and a partition must never extend past the image file.
//! Growing therefore works outside-in (file, table, filesystem) and
//! shrinking inside-out (filesystem, file, table).

use crate::cleanup::CleanupStack;
use crate::config::RunConfig;
use crate::plan::{Decision, ResizePlan};
use crate::ptable::PartitionTable;
use crate::runner::{CommandError, Runner};
use crate::{image, loopdev, probe, sync};
use anyhow::{Context, Result};

/// Index of the root partition; resizing is only supported for the
/// two-partition boot/root layout.
const ROOT: usize = 1;

/// Refusal margin: a shrink leaving less than 5% free inside the image is
/// demoted to a no-op.
fn min_size_for(used_sectors: u64) -> u64 {
    used_sectors * 21 / 20
}

/// Apply the plan to the image root. Returns the resulting table and what
/// was actually performed (a tentative shrink may demote to `Noop`).
pub fn execute(
    runner: &dyn Runner,
    cfg: &RunConfig,
    cleanup: &CleanupStack,
    table: &PartitionTable,
    root_loop: &str,
    plan: &ResizePlan,
) -> Result<(PartitionTable, Decision)> {
    match plan.decision {
        Decision::Noop => Ok((table.clone(), Decision::Noop)),
        Decision::Grow => grow(runner, cfg, table, root_loop, plan.target_sectors),
        Decision::Shrink => shrink(runner, cfg, cleanup, table, root_loop, plan.target_sectors),
    }
}

fn grow(
    runner: &dyn Runner,
    cfg: &RunConfig,
    table: &PartitionTable,
    root_loop: &str,
    target: u64,
) -> Result<(PartitionTable, Decision)> {
    let current = table.partitions[ROOT].size;
    cfg.info(&format!(
        "growing image root from {} to {} sectors",
        current, target
    ));

    cfg.step("extending the image file");
    image::extend(&cfg.image, target - current)?;

    cfg.step("rewriting the partition table");
    let table = table.resize_root(target)?;
    crate::ptable::write_image(runner, &cfg.image_str(), &table)?;
    loopdev::reread(runner, root_loop)?;

    cfg.step("checking the filesystem");
    fsck(runner, &["-fy", root_loop])?;

    cfg.step("growing the filesystem");
    let size = format!("{}s", target);
    runner
        .run("resize2fs", &[root_loop, size.as_str()])
        .context("growing the root filesystem")?;
    loopdev::reread(runner, root_loop)?;

    // A second, size-less pass takes the filesystem to the device limit and
    // consolidates reserved superblocks.
    runner
        .run("resize2fs", &[root_loop])
        .context("finishing the root filesystem resize")?;
    fsck(runner, &["-pf", root_loop])?;

    Ok((table, Decision::Grow))
}

fn shrink(
    runner: &dyn Runner,
    cfg: &RunConfig,
    cleanup: &CleanupStack,
    table: &PartitionTable,
    root_loop: &str,
    target: u64,
) -> Result<(PartitionTable, Decision)> {
    let current = table.partitions[ROOT].size;

    // The planner worked from live usage; the image still holds the previous
    // replication. Measure from within the image before cutting it down.
    cfg.step("measuring usage inside the image root");
    sync::mount_device(runner, root_loop, &cfg.staging_dir)?;
    cleanup.push_mount(&cfg.staging_dir);
    let measured = probe::mount_of(runner, &cfg.staging_dir.display().to_string());
    let unmounted = sync::unmount(runner, &cfg.staging_dir);
    if unmounted.is_ok() {
        // A failed umount stays registered so cleanup retries it.
        cleanup.pop_mount(&cfg.staging_dir);
    }
    let measured = measured?;
    unmounted?;

    if min_size_for(measured.used_sectors) >= target {
        cfg.info(&format!(
            "not shrinking: image root holds {} sectors, too close to the {}-sector target",
            measured.used_sectors, target
        ));
        return Ok((table.clone(), Decision::Noop));
    }

    cfg.info(&format!(
        "shrinking image root from {} to {} sectors",
        current, target
    ));

    cfg.step("checking the filesystem");
    fsck(runner, &["-fy", root_loop])?;

    cfg.step("shrinking the filesystem");
    let size = format!("{}s", target);
    runner
        .run("resize2fs", &[root_loop, size.as_str()])
        .context("shrinking the root filesystem")?;

    cfg.step("truncating the image file");
    image::truncate_by(runner, &cfg.image, current - target)?;

    cfg.step("rewriting the partition table");
    let table = table.resize_root(target)?;
    crate::ptable::write_image(runner, &cfg.image_str(), &table)?;
    loopdev::reread(runner, root_loop)?;

    runner
        .run("resize2fs", &[root_loop])
        .context("finishing the root filesystem resize")?;
    fsck(runner, &["-pf", root_loop])?;

    Ok((table, Decision::Shrink))
}

/// fsck exits 1 after correcting errors; only codes above 1 are failures.
fn fsck(runner: &dyn Runner, args: &[&str]) -> Result<()> {
    match runner.run("fsck", args) {
        Ok(()) => Ok(()),
        Err(CommandError::Failed { code: 1, .. }) => Ok(()),
        Err(e) => Err(e).context("filesystem check failed"),
    }
}
