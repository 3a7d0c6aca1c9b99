use crate::cleanup::CleanupStack;
use crate::config::{Mode, RunConfig};
use crate::probe::MountBinding;
use crate::ptable::PartitionTable;
use crate::runner::Runner;
use crate::loopdev;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// One image filesystem mounted under the staging tree.
#[derive(Debug, Clone)]
pub struct StagedFs {
    pub loop_device: String,
    pub source_mount: String,
    pub staging_path: PathBuf,
    pub fs_type: String,
}

/// Mount a device, creating the mount point first.
pub fn mount_device(runner: &dyn Runner, device: &str, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating mount point {}", dir.display()))?;
    let dir_str = dir.display().to_string();
    runner
        .run("mount", &[device, dir_str.as_str()])
        .with_context(|| format!("mounting {} at {}", device, dir.display()))?;
    Ok(())
}

pub fn unmount(runner: &dyn Runner, dir: &Path) -> Result<()> {
    let dir_str = dir.display().to_string();
    runner
        .run("umount", &[dir_str.as_str()])
        .with_context(|| format!("unmounting {}", dir.display()))?;
    Ok(())
}

/// Attach and mount every image partition with a live source counterpart.
///
/// The root filesystem is mounted first (at the staging root), the rest in
/// partition-table order beneath it. In create mode each non-root partition
/// is formatted with the filesystem type its source uses; the root was
/// already formatted before this runs. Mounted loops are marked autoclear
/// unless suppressed, so the cleanup umounts release them.
#[allow(clippy::too_many_arguments)]
pub fn stage(
    runner: &dyn Runner,
    cfg: &RunConfig,
    cleanup: &CleanupStack,
    image_table: &PartitionTable,
    source_table: &PartitionTable,
    bindings: &[MountBinding],
    root_loop: &str,
    root_index: usize,
) -> Result<Vec<StagedFs>> {
    let image_str = cfg.image_str();
    let mut staged = Vec::new();

    // Root first: every other staging path lives beneath it.
    let root_binding = binding_for(bindings, &source_table.partitions[root_index].device)
        .context("the root partition is not in the mount table")?;
    cfg.step(&format!("mounting image root at {}", cfg.staging_dir.display()));
    mount_device(runner, root_loop, &cfg.staging_dir)?;
    cleanup.push_mount(&cfg.staging_dir);
    if cfg.autoclear {
        loopdev::set_autoclear(runner, root_loop)?;
        cleanup.mark_autoclear(root_loop);
    }
    staged.push(StagedFs {
        loop_device: root_loop.to_string(),
        source_mount: root_binding.mount_point.clone(),
        staging_path: cfg.staging_dir.clone(),
        fs_type: root_binding.fs_type.clone(),
    });

    for (index, source_part) in source_table.partitions.iter().enumerate() {
        if index == root_index {
            continue;
        }
        let Some(binding) = binding_for(bindings, &source_part.device) else {
            continue; // not mounted, nothing to replicate
        };

        let image_part = &image_table.partitions[index];
        let device = loopdev::next_free(runner)?;
        loopdev::attach(
            runner,
            &device,
            &image_str,
            image_part.start * crate::image::SECTOR_SIZE,
            Some(image_part.size * crate::image::SECTOR_SIZE),
        )?;
        cleanup.push_loop(&device);

        if cfg.mode == Mode::Create {
            cfg.step(&format!(
                "formatting {} as {}",
                binding.mount_point, binding.fs_type
            ));
            let mkfs = format!("mkfs.{}", binding.fs_type);
            runner
                .run(&mkfs, &[device.as_str()])
                .with_context(|| format!("formatting the image {} partition", binding.mount_point))?;
        }

        let staging_path = staging_path_for(&cfg.staging_dir, &binding.mount_point)?;
        cfg.step(&format!(
            "mounting image {} at {}",
            binding.mount_point,
            staging_path.display()
        ));
        mount_device(runner, &device, &staging_path)?;
        cleanup.push_mount(&staging_path);
        if cfg.autoclear {
            loopdev::set_autoclear(runner, &device)?;
            cleanup.mark_autoclear(&device);
        }

        staged.push(StagedFs {
            loop_device: device,
            source_mount: binding.mount_point.clone(),
            staging_path,
            fs_type: binding.fs_type.clone(),
        });
    }

    Ok(staged)
}

/// Replicate every staged filesystem, root first.
pub fn replicate(runner: &dyn Runner, cfg: &RunConfig, staged: &[StagedFs]) -> Result<()> {
    for fs in staged {
        cfg.info(&format!("replicating {}", fs.source_mount));
        let args = rsync_args(cfg, fs);
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        runner
            .run("rsync", &argv)
            .with_context(|| format!("replicating {}", fs.source_mount))?;
    }
    Ok(())
}

fn rsync_args(cfg: &RunConfig, fs: &StagedFs) -> Vec<String> {
    let mut args: Vec<String> = [
        "--archive",
        "--one-file-system",
        "--devices",
        "--hard-links",
        "--partial",
        "--numeric-ids",
        "--delete",
        "--force",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if cfg.debug {
        args.push("--verbose".to_string());
    }

    if fs.source_mount == "/" {
        args.push(format!("--exclude={}", cfg.image_resolved.display()));
        args.push("--exclude=/tmp".to_string());
        args.push("--exclude=lost+found".to_string());
        for exclude in &cfg.extra_excludes {
            args.push(format!("--exclude={}", exclude));
        }
    }

    let source = if fs.source_mount == "/" {
        "/".to_string()
    } else {
        format!("{}/", fs.source_mount)
    };
    args.push(source);
    args.push(fs.staging_path.display().to_string());
    args
}

/// The instructions printed in maintenance mode: how to take the staged
/// tree down by hand.
pub fn maintenance_instructions(cfg: &RunConfig, cleanup: &CleanupStack) -> String {
    let mut out = format!(
        "image filesystems are mounted under {}\nwhen finished, run:\n",
        cfg.staging_dir.display()
    );
    for mount in cleanup.mounts_deepest_first() {
        out.push_str(&format!("  umount {}\n", mount.display()));
    }
    if !cfg.autoclear {
        for device in cleanup.loops() {
            out.push_str(&format!("  losetup -d {}\n", device));
        }
    }
    out
}

fn binding_for<'a>(bindings: &'a [MountBinding], device: &str) -> Option<&'a MountBinding> {
    bindings.iter().rev().find(|b| b.device == device)
}

fn staging_path_for(staging_dir: &Path, mount_point: &str) -> Result<PathBuf> {
    let relative = mount_point.trim_start_matches('/');
    if relative.is_empty() {
        bail!("nested root mount point");
    }
    Ok(staging_dir.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cli, FileConfig};
    use crate::runner::testing::ScriptedRunner;
    use clap::Parser;

    const SOURCE_DUMP: &str = "\
label: dos
label-id: 0x21c8a1e6
device: /dev/mmcblk0
unit: sectors

/dev/mmcblk0p1 : start=        8192, size=      524288, type=c
/dev/mmcblk0p2 : start=      532480, size=     5000000, type=83
";

    fn bindings() -> Vec<MountBinding> {
        vec![
            MountBinding {
                device: "/dev/mmcblk0p2".to_string(),
                mount_point: "/".to_string(),
                fs_type: "ext4".to_string(),
            },
            MountBinding {
                device: "/dev/mmcblk0p1".to_string(),
                mount_point: "/boot".to_string(),
                fs_type: "vfat".to_string(),
            },
        ]
    }

    fn config(extra_args: &[&str]) -> (tempfile::TempDir, RunConfig) {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("pi.img");
        std::fs::write(&image, b"").unwrap();
        let staging = dir.path().join("staging");
        let mut argv = vec!["diskmirror".to_string()];
        argv.extend(extra_args.iter().map(|s| s.to_string()));
        argv.push(image.display().to_string());
        let cli = Cli::parse_from(argv);
        let file = FileConfig {
            staging_dir: Some(staging),
            ..Default::default()
        };
        let cfg = RunConfig::build(cli, file).unwrap();
        (dir, cfg)
    }

    #[test]
    fn stage_mounts_root_first_then_formats_and_mounts_boot() {
        let (_dir, cfg) = config(&["-c"]);
        let table = PartitionTable::parse(SOURCE_DUMP).unwrap();
        let runner = ScriptedRunner::new();
        runner.expect_output("losetup", "/dev/loop1\n");

        let cleanup = CleanupStack::new();
        let staged = stage(
            &runner,
            &cfg,
            &cleanup,
            &table,
            &table,
            &bindings(),
            "/dev/loop0",
            1,
        )
        .unwrap();

        assert_eq!(staged.len(), 2);
        assert_eq!(staged[0].source_mount, "/");
        assert_eq!(staged[0].staging_path, cfg.staging_dir);
        assert_eq!(staged[1].source_mount, "/boot");
        assert_eq!(staged[1].staging_path, cfg.staging_dir.join("boot"));

        let lines = runner.command_lines();
        let pos = |needle: &str| {
            lines
                .iter()
                .position(|l| l.contains(needle))
                .unwrap_or_else(|| panic!("missing command: {needle}"))
        };
        assert!(pos("mount /dev/loop0") < pos("losetup --find"));
        assert!(pos("losetup -o") < pos("mkfs.vfat /dev/loop1"));
        assert!(pos("mkfs.vfat /dev/loop1") < pos("mount /dev/loop1"));
        // Boot partition is attached with offset and limit in bytes.
        assert!(lines.iter().any(|l| l.contains(&format!(
            "losetup -o {} --sizelimit {}",
            8192u64 * 512,
            524288u64 * 512
        ))));
        // Both loops were marked autoclear while mounted.
        assert!(lines.iter().any(|l| l == "losetup --detach /dev/loop0"));
        assert!(lines.iter().any(|l| l == "losetup --detach /dev/loop1"));
    }

    #[test]
    fn stage_in_sync_mode_formats_nothing() {
        let (_dir, cfg) = config(&["-s"]);
        let table = PartitionTable::parse(SOURCE_DUMP).unwrap();
        let runner = ScriptedRunner::new();
        runner.expect_output("losetup", "/dev/loop1\n");

        stage(
            &runner,
            &cfg,
            &CleanupStack::new(),
            &table,
            &table,
            &bindings(),
            "/dev/loop0",
            1,
        )
        .unwrap();

        assert!(runner
            .command_lines()
            .iter()
            .all(|l| !l.starts_with("mkfs")));
    }

    #[test]
    fn unmounted_partition_is_skipped() {
        let (_dir, cfg) = config(&["-s"]);
        let table = PartitionTable::parse(SOURCE_DUMP).unwrap();
        let runner = ScriptedRunner::new();
        let only_root = vec![bindings()[0].clone()];

        let staged = stage(
            &runner,
            &cfg,
            &CleanupStack::new(),
            &table,
            &table,
            &only_root,
            "/dev/loop0",
            1,
        )
        .unwrap();

        assert_eq!(staged.len(), 1);
        assert!(runner
            .command_lines()
            .iter()
            .all(|l| !l.contains("--find")));
    }

    #[test]
    fn root_replication_carries_the_full_exclusion_set() {
        let (_dir, cfg) = config(&["-s", "-e", "/srv/media"]);
        let root = StagedFs {
            loop_device: "/dev/loop0".to_string(),
            source_mount: "/".to_string(),
            staging_path: cfg.staging_dir.clone(),
            fs_type: "ext4".to_string(),
        };

        let args = rsync_args(&cfg, &root);
        assert_eq!(
            &args[..8],
            &[
                "--archive",
                "--one-file-system",
                "--devices",
                "--hard-links",
                "--partial",
                "--numeric-ids",
                "--delete",
                "--force",
            ]
        );
        assert!(args.contains(&format!("--exclude={}", cfg.image_resolved.display())));
        assert!(args.contains(&"--exclude=/tmp".to_string()));
        assert!(args.contains(&"--exclude=lost+found".to_string()));
        assert!(args.contains(&"--exclude=/srv/media".to_string()));
        assert_eq!(args[args.len() - 2], "/");
        assert_eq!(
            args[args.len() - 1],
            cfg.staging_dir.display().to_string()
        );
    }

    #[test]
    fn non_root_replication_has_no_excludes_and_trailing_slash() {
        let (_dir, cfg) = config(&["-s", "-e", "/srv/media"]);
        let boot = StagedFs {
            loop_device: "/dev/loop1".to_string(),
            source_mount: "/boot".to_string(),
            staging_path: cfg.staging_dir.join("boot"),
            fs_type: "vfat".to_string(),
        };

        let args = rsync_args(&cfg, &boot);
        assert!(args.iter().all(|a| !a.starts_with("--exclude")));
        assert_eq!(args[args.len() - 2], "/boot/");
    }

    #[test]
    fn replicate_runs_root_before_others() {
        let (_dir, cfg) = config(&["-s"]);
        let staged = vec![
            StagedFs {
                loop_device: "/dev/loop0".to_string(),
                source_mount: "/".to_string(),
                staging_path: cfg.staging_dir.clone(),
                fs_type: "ext4".to_string(),
            },
            StagedFs {
                loop_device: "/dev/loop1".to_string(),
                source_mount: "/boot".to_string(),
                staging_path: cfg.staging_dir.join("boot"),
                fs_type: "vfat".to_string(),
            },
        ];

        let runner = ScriptedRunner::new();
        replicate(&runner, &cfg, &staged).unwrap();
        let lines = runner.command_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(&cfg.staging_dir.display().to_string()));
        assert!(lines[1].ends_with(&cfg.staging_dir.join("boot").display().to_string()));
    }

    #[test]
    fn maintenance_instructions_list_umounts_and_loops() {
        let (_dir, cfg) = config(&["-M", "-n"]);
        let cleanup = CleanupStack::new();
        cleanup.push_loop("/dev/loop0");
        cleanup.push_mount(&cfg.staging_dir);
        cleanup.push_loop("/dev/loop1");
        cleanup.push_mount(&cfg.staging_dir.join("boot"));

        let text = maintenance_instructions(&cfg, &cleanup);
        let boot = cfg.staging_dir.join("boot");
        let lines: Vec<&str> = text.lines().collect();
        let umount_boot = lines
            .iter()
            .position(|l| l.trim() == format!("umount {}", boot.display()))
            .unwrap();
        let umount_root = lines
            .iter()
            .position(|l| l.trim() == format!("umount {}", cfg.staging_dir.display()))
            .unwrap();
        assert!(umount_boot < umount_root);
        assert!(text.contains("losetup -d /dev/loop0"));
        assert!(text.contains("losetup -d /dev/loop1"));
    }

    #[test]
    fn maintenance_instructions_omit_loops_when_autoclear() {
        let (_dir, cfg) = config(&["-M"]);
        let cleanup = CleanupStack::new();
        cleanup.push_loop("/dev/loop0");
        cleanup.push_mount(&cfg.staging_dir);

        let text = maintenance_instructions(&cfg, &cleanup);
        assert!(text.contains("umount"));
        assert!(!text.contains("losetup -d"));
    }
}
