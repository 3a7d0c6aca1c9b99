use crate::runner::{Runner, SystemRunner};
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
enum Teardown {
    Mount(PathBuf),
    Loop { device: String, autoclear: bool },
    HostMount(PathBuf),
}

#[derive(Default)]
struct State {
    armed: bool,
    finished: bool,
    items: Vec<Teardown>,
}

/// Every mount and loop device acquired during a run, registered the moment
/// it is acquired. The stack is the sole releaser: normal exit, error exit,
/// and the interrupt handler all funnel into [`CleanupStack::run`].
#[derive(Clone, Default)]
pub struct CleanupStack {
    state: Arc<Mutex<State>>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Arm the interrupt path. Called immediately before the first loop
    /// device is attached.
    pub fn arm(&self) {
        self.lock().armed = true;
    }

    /// Hand every registered resource over to the operator: nothing will be
    /// released on exit or interrupt from now on.
    pub fn disarm_and_clear(&self) {
        let mut st = self.lock();
        st.armed = false;
        st.finished = true;
        st.items.clear();
    }

    pub fn push_mount(&self, path: &Path) {
        self.lock().items.push(Teardown::Mount(path.to_path_buf()));
    }

    /// Remove a mount entry again after unmounting it in-line (the shrink
    /// re-measure mount).
    pub fn pop_mount(&self, path: &Path) {
        self.lock()
            .items
            .retain(|t| !matches!(t, Teardown::Mount(p) if p == path));
    }

    pub fn push_loop(&self, device: &str) {
        self.lock().items.push(Teardown::Loop {
            device: device.to_string(),
            autoclear: false,
        });
    }

    /// Record that the kernel will release this device on its final umount,
    /// so cleanup must not detach it again.
    pub fn mark_autoclear(&self, device: &str) {
        for item in self.lock().items.iter_mut() {
            if let Teardown::Loop {
                device: d,
                autoclear,
            } = item
            {
                if d == device {
                    *autoclear = true;
                }
            }
        }
    }

    pub fn push_host_mount(&self, path: &Path) {
        self.lock()
            .items
            .push(Teardown::HostMount(path.to_path_buf()));
    }

    /// Registered mount points, deepest first. Used for the maintenance-mode
    /// printout.
    pub fn mounts_deepest_first(&self) -> Vec<PathBuf> {
        let mut mounts: Vec<PathBuf> = self
            .lock()
            .items
            .iter()
            .filter_map(|t| match t {
                Teardown::Mount(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        mounts.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        mounts
    }

    /// Registered loop devices, most recent first.
    pub fn loops(&self) -> Vec<String> {
        self.lock()
            .items
            .iter()
            .rev()
            .filter_map(|t| match t {
                Teardown::Loop { device, .. } => Some(device.clone()),
                _ => None,
            })
            .collect()
    }

    /// Release everything. Best effort: a failed umount is reported but does
    /// not stop the remaining teardown. Safe to call more than once.
    pub fn run(&self, runner: &dyn Runner) {
        let items = {
            let mut st = self.lock();
            if st.finished {
                return;
            }
            st.finished = true;
            std::mem::take(&mut st.items)
        };
        if items.is_empty() {
            return;
        }

        // Flush page cache before tearing the mounts down.
        if let Err(e) = runner.run("sync", &[]) {
            eprintln!("{} sync failed: {}", "warning:".yellow(), e);
        }

        let mut mounts = Vec::new();
        let mut loops = Vec::new();
        let mut host_mounts = Vec::new();
        for item in items {
            match item {
                Teardown::Mount(p) => mounts.push(p),
                Teardown::Loop { device, autoclear } => {
                    if !autoclear {
                        loops.push(device);
                    }
                }
                Teardown::HostMount(p) => host_mounts.push(p),
            }
        }

        mounts.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for mount in mounts {
            let path = mount.display().to_string();
            if let Err(e) = runner.run("umount", &[path.as_str()]) {
                eprintln!("{} could not unmount {}: {}", "warning:".yellow(), path, e);
            }
        }

        for device in loops.into_iter().rev() {
            if let Err(e) = runner.run("losetup", &["--detach", device.as_str()]) {
                eprintln!("{} could not detach {}: {}", "warning:".yellow(), device, e);
            }
        }

        for mount in host_mounts {
            let path = mount.display().to_string();
            if let Err(e) = runner.run("umount", &[path.as_str()]) {
                eprintln!("{} could not unmount {}: {}", "warning:".yellow(), path, e);
            }
        }
    }

    /// Run teardown from the interrupt handler and exit non-zero. Signals
    /// arriving before [`arm`](Self::arm) simply abort.
    pub fn install_signal_handler(&self, debug: bool) -> Result<()> {
        let stack = self.clone();
        ctrlc::set_handler(move || {
            eprintln!("\n{}", "interrupted, cleaning up...".red());
            let armed = stack.lock().armed;
            if armed {
                stack.run(&SystemRunner::new(debug));
            }
            std::process::exit(1);
        })
        .context("installing the interrupt handler")
    }
}
