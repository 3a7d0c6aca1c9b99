use colored::Colorize;
use std::io::Write;
use std::process::{Command, Stdio};
use thiserror::Error;

/// Administrative directories appended to PATH before any tool lookup.
const SBIN_DIRS: &[&str] = &["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// Tools every run needs, regardless of mode.
pub const REQUIRED_TOOLS: &[&str] = &[
    "losetup", "sfdisk", "rsync", "mount", "umount", "df", "lsblk", "truncate", "sync",
];

/// Additional tools needed when root resizing is requested.
pub const RESIZE_TOOLS: &[&str] = &["fsck", "resize2fs"];

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("required tool '{0}' not found in PATH")]
    NotFound(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with status {code}")]
    Failed {
        program: String,
        code: i32,
        output: String,
    },
}

/// The single seam in front of the external tool matrix (`losetup`,
/// `sfdisk`, `rsync`, ...); tests substitute a scripted implementation
/// without touching a block device.
pub trait Runner {
    /// Run a command to completion. In debug mode the child inherits the
    /// terminal; otherwise combined stdout+stderr is buffered and shown
    /// only when the command fails.
    fn run(&self, program: &str, args: &[&str]) -> Result<(), CommandError>;

    /// Run a command and capture combined stdout+stderr.
    fn run_capture(&self, program: &str, args: &[&str]) -> Result<String, CommandError>;

    /// Run a command with a string piped to stdin (sfdisk restore).
    fn run_with_input(&self, program: &str, args: &[&str], input: &str)
        -> Result<(), CommandError>;
}

/// Runner backed by real child processes.
pub struct SystemRunner {
    debug: bool,
}

impl SystemRunner {
    pub fn new(debug: bool) -> Self {
        extend_path();
        Self { debug }
    }

    fn echo(&self, program: &str, args: &[&str]) {
        if self.debug {
            eprintln!("{} {} {}", "+".dimmed(), program, args.join(" ").dimmed());
        }
    }

    fn capture(
        &self,
        program: &str,
        args: &[&str],
        input: Option<&str>,
    ) -> Result<(i32, String), CommandError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if input.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| map_spawn_err(program, e))?;

        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| map_spawn_err(program, e))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| map_spawn_err(program, e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code().unwrap_or(-1), combined))
    }
}

impl Runner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), CommandError> {
        self.echo(program, args);

        if self.debug {
            // Stream child output straight to the terminal.
            let status = Command::new(program)
                .args(args)
                .status()
                .map_err(|e| map_spawn_err(program, e))?;
            if !status.success() {
                return Err(CommandError::Failed {
                    program: program.to_string(),
                    code: status.code().unwrap_or(-1),
                    output: String::new(),
                });
            }
            return Ok(());
        }

        let (code, output) = self.capture(program, args, None)?;
        if code != 0 {
            if !output.is_empty() {
                eprint!("{}", output);
            }
            return Err(CommandError::Failed {
                program: program.to_string(),
                code,
                output,
            });
        }
        Ok(())
    }

    fn run_capture(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        self.echo(program, args);
        let (code, output) = self.capture(program, args, None)?;
        if code != 0 {
            return Err(CommandError::Failed {
                program: program.to_string(),
                code,
                output,
            });
        }
        Ok(output)
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> Result<(), CommandError> {
        self.echo(program, args);
        let (code, output) = self.capture(program, args, Some(input))?;
        if code != 0 {
            if !output.is_empty() {
                eprint!("{}", output);
            }
            return Err(CommandError::Failed {
                program: program.to_string(),
                code,
                output,
            });
        }
        Ok(())
    }
}

fn map_spawn_err(program: &str, err: std::io::Error) -> CommandError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return CommandError::NotFound(program.to_string());
    }
    CommandError::Spawn {
        program: program.to_string(),
        source: err,
    }
}

/// Append the administrative sbin directories to PATH so tool lookup works
/// from a plain user shell elevated with sudo.
fn extend_path() {
    let current = std::env::var("PATH").unwrap_or_default();
    let mut parts: Vec<&str> = current.split(':').filter(|p| !p.is_empty()).collect();
    for dir in SBIN_DIRS {
        if !parts.contains(dir) {
            parts.push(dir);
        }
    }
    std::env::set_var("PATH", parts.join(":"));
}

/// Verify the given tools resolve in PATH; fail naming the first missing one.
pub fn check_tools(tools: &[&str]) -> Result<(), CommandError> {
    for tool in tools {
        if which::which(tool).is_err() {
            return Err(CommandError::NotFound(tool.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
pub mod testing {
    //! A scripted runner standing in for the external tool matrix.

    use super::{CommandError, Runner};
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};

    #[derive(Default)]
    pub struct ScriptedRunner {
        /// Every invocation, as a single command line, in order.
        pub calls: RefCell<Vec<String>>,
        outputs: RefCell<HashMap<String, VecDeque<String>>>,
        fail_on: RefCell<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue an output for the next `run_capture` of `program`.
        pub fn expect_output(&self, program: &str, output: &str) {
            self.outputs
                .borrow_mut()
                .entry(program.to_string())
                .or_default()
                .push_back(output.to_string());
        }

        /// Make any command line containing `needle` fail with exit 1.
        pub fn fail_matching(&self, needle: &str) {
            self.fail_on.borrow_mut().push(needle.to_string());
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        fn record(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
            let line = if args.is_empty() {
                program.to_string()
            } else {
                format!("{} {}", program, args.join(" "))
            };
            self.calls.borrow_mut().push(line.clone());
            if self.fail_on.borrow().iter().any(|n| line.contains(n)) {
                return Err(CommandError::Failed {
                    program: program.to_string(),
                    code: 1,
                    output: String::new(),
                });
            }
            Ok(line)
        }
    }

    impl Runner for ScriptedRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<(), CommandError> {
            self.record(program, args).map(|_| ())
        }

        fn run_capture(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
            self.record(program, args)?;
            match self
                .outputs
                .borrow_mut()
                .get_mut(program)
                .and_then(|q| q.pop_front())
            {
                Some(out) => Ok(out),
                None => panic!("no scripted output queued for '{}'", program),
            }
        }

        fn run_with_input(
            &self,
            program: &str,
            args: &[&str],
            input: &str,
        ) -> Result<(), CommandError> {
            let line = self.record(program, args)?;
            // Keep the piped text inspectable alongside the command line.
            self.calls
                .borrow_mut()
                .push(format!("{} <<EOF\n{}EOF", line, input));
            Ok(())
        }
    }
}
