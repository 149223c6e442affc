//! External tool invocation.
//!
//! Every command is launched with a discrete argv, never through a shell.
//! The [`Executor`] trait is the seam between the console and the host; the
//! system implementation wraps `std::process::Command`.

use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{error, info};

pub const QEMU_IMG: &str = "qemu-img";
pub const PKILL: &str = "pkill";

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

/// Runs a program with an argument vector
pub trait Executor: Send + Sync {
    fn execute(&self, program: &str, argv: &[String]) -> std::io::Result<RawOutput>;
}

/// Host executor backed by `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn execute(&self, program: &str, argv: &[String]) -> std::io::Result<RawOutput> {
        let output = Command::new(program)
            .args(argv)
            .stdin(Stdio::null())
            .output()?;
        Ok(RawOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // Killed by a signal
            code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Output lines and exit code of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub lines: Vec<String>,
    pub exit_code: i32,
}

impl CommandOutcome {
    pub fn is_error(&self) -> bool {
        self.exit_code != 0
    }

    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Convert a failed outcome into [`Error::Process`]
    pub fn into_result(self, command: &str) -> Result<Self> {
        if self.is_error() {
            Err(Error::Process {
                command: command.to_string(),
                message: self.text(),
            })
        } else {
            Ok(self)
        }
    }
}

/// Logs and runs external commands through an [`Executor`]
#[derive(Clone)]
pub struct ProcessInvoker {
    executor: Arc<dyn Executor>,
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self::system()
    }
}

impl ProcessInvoker {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemExecutor))
    }

    /// Copy-paste safe rendering of a command line
    pub fn command_line(program: &str, argv: &[String]) -> String {
        let mut words = Vec::with_capacity(argv.len() + 1);
        words.push(program);
        words.extend(argv.iter().map(String::as_str));
        shell_words::join(words)
    }

    /// Run `program` to completion.
    ///
    /// Launch failures and non-zero exits become an outcome whose first line
    /// starts with `error:`; this call itself does not fail.
    pub fn run(&self, program: &str, argv: &[String]) -> CommandOutcome {
        let command = Self::command_line(program, argv);
        info!(command = %command, "Executing command");

        match self.executor.execute(program, argv) {
            Err(e) => {
                error!(command = %command, error = %e, "Failed to launch command");
                CommandOutcome {
                    lines: vec![format!("error: {}", e)],
                    exit_code: -1,
                }
            }
            Ok(out) if out.code != 0 => {
                error!(command = %command, code = out.code, stderr = %out.stderr.trim(), "Command failed");
                let mut lines = vec![format!("error: command failed with code {}", out.code)];
                lines.extend(out.stderr.lines().map(str::to_string));
                CommandOutcome {
                    lines,
                    exit_code: out.code,
                }
            }
            Ok(out) => CommandOutcome {
                lines: out.stdout.lines().map(str::to_string).collect(),
                exit_code: 0,
            },
        }
    }

    /// Run and convert failure into [`Error::Process`]
    pub fn run_checked(&self, program: &str, argv: &[String]) -> Result<CommandOutcome> {
        let command = Self::command_line(program, argv);
        self.run(program, argv).into_result(&command)
    }
}

/// Resolve an existing `relative` path strictly inside `root`
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf> {
    let root = root.canonicalize()?;
    let candidate = root
        .join(relative)
        .canonicalize()
        .map_err(|_| Error::not_found("file", relative))?;
    if candidate == root || !candidate.starts_with(&root) {
        return Err(Error::PathEscape(relative.to_string()));
    }
    Ok(candidate)
}

/// Resolve a not-yet-existing file name directly under `root`
pub fn resolve_new_within(root: &Path, file_name: &str) -> Result<PathBuf> {
    let root = root.canonicalize()?;
    let name = Path::new(file_name);
    let mut components = name.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return Err(Error::PathEscape(file_name.to_string())),
    }
    let candidate = root.join(name);
    let parent = candidate
        .parent()
        .ok_or_else(|| Error::PathEscape(file_name.to_string()))?
        .canonicalize()?;
    if parent != root {
        return Err(Error::PathEscape(file_name.to_string()));
    }
    Ok(candidate)
}

#[cfg(any(test, feature = "testing"))]
pub use recording::{RecordedCall, RecordingExecutor};

#[cfg(any(test, feature = "testing"))]
mod recording {
    use super::{Executor, ProcessInvoker, RawOutput};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    type Hook = Box<dyn Fn(&str, &[String]) + Send + Sync>;

    /// One call seen by a [`RecordingExecutor`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedCall {
        pub program: String,
        pub argv: Vec<String>,
    }

    impl RecordedCall {
        pub fn command_line(&self) -> String {
            ProcessInvoker::command_line(&self.program, &self.argv)
        }
    }

    /// Executor that records calls and replays scripted outputs.
    ///
    /// With no script queued every call succeeds with empty output. A hook
    /// set through [`RecordingExecutor::on_execute`] stands in for the side
    /// effects of the real tool.
    #[derive(Default)]
    pub struct RecordingExecutor {
        calls: Mutex<Vec<RecordedCall>>,
        script: Mutex<VecDeque<std::result::Result<RawOutput, String>>>,
        hook: Mutex<Option<Hook>>,
    }

    impl RecordingExecutor {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push_output(&self, stdout: &str, code: i32) {
            self.script.lock().push_back(Ok(RawOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                code,
            }));
        }

        pub fn push_launch_error(&self, message: &str) {
            self.script.lock().push_back(Err(message.to_string()));
        }

        pub fn on_execute(&self, hook: impl Fn(&str, &[String]) + Send + Sync + 'static) {
            *self.hook.lock() = Some(Box::new(hook));
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().clone()
        }
    }

    impl Executor for RecordingExecutor {
        fn execute(&self, program: &str, argv: &[String]) -> std::io::Result<RawOutput> {
            self.calls.lock().push(RecordedCall {
                program: program.to_string(),
                argv: argv.to_vec(),
            });
            if let Some(hook) = self.hook.lock().as_ref() {
                hook(program, argv);
            }
            match self.script.lock().pop_front() {
                Some(Ok(out)) => Ok(out),
                Some(Err(msg)) => Err(std::io::Error::new(std::io::ErrorKind::NotFound, msg)),
                None => Ok(RawOutput::default()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn success_returns_stdout_lines() {
        let exec = RecordingExecutor::new();
        exec.push_output("qemu-img version 8.2.0\nCopyright", 0);
        let invoker = ProcessInvoker::new(exec.clone());

        let out = invoker.run(QEMU_IMG, &args(&["--version"]));
        assert!(!out.is_error());
        assert_eq!(out.first_line(), "qemu-img version 8.2.0");
        assert_eq!(exec.calls()[0].command_line(), "qemu-img --version");
    }

    #[test]
    fn non_zero_exit_is_error_marker() {
        let exec = RecordingExecutor::new();
        exec.push_output("", 2);
        let invoker = ProcessInvoker::new(exec);

        let out = invoker.run(QEMU_IMG, &args(&["check", "x.img"]));
        assert!(out.is_error());
        assert_eq!(out.first_line(), "error: command failed with code 2");
        assert!(out.into_result("qemu-img check x.img").is_err());
    }

    #[test]
    fn launch_failure_is_minus_one() {
        let exec = RecordingExecutor::new();
        exec.push_launch_error("No such file or directory");
        let invoker = ProcessInvoker::new(exec);

        let out = invoker.run("qemu-system-x86_64", &[]);
        assert_eq!(out.exit_code, -1);
        assert!(out.first_line().starts_with("error: "));
    }

    #[test]
    fn command_line_is_quoted() {
        let line = ProcessInvoker::command_line(PKILL, &args(&["-f", "qemu-system.*-name vm1( |$)"]));
        assert_eq!(line, "pkill -f 'qemu-system.*-name vm1( |$)'");
    }

    #[test]
    fn hook_sees_every_call() {
        let exec = RecordingExecutor::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        exec.on_execute(move |program, argv| sink.lock().push(format!("{} {}", program, argv.len())));
        let invoker = ProcessInvoker::new(exec);

        invoker.run(QEMU_IMG, &args(&["info", "a.img"]));
        invoker.run(PKILL, &[]);
        assert_eq!(*seen.lock(), vec!["qemu-img 2".to_string(), "pkill 0".to_string()]);
    }

    #[test]
    fn resolve_within_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("disk.img"), b"x").unwrap();

        let path = resolve_within(dir.path(), "disk.img").unwrap();
        assert!(path.ends_with("disk.img"));

        assert!(resolve_within(dir.path(), "../").is_err());
        assert!(resolve_within(dir.path(), ".").is_err());
        assert!(resolve_within(dir.path(), "missing.img").is_err());
    }

    #[test]
    fn resolve_new_within_root() {
        let dir = TempDir::new().unwrap();
        let path = resolve_new_within(dir.path(), "new.img").unwrap();
        assert_eq!(path.file_name().unwrap(), "new.img");

        for bad in ["../new.img", "sub/new.img", "/tmp/new.img", "..", ""] {
            assert!(resolve_new_within(dir.path(), bad).is_err(), "{}", bad);
        }
    }
}
