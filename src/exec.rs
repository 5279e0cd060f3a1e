// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Build command execution.
//!
//! Build commands are opaque strings handed to the host shell. The only
//! polymorphism involved is picking which string to run, which is keyed by
//! [`HostOs`].

use std::{
    ffi::OsStr,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::File,
    io::{self, Read, Write},
    path::Path,
    process::{Command, ExitStatus, Stdio},
    thread,
};
use tracing::{debug, instrument};

/// Operating system families a target can define build commands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOs {
    Linux,
    Windows,
    Darwin,
}

impl HostOs {
    /// Family of the running host, if supported.
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Self::Linux)
        } else if cfg!(target_os = "windows") {
            Some(Self::Windows)
        } else if cfg!(target_os = "macos") {
            Some(Self::Darwin)
        } else {
            None
        }
    }

    /// Name used in configuration files and build metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::Darwin => "darwin",
        }
    }
}

impl Display for HostOs {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Name of the running host's operating system, supported or not.
pub fn host_os_name() -> &'static str {
    HostOs::current()
        .map(|os| os.as_str())
        .unwrap_or(std::env::consts::OS)
}

/// Name of the running host's CPU architecture.
pub fn host_arch_name() -> &'static str {
    std::env::consts::ARCH
}

/// Where command output goes.
#[derive(Debug)]
pub struct OutputSink {
    /// File receiving combined stdout and stderr.
    pub log: File,

    /// Also copy output to the console as it arrives.
    pub mirror: bool,
}

/// Layer of indirection for running build commands.
pub trait CommandRunner {
    /// Run shell command to completion.
    ///
    /// Environment entries are added on top of the inherited environment.
    fn run(
        &self,
        cwd: &Path,
        command: &str,
        env: &[(String, String)],
        sink: OutputSink,
    ) -> Result<ExitStatus>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(
        &self,
        cwd: &Path,
        command: &str,
        env: &[(String, String)],
        sink: OutputSink,
    ) -> Result<ExitStatus> {
        (**self).run(cwd, command, env, sink)
    }
}

/// Run commands through the host shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl ShellRunner {
    /// Construct new shell runner.
    pub fn new() -> Self {
        Self
    }

    fn shell_command(command: &str) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", command]);
            cmd
        } else {
            let mut cmd = Command::new("/bin/sh");
            cmd.args(["-c", command]);
            cmd
        }
    }
}

impl CommandRunner for ShellRunner {
    #[instrument(skip(self, env, sink), level = "debug")]
    fn run(
        &self,
        cwd: &Path,
        command: &str,
        env: &[(String, String)],
        sink: OutputSink,
    ) -> Result<ExitStatus> {
        let mut cmd = Self::shell_command(command);
        cmd.current_dir(cwd)
            .envs(env.iter().map(|(key, value)| (OsStr::new(key), OsStr::new(value))))
            .stdin(Stdio::null());

        if !sink.mirror {
            cmd.stdout(sink.log.try_clone()?).stderr(sink.log);
            let status = cmd.status().map_err(|source| ExecError::Spawn {
                source,
                command: command.into(),
            })?;
            debug!("{command:?} exited with {status}");
            return Ok(status);
        }

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            source,
            command: command.into(),
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_log = sink.log.try_clone()?;
        let stderr_log = sink.log;

        thread::scope(|scope| -> Result<()> {
            let out = stdout.map(|pipe| scope.spawn(move || tee(pipe, io::stdout(), stdout_log)));
            let err = stderr.map(|pipe| scope.spawn(move || tee(pipe, io::stderr(), stderr_log)));
            for handle in [out, err].into_iter().flatten() {
                handle.join().map_err(|_| ExecError::Mirror)??;
            }
            Ok(())
        })?;

        let status = child.wait()?;
        debug!("{command:?} exited with {status}");
        Ok(status)
    }
}

fn tee(mut pipe: impl Read, mut console: impl Write, mut log: File) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let read = match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        log.write_all(&buf[..read])?;

        // Console going away must not stop the log.
        let _ = console.write_all(&buf[..read]);
        let _ = console.flush();
    }

    log.flush()
}

/// Command execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Shell could not be started.
    #[error("failed to spawn {command:?}")]
    Spawn {
        #[source]
        source: io::Error,
        command: String,
    },

    /// Output mirroring thread panicked.
    #[error("output mirroring thread panicked")]
    Mirror,

    /// Pipes or log file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = ExecError> = std::result::Result<T, E>;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::read_to_string;

    fn run(command: &str, env: &[(String, String)], mirror: bool) -> anyhow::Result<(ExitStatus, String)> {
        let tmp = tempfile::tempdir()?;
        let log_path = tmp.path().join("build.log");
        let sink = OutputSink {
            log: File::create(&log_path)?,
            mirror,
        };
        let status = ShellRunner::new().run(tmp.path(), command, env, sink)?;

        Ok((status, read_to_string(log_path)?))
    }

    #[test]
    fn capture_combined_output() -> anyhow::Result<()> {
        let (status, log) = run("echo out; echo err 1>&2", &[], false)?;
        assert!(status.success());
        assert!(log.contains("out\n"));
        assert!(log.contains("err\n"));

        Ok(())
    }

    #[test]
    fn mirror_still_writes_log() -> anyhow::Result<()> {
        let (status, log) = run("echo mirrored", &[], true)?;
        assert!(status.success());
        assert_eq!(log, "mirrored\n");

        Ok(())
    }

    #[test]
    fn append_target_environment() -> anyhow::Result<()> {
        let env = vec![("NIGIRI_TEST_VALUE".to_string(), "sushi".to_string())];
        let (_, log) = run("echo $NIGIRI_TEST_VALUE", &env, false)?;
        assert_eq!(log, "sushi\n");

        Ok(())
    }

    #[test]
    fn report_failing_exit_status() -> anyhow::Result<()> {
        let (status, _) = run("exit 3", &[], false)?;
        assert_eq!(status.code(), Some(3));

        Ok(())
    }
}
