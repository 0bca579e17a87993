//! OS process spawning with three piped standard streams
//!
//! On Linux the child asks the kernel for `SIGTERM` when its parent dies, so
//! an instance never outlives the launcher. The kernel ties the request to the
//! thread that forked, not the process: spawn from a thread that lives as long
//! as the child should (the supervisor worker, or the main thread). Other
//! platforms have no such primitive; [`parent_death_signal_supported`]
//! reports the capability.

use crate::discovery::InstanceDescriptor;
use ioc_foundation::{Error, LaunchConfig, Result};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, error};

/// Whether spawned children are signalled when the launcher dies
pub fn parent_death_signal_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "android"))
}

/// Program, arguments and working directory of a child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<OsString>,
    working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// `program args... mode stagePath instanceName port`
    pub fn for_instance(launch: &LaunchConfig, descriptor: &InstanceDescriptor) -> Self {
        let mut spec = Self::new(&launch.program)
            .args(&launch.args)
            .arg(&launch.mode)
            .arg(descriptor.stage_path())
            .arg(descriptor.instance_name())
            .arg(&launch.port);
        spec.working_dir = launch.working_dir.clone();
        spec
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Command line for logging
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Start the child with stdin, stdout and stderr connected to pipes
    ///
    /// On Linux the child gets `SIGTERM` when the calling thread exits.
    pub fn spawn(&self) -> Result<SpawnedProcess> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            use std::os::unix::process::CommandExt;
            let parent = std::process::id();
            // SAFETY: only async-signal-safe calls between fork and exec.
            unsafe {
                command.pre_exec(move || {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    // Parent already gone before the request took effect
                    if libc::getppid() as u32 != parent {
                        return Err(std::io::Error::from_raw_os_error(libc::ESRCH));
                    }
                    Ok(())
                });
            }
        }

        debug!("spawning '{}'", self.display());
        let mut child = command.spawn().map_err(|e| {
            error!("spawn '{}' failed: {}", self.display(), e);
            Error::ProcessCreation(format!("{}: {}", self.program.display(), e))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::ProcessCreation(format!(
                "{}: standard streams were not piped",
                self.program.display()
            )));
        };

        Ok(SpawnedProcess {
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

/// A running child and the parent's ends of its three pipes
#[derive(Debug)]
pub struct SpawnedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl SpawnedProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}
