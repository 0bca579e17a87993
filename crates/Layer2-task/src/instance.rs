//! Process instance - lifecycle of one supervised IOC
//!
//! `start()` spawns the launch command with three pipes; `stop()` kills the
//! child, waits for it (the only blocking call in the core), and closes the
//! pipes. `drain()` is the per-tick non-blocking read of both output streams.
//!
//! A stream that hangs up is closed for reading but the instance stays Live
//! while any other stream is still open; only when every stream has hung up
//! does `drain()` report `ChildUnresponsive`. Output queued behind a hang-up
//! is therefore always read before the instance is stopped.
//!
//! Invariant: `is_started()` ⇔ `pid() != 0` ⇔ the pipe handles are open.

use crate::discovery::InstanceDescriptor;
use crate::process::{ProcessSpec, SpawnedProcess};
use crate::state::InstanceState;
use crate::stream::{Drain, StreamBuffer, StreamKind};
use chrono::{DateTime, Utc};
use ioc_foundation::{Error, LaunchConfig, Result, StreamConfig};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-stream outcome of one `drain()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub stdout: Drain,
    pub stderr: Drain,
}

impl DrainReport {
    pub fn lines(&self) -> usize {
        self.stdout.lines() + self.stderr.lines()
    }
}

/// One output stream's buffer plus whether the child has closed it
#[derive(Debug)]
struct Channel {
    buffer: StreamBuffer,
    closed: bool,
}

impl Channel {
    fn new(buffer: StreamBuffer) -> Self {
        Self {
            buffer,
            closed: false,
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.closed = false;
    }

    /// One read attempt; a hang-up closes the channel instead of failing
    fn drain<R: Read + AsRawFd>(&mut self, source: &mut R, timeout: Duration) -> Result<Drain> {
        if self.closed {
            return Ok(Drain::Idle);
        }
        match self.buffer.drain(source, timeout) {
            Err(e) if e.is_hangup() => {
                self.closed = true;
                Ok(Drain::Idle)
            }
            other => other,
        }
    }
}

/// One discovered IOC and, while live, its child process
#[derive(Debug)]
pub struct ProcessInstance {
    descriptor: InstanceDescriptor,
    launch: LaunchConfig,
    poll_timeout: Duration,
    process: Option<SpawnedProcess>,
    stdout: Channel,
    stderr: Channel,
    started_at: Option<DateTime<Utc>>,
    last_exit: Option<ExitStatus>,
}

impl ProcessInstance {
    pub fn new(descriptor: InstanceDescriptor, launch: LaunchConfig, stream: &StreamConfig) -> Self {
        Self {
            descriptor,
            launch,
            poll_timeout: stream.poll_timeout(),
            process: None,
            stdout: Channel::new(StreamBuffer::from_config(StreamKind::Stdout, stream)),
            stderr: Channel::new(StreamBuffer::from_config(StreamKind::Stderr, stream)),
            started_at: None,
            last_exit: None,
        }
    }

    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        self.descriptor.instance_name()
    }

    pub fn state(&self) -> InstanceState {
        if self.process.is_some() {
            InstanceState::Live
        } else {
            InstanceState::Dormant
        }
    }

    pub fn is_started(&self) -> bool {
        self.process.is_some()
    }

    /// Child process id, 0 when not started
    pub fn pid(&self) -> u32 {
        self.process.as_ref().map_or(0, SpawnedProcess::pid)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Exit status collected by the most recent `stop()`
    pub fn last_exit(&self) -> Option<ExitStatus> {
        self.last_exit
    }

    pub fn command(&self) -> ProcessSpec {
        ProcessSpec::for_instance(&self.launch, &self.descriptor)
    }

    pub fn stdout(&self) -> &StreamBuffer {
        &self.stdout.buffer
    }

    pub fn stderr(&self) -> &StreamBuffer {
        &self.stderr.buffer
    }

    pub fn stream(&self, kind: StreamKind) -> &StreamBuffer {
        match kind {
            StreamKind::Stdout => &self.stdout.buffer,
            StreamKind::Stderr => &self.stderr.buffer,
        }
    }

    pub fn stream_mut(&mut self, kind: StreamKind) -> &mut StreamBuffer {
        match kind {
            StreamKind::Stdout => &mut self.stdout.buffer,
            StreamKind::Stderr => &mut self.stderr.buffer,
        }
    }

    /// Whether the child has closed `kind` since the last start
    pub fn is_closed(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Stdout => self.stdout.closed,
            StreamKind::Stderr => self.stderr.closed,
        }
    }

    /// Spawn the child; a no-op when already live
    ///
    /// On Linux the child is signalled when the calling thread exits, so call
    /// this from a thread that lives as long as the instance should.
    pub fn start(&mut self) -> Result<()> {
        if let Some(process) = &self.process {
            debug!("IOC {} already started, PID {}", self.name(), process.pid());
            return Ok(());
        }

        info!("starting IOC {} ({})", self.name(), self.descriptor.prefix());
        let process = self.command().spawn()?;
        info!("IOC {} started, PID {}", self.name(), process.pid());

        self.stdout.reset();
        self.stderr.reset();
        self.process = Some(process);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Kill the child, wait for it and close the pipes; a no-op when dormant
    ///
    /// Bookkeeping is reset even when waiting fails.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            debug!("IOC {} not started", self.name());
            return Ok(());
        };
        let pid = process.pid();
        info!("stopping IOC {}, PID {}", self.name(), pid);

        if let Err(e) = process.child.kill() {
            warn!("kill() PID {} failed: {}", pid, e);
        }
        let waited = process.child.wait();

        // Closes stdin, stdout and stderr
        drop(process);
        self.stdout.reset();
        self.stderr.reset();
        self.started_at = None;

        match waited {
            Ok(status) => {
                if let Some(code) = status.code() {
                    debug!("child {} terminated normally, status {}", pid, code);
                } else if let Some(signal) = status.signal() {
                    debug!("child {} terminated by signal {}", pid, signal);
                }
                self.last_exit = Some(status);
                info!("IOC {} stopped", self.name());
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => {
                warn!("no child {} to wait for, treating IOC {} as stopped", pid, self.name());
                Ok(())
            }
            Err(e) => {
                error!("waitpid() PID {} failed: {}", pid, e);
                Err(Error::Wait(format!("PID {}: {}", pid, e)))
            }
        }
    }

    /// Write `text` and a newline to the child's stdin
    pub fn send_command(&mut self, text: &str) -> Result<()> {
        let name = self.descriptor.instance_name();
        let Some(process) = self.process.as_mut() else {
            return Err(Error::NotRunning(name.to_string()));
        };
        debug!("new command for {} [{}] '{}'", name, text.len(), text);

        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        process.stdin.write_all(&line).map_err(|e| {
            error!("write() to {} failed: {}", name, e);
            Error::Io(e)
        })
    }

    /// One non-blocking pass over stderr then stdout
    ///
    /// A stream that hung up gets its sentinel and is skipped from then on.
    /// `ChildUnresponsive` is returned once both streams have hung up, so
    /// the caller may stop the instance.
    pub fn drain(&mut self) -> Result<DrainReport> {
        let Some(process) = self.process.as_mut() else {
            return Ok(DrainReport::default());
        };

        let stderr = self.stderr.drain(&mut process.stderr, self.poll_timeout);
        let stdout = self.stdout.drain(&mut process.stdout, self.poll_timeout);
        let report = match (stderr, stdout) {
            (Ok(stderr), Ok(stdout)) => DrainReport { stdout, stderr },
            (Err(e), _) | (_, Err(e)) => {
                error!("poll()/read() on {} failed: {}", self.descriptor.instance_name(), e);
                return Err(e);
            }
        };

        if self.stdout.closed && self.stderr.closed {
            debug!("IOC {} closed both output streams", self.name());
            return Err(Error::ChildUnresponsive(self.name().to_string()));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(script: &str) -> ProcessInstance {
        let descriptor = InstanceDescriptor::new("/tmp/stage", "cam-1", "LAB", "CAM1", "Camera 1");
        let launch = LaunchConfig::command("/bin/sh", &["-c", script, "start_ioc.sh"]);
        ProcessInstance::new(descriptor, launch, &StreamConfig::default())
    }

    #[test]
    fn test_new_instance_is_dormant() {
        let ioc = instance("exec cat");
        assert_eq!(ioc.state(), InstanceState::Dormant);
        assert!(!ioc.is_started());
        assert_eq!(ioc.pid(), 0);
        assert!(ioc.started_at().is_none());
    }

    #[test]
    fn test_stop_when_dormant_is_noop() {
        let mut ioc = instance("exec cat");
        ioc.stop().unwrap();
        assert_eq!(ioc.state(), InstanceState::Dormant);
        assert!(ioc.last_exit().is_none());
    }

    #[test]
    fn test_send_command_when_dormant() {
        let mut ioc = instance("exec cat");
        assert!(matches!(ioc.send_command("dbl"), Err(Error::NotRunning(_))));
    }

    #[test]
    fn test_drain_when_dormant() {
        let mut ioc = instance("exec cat");
        assert_eq!(ioc.drain().unwrap(), DrainReport::default());
    }

    #[test]
    fn test_start_failure_stays_dormant() {
        let descriptor = InstanceDescriptor::new("/tmp/stage", "cam-1", "LAB", "CAM1", "Camera 1");
        let launch = LaunchConfig::command("/nonexistent/start_ioc.sh", &[]);
        let mut ioc = ProcessInstance::new(descriptor, launch, &StreamConfig::default());

        assert!(matches!(ioc.start(), Err(Error::ProcessCreation(_))));
        assert_eq!(ioc.pid(), 0);
        assert!(!ioc.is_started());
    }

    #[test]
    fn test_start_stop_cycle() {
        let mut ioc = instance("exec sleep 30");
        ioc.start().unwrap();
        assert!(ioc.is_started());
        assert!(ioc.pid() > 0);

        ioc.stop().unwrap();
        assert_eq!(ioc.pid(), 0);
        assert_eq!(ioc.state(), InstanceState::Dormant);
        assert_eq!(ioc.last_exit().and_then(|s| s.signal()), Some(libc::SIGKILL));
    }

    #[test]
    fn test_stop_resets_when_child_already_reaped() {
        let mut ioc = instance("echo up; exec sleep 30");
        ioc.start().unwrap();
        for _ in 0..200 {
            ioc.drain().unwrap();
            if !ioc.stdout().lines().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ioc.stdout().lines(), &["up"]);

        // Reap the child behind the instance's back so its wait fails
        let pid = ioc.pid() as libc::pid_t;
        let mut status = 0;
        unsafe {
            libc::kill(pid, libc::SIGKILL);
            assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
        }

        ioc.stop().unwrap();
        assert_eq!(ioc.state(), InstanceState::Dormant);
        assert_eq!(ioc.pid(), 0);
        assert!(ioc.started_at().is_none());
        assert!(ioc.last_exit().is_none());
        assert!(ioc.stdout().lines().is_empty());
        assert!(!ioc.is_closed(StreamKind::Stdout));
    }
}
