//! Transcoder process capability
//!
//! The supervisor only talks to the external process through these traits,
//! so its restart logic can be driven by a fake process in tests.

use super::command::{build_transcoder_command, Invocation};
use async_trait::async_trait;
use std::io;
use std::process::ExitStatus;
use tokio::io::AsyncRead;
use tokio::process::Child;

/// Signal sent by `stop()`. An exit caused by it never triggers a restart.
pub const STOP_SIGNAL: i32 = 15;

/// Readable output channel of a process
pub type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// How a transcoder process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Build from an OS exit status
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// True if the process was terminated by the stop signal
    pub fn is_stop_signal(&self) -> bool {
        self.signal == Some(STOP_SIGNAL)
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Control half of a running process
#[async_trait]
pub trait ProcessControl: Send {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Ask the process to terminate with [`STOP_SIGNAL`]
    fn signal_stop(&mut self) -> io::Result<()>;

    /// Force the process down
    fn kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> io::Result<ProcessExit>;
}

/// A freshly started process with its two output channels
pub struct SpawnedProcess {
    /// Video payload
    pub stdout: OutputPipe,
    /// Diagnostic text
    pub stderr: OutputPipe,
    pub control: Box<dyn ProcessControl>,
}

/// Starts transcoder processes
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, invocation: &Invocation) -> io::Result<SpawnedProcess>;
}

/// Launches the real transcoder binary with tokio::process
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegLauncher;

impl ProcessLauncher for FfmpegLauncher {
    fn launch(&self, invocation: &Invocation) -> io::Result<SpawnedProcess> {
        let mut child = build_transcoder_command(invocation).spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "transcoder stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "transcoder stderr not piped"))?;

        Ok(SpawnedProcess {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            control: Box::new(ChildControl { child }),
        })
    }
}

/// [`ProcessControl`] over a tokio child process
struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn signal_stop(&mut self) -> io::Result<()> {
        send_stop_signal(&mut self.child)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(ProcessExit::from_status(status))
    }
}

#[cfg(unix)]
fn send_stop_signal(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // id() is None once the child has been reaped
    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_stop_signal(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
