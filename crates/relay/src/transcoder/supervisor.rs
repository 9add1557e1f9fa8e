//! Transcoder supervisor
//!
//! Owns at most one live transcoder process per stream. Video payload and
//! diagnostic chunks are forwarded to the owner over two channels, in the
//! order the process produced them. An unexpected exit restarts the process
//! when the restart policy allows it; an exit caused by `stop()` or by the
//! stop signal never does.

use super::command::{Invocation, StreamSource};
use super::process::{ProcessControl, ProcessExit, ProcessLauncher, SpawnedProcess};
use bytes::Bytes;
use futures_util::StreamExt;
use jsmpeg_relay_config::StreamConfig;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of each output channel, in chunks
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Placeholder for the kill deadline before a stop is requested
const IDLE_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Lifecycle of a stream's transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// No process and none pending
    Stopped,
    /// First process being launched
    Starting,
    /// A process is running
    Running,
    /// Waiting to relaunch after an unexpected exit
    Restarting,
}

/// What to do when the transcoder exits on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restart after an unexpected exit
    pub restart_on_close: bool,
    /// Delay before relaunching
    pub restart_delay: Duration,
    /// Grace period between the stop signal and a forced kill
    pub stop_timeout: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            restart_on_close: true,
            restart_delay: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&StreamConfig> for RestartPolicy {
    fn from(cfg: &StreamConfig) -> Self {
        Self {
            restart_on_close: cfg.restart_on_close,
            restart_delay: Duration::from_millis(cfg.restart_delay_ms),
            stop_timeout: Duration::from_millis(cfg.stop_timeout_ms),
        }
    }
}

impl RestartPolicy {
    /// Decide whether an exit warrants a new process
    ///
    /// `stop_requested` is true when `stop()` was called on the supervisor.
    pub fn should_restart(&self, exit: &ProcessExit, stop_requested: bool) -> bool {
        self.restart_on_close && !stop_requested && !exit.is_stop_signal()
    }
}

/// Receiving ends of the supervisor's output events
pub struct TranscoderOutputs {
    /// One chunk per read from the process's standard output
    pub video: mpsc::Receiver<Bytes>,
    /// One chunk per read from the process's standard error
    pub diagnostics: mpsc::Receiver<Bytes>,
}

/// Everything the supervise task needs, cloned per run
#[derive(Clone)]
struct SuperviseContext {
    source: Arc<StreamSource>,
    invocation: Arc<Invocation>,
    policy: RestartPolicy,
    launcher: Arc<dyn ProcessLauncher>,
    video_tx: mpsc::Sender<Bytes>,
    diagnostics_tx: mpsc::Sender<Bytes>,
    state_tx: Arc<watch::Sender<StreamState>>,
    launches: Arc<AtomicU64>,
}

/// A running supervise task and its stop token
struct ActiveRun {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Supervises the transcoder process of one stream
pub struct TranscoderSupervisor {
    ctx: SuperviseContext,
    state_rx: watch::Receiver<StreamState>,
    run: Option<ActiveRun>,
}

impl TranscoderSupervisor {
    /// Create a supervisor and the channels its output is delivered on
    ///
    /// Nothing is launched until [`start`](Self::start).
    pub fn new(
        source: StreamSource,
        policy: RestartPolicy,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> (Self, TranscoderOutputs) {
        let (video_tx, video) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (diagnostics_tx, diagnostics) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(StreamState::Stopped);

        let invocation = Invocation::for_source(&source);
        let ctx = SuperviseContext {
            source: Arc::new(source),
            invocation: Arc::new(invocation),
            policy,
            launcher,
            video_tx,
            diagnostics_tx,
            state_tx: Arc::new(state_tx),
            launches: Arc::new(AtomicU64::new(0)),
        };

        let supervisor = Self {
            ctx,
            state_rx,
            run: None,
        };
        (supervisor, TranscoderOutputs { video, diagnostics })
    }

    /// Launch the transcoder
    ///
    /// Replaces any process started by an earlier call; the old one gets the
    /// stop signal and is not restarted.
    pub fn start(&mut self) {
        let previous = self.run.take().map(|previous| {
            previous.stop.cancel();
            previous.task
        });

        info!(stream = %self.ctx.source.name, "Start stream");
        self.ctx.state_tx.send_replace(StreamState::Starting);

        let stop = CancellationToken::new();
        let task = tokio::spawn(supervise(self.ctx.clone(), stop.clone(), previous));
        self.run = Some(ActiveRun { stop, task });
    }

    /// Send the stop signal to the current process, if any
    ///
    /// Returns immediately; the process exits asynchronously. Use
    /// [`stopped`](Self::stopped) to wait for it.
    pub fn stop(&mut self) {
        if let Some(run) = &self.run {
            info!(stream = %self.ctx.source.name, "Close stream");
            run.stop.cancel();
        }
    }

    /// Wait until the supervise task started by the last `start()` has ended
    pub async fn stopped(&mut self) {
        if let Some(run) = self.run.take() {
            if let Err(e) = run.task.await {
                warn!(stream = %self.ctx.source.name, error = %e, "Supervise task failed");
                self.ctx.state_tx.send_replace(StreamState::Stopped);
            }
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> StreamState {
        *self.state_rx.borrow()
    }

    /// Subscribe to lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.state_rx.clone()
    }

    /// Number of processes launched so far
    pub fn launches(&self) -> u64 {
        self.ctx.launches.load(Ordering::Relaxed)
    }

    /// Shared launch counter, for monitoring
    pub fn launch_counter(&self) -> Arc<AtomicU64> {
        self.ctx.launches.clone()
    }

    /// The invocation every launch uses
    pub fn invocation(&self) -> &Invocation {
        &self.ctx.invocation
    }
}

impl Drop for TranscoderSupervisor {
    fn drop(&mut self) {
        if let Some(run) = &self.run {
            run.stop.cancel();
        }
    }
}

/// Launch, watch and relaunch the transcoder until stopped or the policy says no
async fn supervise(
    ctx: SuperviseContext,
    stop: CancellationToken,
    previous: Option<JoinHandle<()>>,
) {
    let name = ctx.source.name.as_str();

    // One live process per stream: let a replaced run finish first.
    if let Some(previous) = previous {
        let _ = previous.await;
        ctx.state_tx.send_replace(StreamState::Starting);
    }

    loop {
        if stop.is_cancelled() {
            break;
        }

        let exit = match ctx.launcher.launch(&ctx.invocation) {
            Ok(process) => {
                let launches = ctx.launches.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    stream = name,
                    pid = process.control.id(),
                    launches,
                    "Transcoder started"
                );
                ctx.state_tx.send_replace(StreamState::Running);
                run_process(&ctx, process, &stop).await
            }
            Err(e) => {
                warn!(
                    stream = name,
                    program = %ctx.invocation.program,
                    error = %e,
                    "Failed to launch transcoder"
                );
                ProcessExit::default()
            }
        };

        let stop_requested = stop.is_cancelled();
        if !ctx.policy.should_restart(&exit, stop_requested) {
            if stop_requested || exit.is_stop_signal() {
                info!(stream = name, %exit, "Transcoder stopped");
            } else {
                warn!(stream = name, %exit, "Stream exited, restart disabled");
            }
            break;
        }

        warn!(
            stream = name,
            %exit,
            delay_ms = ctx.policy.restart_delay.as_millis() as u64,
            "Stream exited unexpectedly, restarting"
        );
        ctx.state_tx.send_replace(StreamState::Restarting);

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(ctx.policy.restart_delay) => {}
        }
    }

    ctx.state_tx.send_replace(StreamState::Stopped);
}

/// Stop requests and the forced kill that may follow them
struct Termination {
    stop_sent: bool,
    killed: bool,
}

impl Termination {
    fn new() -> Self {
        Self {
            stop_sent: false,
            killed: false,
        }
    }

    /// Send the stop signal and arm the kill deadline
    fn request_stop(
        &mut self,
        ctx: &SuperviseContext,
        control: &mut dyn ProcessControl,
        kill_deadline: Pin<&mut Sleep>,
    ) {
        self.stop_sent = true;
        send_stop(&ctx.source.name, control);
        kill_deadline.reset(Instant::now() + ctx.policy.stop_timeout);
    }

    fn force_kill(&mut self, name: &str, control: &mut dyn ProcessControl) {
        self.killed = true;
        warn!(stream = name, "Transcoder ignored the stop signal, killing it");
        if let Err(e) = control.kill() {
            warn!(stream = name, error = %e, "Failed to kill transcoder");
        }
    }

    fn kill_pending(&self) -> bool {
        self.stop_sent && !self.killed
    }
}

/// Pump one process's output until both channels close, then reap it
///
/// The exit is only collected after stdout and stderr reach EOF so every
/// chunk is delivered before a restart can begin.
async fn run_process(
    ctx: &SuperviseContext,
    process: SpawnedProcess,
    stop: &CancellationToken,
) -> ProcessExit {
    let name = ctx.source.name.as_str();
    let SpawnedProcess {
        stdout,
        stderr,
        mut control,
    } = process;

    let mut stdout = ReaderStream::new(stdout);
    let mut stderr = ReaderStream::new(stderr);
    let mut stdout_open = true;
    let mut stderr_open = true;

    let mut termination = Termination::new();
    let kill_deadline = tokio::time::sleep(IDLE_DEADLINE);
    tokio::pin!(kill_deadline);

    while stdout_open || stderr_open {
        tokio::select! {
            biased;

            _ = stop.cancelled(), if !termination.stop_sent => {
                termination.request_stop(ctx, control.as_mut(), kill_deadline.as_mut());
            }
            _ = &mut kill_deadline, if termination.kill_pending() => {
                termination.force_kill(name, control.as_mut());
            }
            chunk = stdout.next(), if stdout_open => match chunk {
                Some(Ok(bytes)) => {
                    // A closed receiver means the owner is gone; keep draining.
                    let _ = ctx.video_tx.send(bytes).await;
                }
                Some(Err(e)) => {
                    debug!(stream = name, error = %e, "Transcoder stdout read failed");
                    stdout_open = false;
                }
                None => stdout_open = false,
            },
            chunk = stderr.next(), if stderr_open => match chunk {
                Some(Ok(bytes)) => {
                    let _ = ctx.diagnostics_tx.send(bytes).await;
                }
                Some(Err(e)) => {
                    debug!(stream = name, error = %e, "Transcoder stderr read failed");
                    stderr_open = false;
                }
                None => stderr_open = false,
            },
        }
    }

    // Both pipes are closed; this loop turns at most once per stop or kill.
    let exit = loop {
        tokio::select! {
            biased;

            _ = stop.cancelled(), if !termination.stop_sent => {
                termination.request_stop(ctx, control.as_mut(), kill_deadline.as_mut());
            }
            _ = &mut kill_deadline, if termination.kill_pending() => {
                termination.force_kill(name, control.as_mut());
            }
            exit = control.wait() => break exit,
        }
    };

    match exit {
        Ok(exit) => exit,
        Err(e) => {
            warn!(stream = name, error = %e, "Failed to collect transcoder exit status");
            ProcessExit::default()
        }
    }
}

fn send_stop(name: &str, control: &mut dyn ProcessControl) {
    debug!(stream = name, pid = control.id(), "Sending stop signal to transcoder");
    if let Err(e) = control.signal_stop() {
        warn!(stream = name, error = %e, "Failed to signal transcoder");
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeHandle, FakeLauncher};
    use super::*;
    use crate::transcoder::process::STOP_SIGNAL;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn source() -> StreamSource {
        StreamSource::new(
            "cam",
            "rtsp://cam/live",
            "ffmpeg",
            vec!["-r".to_string(), "30".to_string()],
        )
    }

    fn policy(restart_on_close: bool) -> RestartPolicy {
        RestartPolicy {
            restart_on_close,
            restart_delay: Duration::ZERO,
            stop_timeout: Duration::from_millis(50),
        }
    }

    async fn next_process(rx: &mut mpsc::UnboundedReceiver<FakeHandle>) -> FakeHandle {
        timeout(WAIT, rx.recv())
            .await
            .expect("no process launched in time")
            .expect("launcher dropped")
    }

    async fn wait_for_state(supervisor: &TranscoderSupervisor, state: StreamState) {
        let mut rx = supervisor.subscribe_state();
        timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    #[test]
    fn test_restart_decision() {
        let enabled = policy(true);
        let disabled = policy(false);

        assert!(enabled.should_restart(&ProcessExit::code(1), false));
        assert!(enabled.should_restart(&ProcessExit::code(0), false));
        assert!(enabled.should_restart(&ProcessExit::signal(9), false));
        assert!(!enabled.should_restart(&ProcessExit::signal(STOP_SIGNAL), false));
        assert!(!enabled.should_restart(&ProcessExit::code(255), true));
        assert!(!disabled.should_restart(&ProcessExit::code(1), false));
        assert!(!disabled.should_restart(&ProcessExit::signal(9), false));
    }

    #[test]
    fn test_policy_from_stream_config() {
        let mut cfg = StreamConfig::new("cam", "rtsp://cam/live", 9999);
        cfg.restart_on_close = false;
        cfg.restart_delay_ms = 250;

        let policy = RestartPolicy::from(&cfg);
        assert!(!policy.restart_on_close);
        assert_eq!(policy.restart_delay, Duration::from_millis(250));
        assert_eq!(policy.stop_timeout, Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_forwards_output_in_order() {
        let (launcher, mut handles) = FakeLauncher::new();
        let (mut supervisor, mut outputs) =
            TranscoderSupervisor::new(source(), policy(true), launcher.clone());

        supervisor.start();
        let process = next_process(&mut handles).await;
        wait_for_state(&supervisor, StreamState::Running).await;

        let mut received = Vec::new();
        for i in 0..10u8 {
            process.write_stdout(&[i; 188]).await;
            let chunk = timeout(WAIT, outputs.video.recv()).await.unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        process.write_stderr(b"Input #0, rtsp, from 'rtsp://cam/live':\n").await;
        let diag = timeout(WAIT, outputs.diagnostics.recv()).await.unwrap().unwrap();

        let expected: Vec<u8> = (0..10u8).flat_map(|i| [i; 188]).collect();
        assert_eq!(received, expected);
        assert_eq!(&diag[..], b"Input #0, rtsp, from 'rtsp://cam/live':\n");

        supervisor.stop();
        supervisor.stopped().await;
    }

    #[tokio::test]
    async fn test_restarts_with_identical_invocation() {
        let (launcher, mut handles) = FakeLauncher::new();
        let (mut supervisor, _outputs) =
            TranscoderSupervisor::new(source(), policy(true), launcher.clone());

        supervisor.start();
        let first = next_process(&mut handles).await;
        first.exit(ProcessExit::code(1));

        let second = next_process(&mut handles).await;
        wait_for_state(&supervisor, StreamState::Running).await;
        assert_eq!(supervisor.launches(), 2);

        let invocations = launcher.invocations();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0], invocations[1]);
        assert_eq!(&invocations[0], supervisor.invocation());

        supervisor.stop();
        supervisor.stopped().await;
        assert_eq!(second.stop_signals(), 1);
        assert_eq!(supervisor.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_no_restart_when_disabled() {
        let (launcher, mut handles) = FakeLauncher::new();
        let (mut supervisor, _outputs) =
            TranscoderSupervisor::new(source(), policy(false), launcher.clone());

        supervisor.start();
        let process = next_process(&mut handles).await;
        process.exit(ProcessExit::code(1));

        supervisor.stopped().await;
        assert_eq!(supervisor.state(), StreamState::Stopped);
        assert_eq!(launcher.invocations().len(), 1);
        assert!(handles.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_signal_exit_is_not_restarted() {
        let (launcher, mut handles) = FakeLauncher::new();
        let (mut supervisor, _outputs) =
            TranscoderSupervisor::new(source(), policy(true), launcher.clone());

        supervisor.start();
        let process = next_process(&mut handles).await;
        // Terminated by the stop signal from outside the supervisor
        process.exit(ProcessExit::signal(STOP_SIGNAL));

        supervisor.stopped().await;
        assert_eq!(supervisor.state(), StreamState::Stopped);
        assert_eq!(supervisor.launches(), 1);
    }

    #[tokio::test]
    async fn test_stop_sends_signal_and_does_not_restart() {
        let (launcher, mut handles) = FakeLauncher::new();
        let (mut supervisor, _outputs) =
            TranscoderSupervisor::new(source(), policy(true), launcher.clone());

        supervisor.start();
        let process = next_process(&mut handles).await;
        wait_for_state(&supervisor, StreamState::Running).await;

        supervisor.stop();
        supervisor.stopped().await;

        assert_eq!(process.stop_signals(), 1);
        assert_eq!(process.kills(), 0);
        assert_eq!(supervisor.state(), StreamState::Stopped);
        assert_eq!(launcher.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_during_restart_delay() {
        let (launcher, mut handles) = FakeLauncher::new();
        let slow_restart = RestartPolicy {
            restart_delay: Duration::from_secs(60),
            ..policy(true)
        };
        let (mut supervisor, _outputs) =
            TranscoderSupervisor::new(source(), slow_restart, launcher.clone());

        supervisor.start();
        let process = next_process(&mut handles).await;
        process.exit(ProcessExit::code(1));
        wait_for_state(&supervisor, StreamState::Restarting).await;

        supervisor.stop();
        timeout(WAIT, supervisor.stopped())
            .await
            .expect("stop did not interrupt the restart delay");

        assert_eq!(supervisor.state(), StreamState::Stopped);
        assert_eq!(launcher.invocations().len(), 1);
        assert!(handles.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stubborn_process_is_killed() {
        let (launcher, mut handles) = FakeLauncher::stubborn();
        let (mut supervisor, _outputs) =
            TranscoderSupervisor::new(source(), policy(true), launcher.clone());

        supervisor.start();
        let process = next_process(&mut handles).await;
        wait_for_state(&supervisor, StreamState::Running).await;

        supervisor.stop();
        timeout(WAIT, supervisor.stopped()).await.unwrap();

        assert_eq!(process.stop_signals(), 1);
        assert_eq!(process.kills(), 1);
        assert_eq!(launcher.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_retried() {
        let (launcher, mut handles) = FakeLauncher::new();
        launcher.fail_next_launch();
        let (mut supervisor, _outputs) =
            TranscoderSupervisor::new(source(), policy(true), launcher.clone());

        supervisor.start();
        let _process = next_process(&mut handles).await;
        wait_for_state(&supervisor, StreamState::Running).await;

        assert_eq!(launcher.invocations().len(), 2);
        assert_eq!(supervisor.launches(), 1);

        supervisor.stop();
        supervisor.stopped().await;
    }

    #[tokio::test]
    async fn test_launch_failure_without_restart_stays_down() {
        let (launcher, _handles) = FakeLauncher::new();
        launcher.fail_next_launch();
        let (mut supervisor, _outputs) =
            TranscoderSupervisor::new(source(), policy(false), launcher.clone());

        supervisor.start();
        supervisor.stopped().await;

        assert_eq!(supervisor.state(), StreamState::Stopped);
        assert_eq!(supervisor.launches(), 0);
        assert_eq!(launcher.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_start_replaces_running_process() {
        let (launcher, mut handles) = FakeLauncher::new();
        let (mut supervisor, _outputs) =
            TranscoderSupervisor::new(source(), policy(true), launcher.clone());

        supervisor.start();
        let first = next_process(&mut handles).await;
        wait_for_state(&supervisor, StreamState::Running).await;

        supervisor.start();
        let second = next_process(&mut handles).await;

        // The first process was stopped before the second was launched
        assert_eq!(first.stop_signals(), 1);
        assert_eq!(second.stop_signals(), 0);
        assert_eq!(launcher.invocations().len(), 2);

        supervisor.stop();
        supervisor.stopped().await;
        assert_eq!(second.stop_signals(), 1);
    }

    #[tokio::test]
    async fn test_output_drained_before_restart() {
        let (launcher, mut handles) = FakeLauncher::new();
        let (mut supervisor, mut outputs) =
            TranscoderSupervisor::new(source(), policy(true), launcher.clone());

        supervisor.start();
        let first = next_process(&mut handles).await;
        first.write_stdout(b"first-a").await;
        first.write_stdout(b"first-b").await;
        first.exit(ProcessExit::code(1));

        let second = next_process(&mut handles).await;
        second.write_stdout(b"second").await;

        let mut received = Vec::new();
        while received.len() < b"first-afirst-bsecond".len() {
            let chunk = timeout(WAIT, outputs.video.recv()).await.unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"first-afirst-bsecond");

        supervisor.stop();
        supervisor.stopped().await;
    }
}
