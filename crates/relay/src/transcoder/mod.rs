//! Transcoder modules for the relay

pub mod command;
pub mod process;
pub mod supervisor;

pub use command::{build_transcoder_args, build_transcoder_command, Invocation, StreamSource};
pub use process::{
    FfmpegLauncher, ProcessControl, ProcessExit, ProcessLauncher, SpawnedProcess, STOP_SIGNAL,
};
pub use supervisor::{RestartPolicy, StreamState, TranscoderOutputs, TranscoderSupervisor};
