//! Transcoder invocation for the relay
//!
//! Builds the ffmpeg command line that pulls an RTSP source and writes an
//! MPEG1 video elementary stream in MPEG-TS to standard output.

use jsmpeg_relay_config::StreamConfig;
use std::process::Stdio;
use tokio::process::Command;

/// Arguments placed before the caller-supplied extras.
/// RTSP over TCP, the input URL goes right after `-i`.
const INPUT_PREFIX: [&str; 3] = ["-rtsp_transport", "tcp", "-i"];

/// Output container and codec, following the input URL
const OUTPUT_FORMAT: [&str; 4] = ["-f", "mpegts", "-codec:v", "mpeg1video"];

/// Output target: standard output
const OUTPUT_TARGET: &str = "-";

/// A relayed video source. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    /// Stream name, used in logs
    pub name: String,
    /// RTSP source URL
    pub url: String,
    /// Transcoder binary
    pub ffmpeg_path: String,
    /// Extra transcoder arguments, in order
    pub ffmpeg_options: Vec<String>,
}

impl StreamSource {
    /// Create a new stream source
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        ffmpeg_path: impl Into<String>,
        ffmpeg_options: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ffmpeg_path: ffmpeg_path.into(),
            ffmpeg_options,
        }
    }
}

impl From<&StreamConfig> for StreamSource {
    fn from(cfg: &StreamConfig) -> Self {
        Self::new(
            cfg.name.clone(),
            cfg.url.clone(),
            cfg.ffmpeg_path.clone(),
            cfg.ffmpeg_options.clone(),
        )
    }
}

/// A fully resolved program + argument list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Resolve the invocation for a source
    pub fn for_source(source: &StreamSource) -> Self {
        Self {
            program: source.ffmpeg_path.clone(),
            args: build_transcoder_args(&source.url, &source.ffmpeg_options),
        }
    }
}

/// Build the transcoder argument list
///
/// `-rtsp_transport tcp -i <url> -f mpegts -codec:v mpeg1video [extra...] -`
pub fn build_transcoder_args(url: &str, extra: &[String]) -> Vec<String> {
    let mut args: Vec<String> =
        Vec::with_capacity(INPUT_PREFIX.len() + OUTPUT_FORMAT.len() + extra.len() + 2);
    args.extend(INPUT_PREFIX.iter().map(|s| s.to_string()));
    args.push(url.to_string());
    args.extend(OUTPUT_FORMAT.iter().map(|s| s.to_string()));
    args.extend(extra.iter().cloned());
    args.push(OUTPUT_TARGET.to_string());
    args
}

/// Build a tokio Command for an invocation
///
/// stdin is closed, stdout carries the video payload and stderr the
/// diagnostic text. The child is killed if its handle is dropped.
pub fn build_transcoder_command(invocation: &Invocation) -> Command {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::OsStr;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn url_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("rtsp://[a-z0-9.]{1,20}(:[0-9]{2,5})?/[a-zA-Z0-9_/]{0,20}").unwrap()
    }

    fn extra_args_strategy() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(
            prop::string::string_regex("-?[a-zA-Z0-9:_]{1,12}").unwrap(),
            0..8,
        )
    }

    // For any extra arguments A, the invocation is the fixed prefix, then A
    // in order, then the `-` output target.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_args_are_prefix_extras_suffix(
            url in url_strategy(),
            extra in extra_args_strategy(),
        ) {
            let args = build_transcoder_args(&url, &extra);

            let mut expected: Vec<String> = vec![
                "-rtsp_transport".into(), "tcp".into(), "-i".into(), url.clone(),
                "-f".into(), "mpegts".into(), "-codec:v".into(), "mpeg1video".into(),
            ];
            expected.extend(extra.iter().cloned());
            expected.push("-".into());

            prop_assert_eq!(args, expected);
        }

        #[test]
        fn prop_command_matches_invocation(
            url in url_strategy(),
            extra in extra_args_strategy(),
        ) {
            let source = StreamSource::new("cam", url, "/usr/local/bin/ffmpeg", extra);
            let invocation = Invocation::for_source(&source);
            let cmd = build_transcoder_command(&invocation);

            prop_assert_eq!(cmd.as_std().get_program(), OsStr::new("/usr/local/bin/ffmpeg"));
            prop_assert_eq!(get_command_args(&cmd), invocation.args);
        }
    }

    #[test]
    fn test_no_extra_args() {
        let args = build_transcoder_args("rtsp://cam/live", &[]);
        assert_eq!(
            args,
            vec![
                "-rtsp_transport",
                "tcp",
                "-i",
                "rtsp://cam/live",
                "-f",
                "mpegts",
                "-codec:v",
                "mpeg1video",
                "-"
            ]
        );
    }

    #[test]
    fn test_source_from_stream_config() {
        let mut cfg = StreamConfig::new("garage", "rtsp://10.0.0.9/h264", 9003);
        cfg.ffmpeg_options = vec!["-r".to_string(), "25".to_string()];

        let source = StreamSource::from(&cfg);
        assert_eq!(source.name, "garage");
        assert_eq!(source.ffmpeg_path, "ffmpeg");

        let invocation = Invocation::for_source(&source);
        assert_eq!(invocation.program, "ffmpeg");
        assert_eq!(&invocation.args[8..], &["-r", "25", "-"]);
    }
}
